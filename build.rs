fn main() {
    if !(cfg!(target_os = "linux") && cfg!(target_arch = "x86_64")) {
        panic!(
            "{} only ships an inferior operation table for linux on x86_64",
            env!("CARGO_PKG_NAME")
        );
    }
}
