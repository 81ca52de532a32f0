#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("inferior-server supports only linux on x86_64");

pub mod config;
pub mod inferior;
pub mod lifecycle;
pub mod log;
pub mod protocol;
pub mod server;
