use std::env;
use std::thread::sleep;
use std::time::Duration;

pub fn main() {
    let args: Vec<String> = env::args().collect();
    let sleep_sec: u64 = args.get(1).map_or(30, |s| s.parse().unwrap());

    println!("{}", std::process::id());
    for _ in 0..sleep_sec {
        sleep(Duration::from_secs(1));
    }
}
