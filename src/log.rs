use log::LevelFilter;
use std::io::Write;

/// Install the process logger.
///
/// `RUST_LOG` has priority over `level`. Records go to stderr only, the protocol descriptors
/// are never touched by the logger.
pub fn init(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
