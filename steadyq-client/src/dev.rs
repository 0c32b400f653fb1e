use env_logger::{Builder, WriteStyle};
use std::io::Write;

/// Installs the logger used by the binaries and the demos. The log level is controlled by the
/// `RUST_LOG` environment variable. Calling it again has no effect.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{lvl}{:5}{lvl:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(WriteStyle::Always);

    let _ = builder.try_init();
}
