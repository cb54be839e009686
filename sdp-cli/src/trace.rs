use std::str::FromStr;

use anyhow::Result;
use log::LevelFilter;

/// Wire `log` output up to stderr, so command results on stdout stay clean.
pub fn init_logging(level: &str) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] - {} - [{}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::from_str(level)?)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
