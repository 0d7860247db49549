use std::{fs::File, path::Path};

use anyhow::Context;
use time::{
    format_description::{self, parse},
    OffsetDateTime,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Install the global tracing subscriber.
///
/// Logs go to `file` when given, to a timestamped file in the current directory when
/// `to_file` is set, and to stderr otherwise.
pub fn init_logger(to_file: bool, file: Option<&Path>, level: Level) -> anyhow::Result<()> {
    let writer = match (file, to_file) {
        (Some(path), _) => {
            let file = File::create(path)
                .with_context(|| format!("could not create log file {}", path.display()))?;
            BoxMakeWriter::new(file)
        }
        (None, true) => {
            let file_name = get_log_file_name()?;
            let file = File::create(&file_name)
                .with_context(|| format!("could not create log file {file_name}"))?;
            BoxMakeWriter::new(file)
        }
        (None, false) => BoxMakeWriter::new(std::io::stderr),
    };
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .context("invalid log time format")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).context(
        "could not set global default tracing subscriber, is another one already installed?",
    )
}

fn get_log_file_name() -> anyhow::Result<String> {
    let format = parse("[year]-[month]-[day]_[hour]:[minute]:[second]_arena_log.txt")
        .context("invalid log file name format")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format).context("could not format log file name")
}
