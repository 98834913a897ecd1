//! Logger construction shared by the daemon and the tests.

use slog::{o, Drain, Level, Logger};
use std::str::FromStr;

/// Build the terminal logger a binary writes to.
///
/// `level` accepts slog level names (`trace`, `debug`, `info`, `warn`,
/// `error`, `critical`) and their short forms; anything else means `info`.
pub fn root_logger(service: &'static str, level: &str) -> Logger {
    let level = Level::from_str(level).unwrap_or(Level::Info);
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    Logger::root(drain, o!("service" => service))
}

/// Plain stdout logger for tests.
pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
