//! Macros for printing status messages to the console, and a logger that
//! prints log records the same way.
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use owo_colors::{colors, Color, OwoColorize};

#[macro_export]
macro_rules! ok {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<owo_colors::colors::Green>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        ok!($title, format!($msg, $($arg)*).as_str());
    };
}

#[macro_export]
macro_rules! info {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<owo_colors::colors::Cyan>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        info!($title, format!($msg, $($arg)*).as_str());
    };
}

#[macro_export]
macro_rules! error {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<owo_colors::colors::Red>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        error!($title, format!($msg, $($arg)*).as_str());
    };
}

pub(crate) fn print<C: Color>(title: &str, msg: &str) {
    println!("{:>12} {}", title.fg::<C>().bold(), msg);
}

struct StatusLogger;

static LOGGER: StatusLogger = StatusLogger;

impl Log for StatusLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let msg = record.args().to_string();
        match record.level() {
            Level::Error => print::<colors::Red>("Error", &msg),
            Level::Warn => print::<colors::Yellow>("Warning", &msg),
            Level::Info => print::<colors::Cyan>("Info", &msg),
            Level::Debug => print::<colors::Blue>("Debug", &msg),
            Level::Trace => print::<colors::Magenta>("Trace", &msg),
        }
    }

    fn flush(&self) {}
}

/// Routes library log records through [`print`]. Only warnings and errors
/// are shown unless `verbose` is set.
pub(crate) fn init_logger(verbose: bool) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Warn
    });
    Ok(())
}
