//! slog backend for the `log` macros used across polybus

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use anyhow::{anyhow, Result};
use slog::{o, Drain};

pub use slog::Logger;

use crate::conf::logging::{Log, To};

const ASYNC_CHAN_SIZE: usize = 16 * 1024;

///Builds the slog logger described by `conf` and routes the `log` facade into it
pub fn init_logger(conf: &Log) -> Result<Logger> {
    let logger = config_logger(conf)?;
    install(logger.clone(), conf.level.inner())?;
    Ok(logger)
}

///Installs `logger` as the global `log` backend, fails if one is already set
pub fn install(logger: Logger, level: slog::Level) -> Result<()> {
    log::set_boxed_logger(Box::new(Bridge(logger)))
        .map_err(|e| anyhow!("install logger failed, {e}"))?;
    log::set_max_level(to_log_level(level).to_level_filter());
    Ok(())
}

pub fn config_logger(conf: &Log) -> Result<Logger> {
    let sink = Sink::open(conf)?;
    let format = slog_term::FullFormat::new(slog_term::PlainDecorator::new(sink)).build().fuse();
    let filtered = slog::LevelFilter::new(format, conf.level.inner()).fuse();
    let drain = slog_async::Async::new(filtered)
        .chan_size(ASYNC_CHAN_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Ok(Logger::root(drain, o!("app" => "polybus")))
}

struct Bridge(Logger);

impl log::Log for Bridge {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let location = slog::RecordLocation {
            file: record.file_static().unwrap_or("?"),
            line: record.line().unwrap_or(0),
            column: 0,
            function: "",
            module: record.module_path_static().unwrap_or("?"),
        };
        let rs = slog::RecordStatic { location: &location, level: to_slog_level(record.level()), tag: record.target() };
        self.0.log(&slog::Record::new(&rs, record.args(), slog::b!()));
    }

    fn flush(&self) {}
}

#[inline]
fn to_slog_level(level: log::Level) -> slog::Level {
    use log::Level::*;
    match level {
        Error => slog::Level::Error,
        Warn => slog::Level::Warning,
        Info => slog::Level::Info,
        Debug => slog::Level::Debug,
        Trace => slog::Level::Trace,
    }
}

#[inline]
fn to_log_level(level: slog::Level) -> log::Level {
    use slog::Level::*;
    match level {
        Critical | Error => log::Level::Error,
        Warning => log::Level::Warn,
        Info => log::Level::Info,
        Debug => log::Level::Debug,
        Trace => log::Level::Trace,
    }
}

///Formatted log lines land on stdout, in the log file, in both or nowhere
struct Sink {
    console: bool,
    file: Option<File>,
}

impl Sink {
    fn open(conf: &Log) -> Result<Self> {
        let file = match conf.to {
            To::File | To::Both => Some(open_file(conf)?),
            To::Console | To::Off => None,
        };
        Ok(Self { console: conf.to.console(), file })
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.console {
            io::stdout().write_all(buf)?;
        }
        if let Some(f) = self.file.as_mut() {
            f.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.console {
            io::stdout().flush()?;
        }
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

fn open_file(conf: &Log) -> Result<File> {
    if !conf.dir.is_empty() {
        std::fs::create_dir_all(&conf.dir).map_err(|e| anyhow!("create log dir {:?} failed, {e}", conf.dir))?;
    }
    let path = conf.path();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| anyhow!("open log file {:?} failed, {e}", path))
}
