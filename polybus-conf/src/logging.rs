use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

/// `[log]` section
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub to: To,
    #[serde(default)]
    pub level: Level,
    //directory of the log file, created on demand
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self { to: To::default(), level: Level::default(), dir: Self::dir_default(), file: Self::file_default() }
    }
}

impl Log {
    #[inline]
    fn dir_default() -> String {
        "/var/log/polybus".into()
    }

    #[inline]
    fn file_default() -> String {
        "polybus.log".into()
    }

    ///Full path of the log file, `file` alone when `dir` is empty
    #[inline]
    pub fn path(&self) -> PathBuf {
        if self.dir.is_empty() {
            PathBuf::from(&self.file)
        } else {
            PathBuf::from(&self.dir).join(&self.file)
        }
    }
}

/// Where log records are written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    #[default]
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }

    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
}

/// slog level parsed from its name ("debug", "info", "warn", ...).
#[derive(Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Default for Level {
    #[inline]
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    #[inline]
    fn try_from(name: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&name).map(Level).map_err(|_| format!("unknown log level {name:?}"))
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl Deref for Level {
    type Target = slog::Level;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        log: Log,
    }

    fn parse(text: &str) -> Result<Log, serde_json::Error> {
        serde_json::from_str::<Wrapper>(text).map(|w| w.log)
    }

    #[test]
    fn test_defaults() {
        let log = parse(r#"{"log": {}}"#).unwrap();
        assert_eq!(log.to, To::Console);
        assert_eq!(log.level.inner(), slog::Level::Info);
        assert_eq!(log.path(), PathBuf::from("/var/log/polybus/polybus.log"));
    }

    #[test]
    fn test_parse_target_and_level() {
        let log = parse(r#"{"log": {"to": "both", "level": "debug", "dir": "", "file": "x.log"}}"#).unwrap();
        assert!(log.to.file() && log.to.console());
        assert_eq!(*log.level, slog::Level::Debug);
        assert_eq!(log.path(), PathBuf::from("x.log"));

        assert!(parse(r#"{"log": {"to": "syslog"}}"#).is_err());
        assert!(parse(r#"{"log": {"level": "loud"}}"#).is_err());
    }
}
