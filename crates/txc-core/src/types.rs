//! Connector log level.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::TxcError;

/// Depth of the connector's own log files (XDF*.log, DSP*.txt, TS*.log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "LogLevelRepr")]
#[repr(i32)]
pub enum LogLevel {
    Minimum = 1,
    #[default]
    Default = 2,
    Maximum = 3,
}

impl LogLevel {
    /// Value passed to `Initialize` / `SetLogLevel`.
    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl From<u8> for LogLevel {
    fn from(v: u8) -> Self {
        match v {
            1 => LogLevel::Minimum,
            3 => LogLevel::Maximum,
            _ => LogLevel::Default,
        }
    }
}

impl FromStr for LogLevel {
    type Err = TxcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Ok(n.into());
        }
        match s.to_ascii_lowercase().as_str() {
            "min" | "minimum" => Ok(LogLevel::Minimum),
            "default" | "standard" => Ok(LogLevel::Default),
            "max" | "maximum" => Ok(LogLevel::Maximum),
            other => Err(TxcError::Config(format!("unknown log level '{other}'"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Minimum => "minimum",
            LogLevel::Default => "default",
            LogLevel::Maximum => "maximum",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogLevelRepr {
    Number(u8),
    Name(String),
}

impl TryFrom<LogLevelRepr> for LogLevel {
    type Error = TxcError;

    fn try_from(r: LogLevelRepr) -> Result<Self, Self::Error> {
        match r {
            LogLevelRepr::Number(n) => Ok(n.into()),
            LogLevelRepr::Name(s) => s.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_numbers_fall_back_to_default() {
        assert_eq!(LogLevel::from(1), LogLevel::Minimum);
        assert_eq!(LogLevel::from(3), LogLevel::Maximum);
        assert_eq!(LogLevel::from(0), LogLevel::Default);
        assert_eq!(LogLevel::from(42), LogLevel::Default);
        assert_eq!(LogLevel::Maximum.as_raw(), 3);
    }

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!("max".parse::<LogLevel>().unwrap(), LogLevel::Maximum);
        assert_eq!(" 1 ".parse::<LogLevel>().unwrap(), LogLevel::Minimum);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn deserializes_both_forms() {
        let lv: Vec<LogLevel> = serde_json::from_str(r#"[1, "maximum", 2]"#).unwrap();
        assert_eq!(lv, vec![LogLevel::Minimum, LogLevel::Maximum, LogLevel::Default]);
    }
}
