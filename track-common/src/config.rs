use std::str::FromStr;
use std::time;

use thiserror::Error;

/// A duration read from the environment as a number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected a number of milliseconds")]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

impl EnvMsDuration {
    /// Zero means "no limit", for settings such as blocking pop timeouts.
    pub fn as_timeout(&self) -> Option<time::Duration> {
        if self.0.is_zero() {
            None
        } else {
            Some(self.0)
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("string must not be empty")]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ms_duration() {
        let parsed: EnvMsDuration = "3000".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_secs(3));
        assert_eq!(parsed.as_timeout(), Some(time::Duration::from_secs(3)));

        let forever: EnvMsDuration = "0".parse().unwrap();
        assert_eq!(forever.as_timeout(), None);

        assert_eq!(
            "soon".parse::<EnvMsDuration>(),
            Err(ParseEnvMsDurationError)
        );
    }

    #[test]
    fn reject_empty_string() {
        assert!("".parse::<NonEmptyString>().is_err());
        assert_eq!(
            "monitoring-data".parse::<NonEmptyString>().unwrap().as_str(),
            "monitoring-data"
        );
    }
}
