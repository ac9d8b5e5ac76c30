//! Plugin schedules: when and how a plugin runs.
//!
//! A plugin's schedule is read from its filename: `stocks.1m.py` runs every
//! minute, `feed.streamable.rb` is kept alive as a long-lived process, and a
//! filename without a schedule token (`notes.sh`) only runs on demand. A
//! `schedule` metadata tag in the plugin header overrides the filename with
//! a cron expression.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// How a plugin is scheduled to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run at a fixed interval parsed from the filename token.
    Every { interval: Duration },
    /// Run on a cron expression from the plugin's `schedule` metadata tag.
    Cron { expression: String },
    /// Kept running as a long-lived process and restarted when it exits.
    Streamable,
    /// Only runs when explicitly requested.
    Manual,
}

impl Schedule {
    /// Whether the scheduler should drive this plugin on its own.
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, Schedule::Manual)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every { interval } => write!(f, "every {}", format_interval(*interval)),
            Schedule::Cron { expression } => write!(f, "cron {expression}"),
            Schedule::Streamable => write!(f, "streamable"),
            Schedule::Manual => write!(f, "manual"),
        }
    }
}

/// Parse an interval token of the form `<number><unit>` where the unit is
/// one of `s`, `m`, `h`, or `d`.
pub fn parse_interval(token: &str) -> Result<Duration, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidInterval {
        token: token.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = token.chars();
    let unit = chars.next_back().ok_or_else(|| invalid("empty token"))?;
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("expected digits before the unit"));
    }
    let value: u64 = digits.parse().map_err(|_| invalid("value out of range"))?;
    if value == 0 {
        return Err(invalid("interval must be greater than zero"));
    }
    let secs = match unit {
        's' => Some(value),
        'm' => value.checked_mul(60),
        'h' => value.checked_mul(3_600),
        'd' => value.checked_mul(86_400),
        other => {
            return Err(invalid(&format!("unknown unit '{other}'")));
        }
    };
    let secs = secs.ok_or_else(|| invalid("value out of range"))?;
    Ok(Duration::from_secs(secs))
}

/// Derive a plugin's display name and schedule from its filename.
///
/// The grammar is `<name>.<token>.<ext>`. A malformed token is not an
/// error: the plugin keeps the whole stem as its name and falls back to
/// manual scheduling.
pub fn from_filename(file_name: &str) -> (String, Schedule) {
    let stem = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _ext)| stem);

    match stem.rsplit_once('.') {
        Some((name, token)) if token == "streamable" => {
            (name.to_string(), Schedule::Streamable)
        }
        Some((name, token)) => match parse_interval(token) {
            Ok(interval) => (name.to_string(), Schedule::Every { interval }),
            Err(_) => (stem.to_string(), Schedule::Manual),
        },
        None => (stem.to_string(), Schedule::Manual),
    }
}

/// Parse a cron expression, validating it for later use by the scheduler.
pub fn cron_schedule(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

fn format_interval(interval: Duration) -> String {
    let secs = interval.as_secs();
    if secs > 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs > 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval_units() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_interval("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_interval_rejects_zero() {
        let err = parse_interval("0m").unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_parse_interval_rejects_unknown_unit() {
        let err = parse_interval("5x").unwrap_err();
        assert!(err.to_string().contains("unknown unit 'x'"));
    }

    #[test]
    fn test_parse_interval_rejects_missing_digits() {
        assert!(parse_interval("m").is_err());
        assert!(parse_interval("").is_err());
        assert!(parse_interval("-5m").is_err());
        assert!(parse_interval("1.5m").is_err());
    }

    #[test]
    fn test_parse_interval_rejects_overflow() {
        assert!(parse_interval("99999999999999999999s").is_err());
        assert!(parse_interval("999999999999999999d").is_err());
    }

    #[test]
    fn test_from_filename_interval() {
        let (name, schedule) = from_filename("stocks.1m.py");
        assert_eq!(name, "stocks");
        assert_eq!(
            schedule,
            Schedule::Every {
                interval: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_from_filename_streamable() {
        let (name, schedule) = from_filename("feed.streamable.rb");
        assert_eq!(name, "feed");
        assert_eq!(schedule, Schedule::Streamable);
    }

    #[test]
    fn test_from_filename_without_token_is_manual() {
        let (name, schedule) = from_filename("notes.sh");
        assert_eq!(name, "notes");
        assert_eq!(schedule, Schedule::Manual);
    }

    #[test]
    fn test_from_filename_malformed_token_falls_back_to_manual() {
        let (name, schedule) = from_filename("thing.2x.sh");
        assert_eq!(name, "thing.2x");
        assert_eq!(schedule, Schedule::Manual);
    }

    #[test]
    fn test_from_filename_without_extension() {
        let (name, schedule) = from_filename("mytool");
        assert_eq!(name, "mytool");
        assert_eq!(schedule, Schedule::Manual);
    }

    #[test]
    fn test_from_filename_dotted_name_keeps_inner_parts() {
        let (name, schedule) = from_filename("net.ping.30s.sh");
        assert_eq!(name, "net.ping");
        assert_eq!(
            schedule,
            Schedule::Every {
                interval: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_cron_schedule_valid() {
        assert!(cron_schedule("0 0 9 * * * *").is_ok());
    }

    #[test]
    fn test_cron_schedule_invalid() {
        let err = cron_schedule("not a cron").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
    }

    #[test]
    fn test_schedule_display() {
        assert_eq!(
            Schedule::Every {
                interval: Duration::from_secs(90)
            }
            .to_string(),
            "every 90s"
        );
        assert_eq!(
            Schedule::Every {
                interval: Duration::from_secs(3_600)
            }
            .to_string(),
            "every 1h"
        );
        assert_eq!(
            Schedule::Cron {
                expression: "0 0 9 * * * *".into()
            }
            .to_string(),
            "cron 0 0 9 * * * *"
        );
        assert_eq!(Schedule::Streamable.to_string(), "streamable");
        assert_eq!(Schedule::Manual.to_string(), "manual");
    }

    #[test]
    fn test_schedule_serialization_roundtrip() {
        let schedule = Schedule::Every {
            interval: Duration::from_secs(300),
        };
        let json = serde_json::to_string(&schedule).unwrap();
        let restored: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, schedule);
    }
}
