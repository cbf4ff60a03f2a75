use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Weekday};

use crate::clock::parse_utc_offset;
use crate::normalize::parse_slot_time;
use crate::policy::{DEFAULT_CANCEL_LEAD_MINUTES, MAX_CANCEL_LEAD_MINUTES};
use crate::validator::{BookingRules, DEFAULT_COOLDOWN_DAYS, ServiceCalendar};

const PREFIX: &str = "CHAIRBOOK_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.var, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Everything the server reads from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub utc_offset: FixedOffset,
    pub cooldown_days: u64,
    pub cancel_lead: chrono::Duration,
    pub storage_timeout: Duration,
    pub owner_email: Option<String>,
    pub calendar: Option<ServiceCalendar>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any `name -> value` source. Names are looked up with the
    /// `CHAIRBOOK_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(&format!("{PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // Server tuning: unparsable values fall back to the default.
        let port = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(5433);
        let max_connections = get("MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(256);
        let compact_threshold = get("COMPACT_THRESHOLD")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);
        let metrics_port = get("METRICS_PORT").and_then(|s| s.parse().ok());

        // Scheduling rules: a bad value is an error.
        let utc_offset = match get("UTC_OFFSET") {
            Some(s) => parse_utc_offset(&s).ok_or_else(|| invalid("UTC_OFFSET", &s))?,
            None => FixedOffset::west_opt(3 * 3600)
                .ok_or_else(|| invalid("UTC_OFFSET", "-03:00"))?,
        };
        let cooldown_days = parse_or("COOLDOWN_DAYS", get("COOLDOWN_DAYS"), DEFAULT_COOLDOWN_DAYS)?;
        let lead_minutes: i64 = parse_or(
            "CANCEL_LEAD_MINUTES",
            get("CANCEL_LEAD_MINUTES"),
            DEFAULT_CANCEL_LEAD_MINUTES,
        )?;
        if !(0..=MAX_CANCEL_LEAD_MINUTES).contains(&lead_minutes) {
            return Err(invalid("CANCEL_LEAD_MINUTES", &lead_minutes.to_string()));
        }
        let timeout_ms: u64 = parse_or("STORAGE_TIMEOUT_MS", get("STORAGE_TIMEOUT_MS"), 5000)?;
        if timeout_ms == 0 {
            return Err(invalid("STORAGE_TIMEOUT_MS", "0"));
        }

        let calendar = match get("SLOT_TIMES") {
            Some(times) => Some(parse_calendar(&times, get("OPEN_DAYS").as_deref())?),
            None if get("OPEN_DAYS").is_some() => {
                return Err(ConfigError {
                    var: format!("{PREFIX}OPEN_DAYS"),
                    reason: "requires CHAIRBOOK_SLOT_TIMES".into(),
                });
            }
            None => None,
        };

        Ok(Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "chairbook".into()),
            max_connections,
            compact_threshold,
            metrics_port,
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
            utc_offset,
            cooldown_days,
            cancel_lead: chrono::Duration::minutes(lead_minutes),
            storage_timeout: Duration::from_millis(timeout_ms),
            owner_email: get("OWNER_EMAIL"),
            calendar,
        })
    }

    pub fn booking_rules(&self) -> BookingRules {
        BookingRules {
            cooldown_days: self.cooldown_days,
            calendar: self.calendar.clone(),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError {
        var: format!("{PREFIX}{name}"),
        reason: format!("invalid value {value:?}"),
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(s) => s.parse().map_err(|_| invalid(name, &s)),
        None => Ok(default),
    }
}

fn parse_calendar(times: &str, days: Option<&str>) -> Result<ServiceCalendar, ConfigError> {
    let times = times
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_slot_time(s).map_err(|_| invalid("SLOT_TIMES", s)))
        .collect::<Result<Vec<_>, _>>()?;
    if times.is_empty() {
        return Err(invalid("SLOT_TIMES", ""));
    }

    let open_days = match days {
        Some(days) => days
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Weekday>().map_err(|_| invalid("OPEN_DAYS", s)))
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ],
    };
    Ok(ServiceCalendar::new(times, open_days))
}
