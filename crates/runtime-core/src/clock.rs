//! Wall-clock source used to name training sessions

use chrono::{Local, NaiveDateTime};

/// Format of session-time directory names
pub const SESSION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Supplies the current time as a formatted string
pub trait Clock: Send + Sync {
    fn now(&self, format: &str) -> String;
}

/// Local wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self, format: &str) -> String {
        Local::now().format(format).to_string()
    }
}

/// Clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    instant: NaiveDateTime,
}

impl FixedClock {
    pub fn new(instant: NaiveDateTime) -> Self {
        Self { instant }
    }

    /// Parse an instant written in [`SESSION_TIME_FORMAT`]
    pub fn parse(session_time: &str) -> crate::Result<Self> {
        NaiveDateTime::parse_from_str(session_time, SESSION_TIME_FORMAT)
            .map(Self::new)
            .map_err(|e| crate::Error::InvalidConfig {
                message: format!("invalid session time {:?}: {}", session_time, e),
            })
    }
}

impl Clock for FixedClock {
    fn now(&self, format: &str) -> String {
        self.instant.format(format).to_string()
    }
}
