use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Scheduling priority applied to a launched child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Priority {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    #[default]
    High,
    RealTime,
}

impl Priority {
    /// Unix nice value the priority maps to.
    pub fn nice(self) -> i32 {
        match self {
            Priority::Idle => 19,
            Priority::BelowNormal => 10,
            Priority::Normal => 0,
            Priority::AboveNormal => -5,
            Priority::High => -10,
            Priority::RealTime => -20,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "idle" => Ok(Priority::Idle),
            "below-normal" | "belownormal" => Ok(Priority::BelowNormal),
            "normal" => Ok(Priority::Normal),
            "above-normal" | "abovenormal" => Ok(Priority::AboveNormal),
            "high" => Ok(Priority::High),
            "realtime" | "real-time" => Ok(Priority::RealTime),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl TryFrom<String> for Priority {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Idle => "idle",
            Priority::BelowNormal => "below-normal",
            Priority::Normal => "normal",
            Priority::AboveNormal => "above-normal",
            Priority::High => "high",
            Priority::RealTime => "realtime",
        };
        f.write_str(name)
    }
}

/// Whether an action waits for the entry's stagger delay afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stagger {
    Wait,
    /// Used by scheduled restarts, which happen immediately.
    Skip,
}

/// How a running child went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited after the cooperative close request.
    Closed,
    /// Ignored the close request and was force-terminated.
    Killed,
    AlreadyExited,
}

/// One daily restart time together with the day it last fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRestart {
    pub at: NaiveTime,
    pub last_fired: Option<NaiveDate>,
}

impl ScheduledRestart {
    pub fn new(at: NaiveTime) -> Self {
        Self {
            at,
            last_fired: None,
        }
    }

    pub fn is_due(&self, today: NaiveDate, time: NaiveTime) -> bool {
        self.last_fired != Some(today) && time >= self.at
    }
}
