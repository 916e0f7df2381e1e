//! Transfer records returned by facade queries.

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// How a feed participates in package discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// Scanned and offered during discovery.
    Active,
    /// Known but only scanned on demand.
    Passive,
    /// Suppressed; never scanned.
    Ignored,
}

/// A package feed registered with the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub location: String,
    pub state: FeedState,
    pub last_scanned: Option<DateTime<Utc>>,
}

/// A named permission policy and its member accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub description: String,
    pub members: Vec<String>,
}

/// A recurring maintenance task registered with the OS scheduler by the
/// daemon. The client only ferries these records; registration itself
/// happens on the service side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub executable: String,
    pub command_line: String,
    pub hour: u8,
    pub minutes: u8,
    /// Weekly when set, daily otherwise.
    pub day_of_week: Option<Weekday>,
    pub interval_minutes: u32,
}
