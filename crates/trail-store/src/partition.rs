use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::model::TimeRange;

pub const DEFAULT_PARTITION: &str = "change_records_default";
pub const PARTITION_PREFIX: &str = "change_records_p";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPeriod {
    Daily,
    Monthly,
}

impl PartitionPeriod {
    /// The partition range that contains `at`.
    pub fn bounds_containing(&self, at: DateTime<Utc>) -> TimeRange {
        let date = at.date_naive();
        match self {
            PartitionPeriod::Daily => TimeRange::new(
                midnight(date),
                midnight(date + Duration::days(1)),
            ),
            PartitionPeriod::Monthly => {
                let first = first_of_month(date);
                TimeRange::new(midnight(first), midnight(first_of_next_month(first)))
            }
        }
    }

    /// The range directly after `range`, assuming `range` came from this period.
    pub fn following(&self, range: &TimeRange) -> TimeRange {
        self.bounds_containing(range.end)
    }

    pub fn partition_name(&self, range: &TimeRange) -> String {
        let start = range.start;
        match self {
            PartitionPeriod::Daily => format!(
                "{PARTITION_PREFIX}{:04}{:02}{:02}",
                start.year(),
                start.month(),
                start.day()
            ),
            PartitionPeriod::Monthly => {
                format!("{PARTITION_PREFIX}{:04}{:02}", start.year(), start.month())
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionPeriod::Daily => "daily",
            PartitionPeriod::Monthly => "monthly",
        }
    }
}

impl FromStr for PartitionPeriod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "daily" | "day" => Ok(PartitionPeriod::Daily),
            "monthly" | "month" => Ok(PartitionPeriod::Monthly),
            other => Err(format!("unknown partition period: {other}")),
        }
    }
}

impl fmt::Display for PartitionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Active,
    Archived,
    Dropped,
}

impl PartitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionState::Active => "active",
            PartitionState::Archived => "archived",
            PartitionState::Dropped => "dropped",
        }
    }
}

impl FromStr for PartitionState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(PartitionState::Active),
            "archived" => Ok(PartitionState::Archived),
            "dropped" => Ok(PartitionState::Dropped),
            other => Err(format!("unknown partition state: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    /// Move the partition into the cold namespace.
    Archive,
    /// Delete the partition's records; the catalog keeps a tombstone.
    Drop,
}

impl FromStr for RetentionAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "archive" => Ok(RetentionAction::Archive),
            "drop" => Ok(RetentionAction::Drop),
            other => Err(format!("unknown retention action: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    /// `None` for the default partition.
    pub bounds: Option<TimeRange>,
    pub state: PartitionState,
    pub record_count: u64,
    pub retired_at: Option<DateTime<Utc>>,
}

impl Partition {
    pub fn active(name: String, bounds: TimeRange) -> Self {
        Self {
            name,
            bounds: Some(bounds),
            state: PartitionState::Active,
            record_count: 0,
            retired_at: None,
        }
    }

    pub fn default_partition(record_count: u64) -> Self {
        Self {
            name: DEFAULT_PARTITION.to_string(),
            bounds: None,
            state: PartitionState::Active,
            record_count,
            retired_at: None,
        }
    }

    pub fn is_default(&self) -> bool {
        self.bounds.is_none()
    }

    /// True when the whole partition lies before `cutoff`.
    pub fn ends_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.bounds.map(|range| range.end <= cutoff).unwrap_or(false)
    }
}

/// Partition names end up in SQL identifiers; only generated shapes pass.
pub fn is_valid_partition_name(name: &str) -> bool {
    if name == DEFAULT_PARTITION {
        return true;
    }
    match name.strip_prefix(PARTITION_PREFIX) {
        Some(suffix) => {
            (suffix.len() == 6 || suffix.len() == 8) && suffix.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

fn first_of_next_month(first: NaiveDate) -> NaiveDate {
    first_of_month(first + Duration::days(32))
}
