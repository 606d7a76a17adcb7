//! Core domain model for the Capitol Grounds permit tracker.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "permits-core";

/// Approval state shown on the calendar listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermitStatus {
    Approved,
    Pending,
}

impl PermitStatus {
    /// The calendar marks approved permits with a green inline style on the
    /// entry anchor; everything else is pending.
    pub fn from_style_attr(style: Option<&str>) -> Self {
        match style {
            Some(style) if style.contains("Green") => Self::Approved,
            _ => Self::Pending,
        }
    }
}

/// A single scheduled event permit, keyed by `number`.
///
/// Listing-derived fields are always present. The trailing `Option` fields
/// come from the permit's detail page and stay `None` on a skeletal record
/// until enrichment succeeds. Serialized with the camelCase keys the
/// persisted store has always used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permit {
    pub status: PermitStatus,
    pub number: String,
    pub url: String,
    pub event_sponsor: String,
    pub location_on_capitol_grounds: String,
    pub start_date_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_up_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Permit {
    pub fn is_enriched(&self) -> bool {
        self.set_up_date_time.is_some()
            && self.end_date_time.is_some()
            && self.participants.is_some()
            && self.details.is_some()
    }
}

/// Inclusive calendar window requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub begin: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    pub fn new(begin: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { begin, end }
    }

    /// Default rolling window: `today` through `today` plus two months.
    pub fn rolling_two_months(today: NaiveDate) -> Self {
        Self {
            begin: today,
            end: today.checked_add_months(Months::new(2)),
        }
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "{} through {}", self.begin, end),
            None => write!(f, "{}", self.begin),
        }
    }
}
