//! Compact duration grammar
//!
//! Relative time windows and bucketing intervals are written as `<n><unit>`
//! where unit is one of `s`, `m`, `h`, `d`, `w`, `y`:
//!
//! ```text
//! 30s  5m  1h  7d  2w  1y
//! ```
//!
//! Each backend spells these differently (`5m` in Flux and PromQL,
//! `5minute` in Graphite, `5min` in RRDtool AT-style offsets), so the
//! parsed form keeps the unit symbolic and renders per backend.

use crate::query::error::{CompileResult, QueryError};
use chrono::{DateTime, Duration, Months, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)([smhdwy])$").expect("static regex is valid"))
}

/// Unit of a relative duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Years,
}

impl DurationUnit {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "s" => Some(Self::Seconds),
            "m" => Some(Self::Minutes),
            "h" => Some(Self::Hours),
            "d" => Some(Self::Days),
            "w" => Some(Self::Weeks),
            "y" => Some(Self::Years),
            _ => None,
        }
    }

    /// Compact grammar symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
            Self::Days => "d",
            Self::Weeks => "w",
            Self::Years => "y",
        }
    }

    /// Length in seconds (years count as 365 days)
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3600,
            Self::Days => 86_400,
            Self::Weeks => 7 * 86_400,
            Self::Years => 365 * 86_400,
        }
    }
}

/// A parsed `<n><unit>` duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativeDuration {
    pub amount: u32,
    pub unit: DurationUnit,
}

impl RelativeDuration {
    pub fn new(amount: u32, unit: DurationUnit) -> Self {
        Self { amount, unit }
    }

    /// Parse the compact grammar `^(\d+)([smhdwy])$`
    pub fn parse(input: &str) -> CompileResult<Self> {
        let trimmed = input.trim();
        let caps = duration_pattern()
            .captures(trimmed)
            .ok_or_else(|| QueryError::InvalidDuration(input.to_string()))?;

        let amount = caps[1]
            .parse::<u32>()
            .map_err(|_| QueryError::InvalidDuration(input.to_string()))?;
        let unit = DurationUnit::from_symbol(&caps[2])
            .ok_or_else(|| QueryError::InvalidDuration(input.to_string()))?;

        Ok(Self { amount, unit })
    }

    /// Approximate length in seconds
    pub fn as_seconds(&self) -> i64 {
        self.amount as i64 * self.unit.seconds()
    }

    /// Step back from `end` by this duration.
    ///
    /// Years move by calendar months so that `1y` before Feb 29 lands on
    /// Feb 28 instead of drifting by a day. Windows reaching past the
    /// representable range clamp to the earliest instant.
    pub fn before(&self, end: DateTime<Utc>) -> DateTime<Utc> {
        let start = match self.unit {
            DurationUnit::Years => {
                end.checked_sub_months(Months::new(self.amount.saturating_mul(12)))
            }
            _ => Duration::try_seconds(self.as_seconds())
                .and_then(|delta| end.checked_sub_signed(delta)),
        };
        start.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Flux duration literal (`5m`)
    pub fn to_flux(&self) -> String {
        self.to_string()
    }

    /// PromQL range/step literal (`5m`)
    pub fn to_promql(&self) -> String {
        self.to_string()
    }

    /// Graphite interval string (`5minute`)
    pub fn to_graphite(&self) -> String {
        let unit = match self.unit {
            DurationUnit::Seconds => "second",
            DurationUnit::Minutes => "minute",
            DurationUnit::Hours => "hour",
            DurationUnit::Days => "day",
            DurationUnit::Weeks => "week",
            DurationUnit::Years => "year",
        };
        format!("{}{}", self.amount, unit)
    }

    /// RRDtool AT-style offset (`5min`)
    pub fn to_rrd(&self) -> String {
        let unit = match self.unit {
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "min",
            DurationUnit::Hours => "h",
            DurationUnit::Days => "d",
            DurationUnit::Weeks => "w",
            DurationUnit::Years => "y",
        };
        format!("{}{}", self.amount, unit)
    }
}

impl std::fmt::Display for RelativeDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.symbol())
    }
}

impl std::str::FromStr for RelativeDuration {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
