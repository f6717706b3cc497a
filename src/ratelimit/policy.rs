//! Policy DSL parsing.
//!
//! A policy is written as `<n>r/<unit>` optionally followed by comma-separated
//! modifiers, e.g. `3r/m,spam:5,block:12d`:
//!
//! - `<n>r/<unit>` allows `n` requests per second, minute, hour or day.
//! - `spam:<n>` escalates a key once it has overflowed `n` times.
//! - `block:<n><unit>` blocks an escalated key for `n` days, hours, minutes or seconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Errors produced while parsing a policy string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("invalid max requests value [{0}] must be larger than zero")]
    InvalidMaxRequests(String),

    #[error("invalid limit [{0}] limit must be per s as second, m as minute, h as hour or d as day")]
    InvalidLimitUnit(String),

    #[error("cannot parse rate [{0}] expected <n>r/<unit>")]
    MalformedRate(String),

    #[error("cannot parse value: {0}")]
    MalformedModifier(String),

    #[error("unsupported module [{0}] must be spam or block")]
    UnsupportedModule(String),

    #[error("invalid spam value [{0}] must be larger than zero")]
    InvalidSpamValue(String),

    #[error("unsupported time duration [{0}] must be (d) for day, (h) for hour, (m) for minute or (s) for second.")]
    UnsupportedBlockUnit(String),

    #[error("invalid block value [{0}] must be a non-negative integer")]
    InvalidBlockValue(String),
}

/// A unit letter of the policy DSL.
///
/// Used both for the rate (`r/s`) and for the suffix of a `block:` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// `s`
    Second,
    /// `m`
    Minute,
    /// `h`
    Hour,
    /// `d`
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    fn as_secs(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => SECS_PER_MINUTE,
            TimeWindow::Hour => SECS_PER_HOUR,
            TimeWindow::Day => SECS_PER_DAY,
        }
    }

    /// Parse a rate unit (`s`, `m`, `h` or `d`, case-insensitive).
    pub fn from_unit(unit: &str) -> Option<Self> {
        match unit.to_ascii_lowercase().as_str() {
            "s" => Some(TimeWindow::Second),
            "m" => Some(TimeWindow::Minute),
            "h" => Some(TimeWindow::Hour),
            "d" => Some(TimeWindow::Day),
            _ => None,
        }
    }

    /// Parse the single-character unit that terminates a `block:` value.
    fn from_block_unit(unit: char) -> Option<Self> {
        match unit {
            's' => Some(TimeWindow::Second),
            'm' => Some(TimeWindow::Minute),
            'h' => Some(TimeWindow::Hour),
            'd' => Some(TimeWindow::Day),
            _ => None,
        }
    }

    /// The DSL letter for this window.
    pub fn unit(&self) -> char {
        match self {
            TimeWindow::Second => 's',
            TimeWindow::Minute => 'm',
            TimeWindow::Hour => 'h',
            TimeWindow::Day => 'd',
        }
    }
}

/// A parsed, immutable rate limiting policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    max_requests: u64,
    window: TimeWindow,
    max_to_spam: Option<u64>,
    block_duration: Option<Duration>,
}

impl Policy {
    /// Parse a policy from its textual form.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        let mut segments = text.split(',');
        // `split` always yields at least one segment.
        let rate = segments.next().unwrap_or_default().trim();

        let (max, unit) = rate
            .split_once("r/")
            .ok_or_else(|| PolicyError::MalformedRate(rate.to_string()))?;

        let max_requests = max
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| PolicyError::InvalidMaxRequests(max.to_string()))?;

        let window = TimeWindow::from_unit(unit.trim())
            .ok_or_else(|| PolicyError::InvalidLimitUnit(unit.to_string()))?;

        let mut policy = Policy {
            max_requests,
            window,
            max_to_spam: None,
            block_duration: None,
        };

        for raw in segments {
            let raw = raw.trim();
            let parts: Vec<&str> = raw.split(':').collect();
            let [name, value] = parts.as_slice() else {
                return Err(PolicyError::MalformedModifier(raw.to_string()));
            };

            match *name {
                "spam" => policy.max_to_spam = Some(parse_spam(value)?),
                "block" => policy.block_duration = parse_block(value)?,
                other => return Err(PolicyError::UnsupportedModule(other.to_string())),
            }
        }

        Ok(policy)
    }

    /// Requests allowed per interval.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// How often counters are drained.
    pub fn interval(&self) -> Duration {
        self.window.duration()
    }

    /// Number of overflows before a key is blocked, if escalation is enabled.
    pub fn max_to_spam(&self) -> Option<u64> {
        self.max_to_spam
    }

    /// How long a blocked key stays blocked, if blocking is enabled.
    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration
    }

    /// Whether overflows are recorded as offenses.
    pub fn escalates(&self) -> bool {
        self.max_to_spam.is_some()
    }

    /// Whether repeat offenders are blocked. Requires both `spam` and `block`.
    pub fn blocks(&self) -> bool {
        self.max_to_spam.is_some() && self.block_duration.is_some()
    }
}

fn parse_spam(value: &str) -> Result<u64, PolicyError> {
    value
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| PolicyError::InvalidSpamValue(value.to_string()))
}

/// Parse `<n><unit>`. A zero amount disables blocking.
fn parse_block(value: &str) -> Result<Option<Duration>, PolicyError> {
    let Some(unit) = value.chars().last() else {
        return Err(PolicyError::UnsupportedBlockUnit(String::new()));
    };
    let window = TimeWindow::from_block_unit(unit)
        .ok_or_else(|| PolicyError::UnsupportedBlockUnit(unit.to_string()))?;

    let amount = &value[..value.len() - unit.len_utf8()];
    let secs = amount
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(window.as_secs()))
        .ok_or_else(|| PolicyError::InvalidBlockValue(value.to_string()))?;

    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// Render a block duration using the largest unit that divides it evenly.
fn format_block(duration: Duration) -> String {
    let secs = duration.as_secs();
    [TimeWindow::Day, TimeWindow::Hour, TimeWindow::Minute]
        .into_iter()
        .find(|w| secs % w.as_secs() == 0)
        .map(|w| format!("{}{}", secs / w.as_secs(), w.unit()))
        .unwrap_or_else(|| format!("{}s", secs))
}

impl FromStr for Policy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Policy::parse(s)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}r/{}", self.max_requests, self.window.unit())?;
        if let Some(spam) = self.max_to_spam {
            write!(f, ",spam:{}", spam)?;
        }
        if let Some(block) = self.block_duration {
            write!(f, ",block:{}", format_block(block))?;
        }
        Ok(())
    }
}
