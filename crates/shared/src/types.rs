//! Common types used across Tierline

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::error::SharedError;

// =============================================================================
// Enums
// =============================================================================

/// Recommendation tier a client can purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Good,
    Better,
    Best,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Better => "better",
            Self::Best => "best",
        }
    }

    /// Human-readable label used in activity descriptions
    pub fn label(&self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Better => "Better",
            Self::Best => "Best",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "good" => Ok(Self::Good),
            "better" => Ok(Self::Better),
            "best" => Ok(Self::Best),
            _ => Err(SharedError::invalid("tier", s)),
        }
    }
}

/// Recommendation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecommendationStatus {
    Draft,
    Sent,
    Accepted,
}

impl Default for RecommendationStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Accepted => "accepted",
        }
    }
}

impl std::fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecommendationStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "sent" => Ok(Self::Sent),
            "accepted" => Ok(Self::Accepted),
            _ => Err(SharedError::invalid("recommendation status", s)),
        }
    }
}

/// Local subscription status
///
/// `incomplete → active → past_due → canceled`, `incomplete → incomplete_expired`,
/// with `past_due → active` on a recovered payment and `active → canceled` on cancellation.
/// `canceled` and `incomplete_expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    PastDue,
    Canceled,
    IncompleteExpired,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Incomplete
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::IncompleteExpired => "incomplete_expired",
        }
    }

    /// Map a status string reported by the payment processor.
    ///
    /// `trialing` counts as active and `unpaid` as past due; `paused` and
    /// unknown values have no local equivalent.
    pub fn from_processor(status: &str) -> Option<Self> {
        match status {
            "incomplete" => Some(Self::Incomplete),
            "active" | "trialing" => Some(Self::Active),
            "past_due" | "unpaid" => Some(Self::PastDue),
            "canceled" => Some(Self::Canceled),
            "incomplete_expired" => Some(Self::IncompleteExpired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    /// Whether `next` is an expected lifecycle step from `self`.
    /// Re-reporting the current status is always allowed.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Incomplete => matches!(
                next,
                Self::Active | Self::IncompleteExpired | Self::Canceled
            ),
            Self::Active => matches!(next, Self::PastDue | Self::Canceled),
            Self::PastDue => matches!(next, Self::Active | Self::Canceled),
            Self::Canceled | Self::IncompleteExpired => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(Self::Incomplete),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            _ => Err(SharedError::invalid("subscription status", s)),
        }
    }
}

/// Revenue ledger change type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RevenueChangeType {
    New,
    Recurring,
}

impl RevenueChangeType {
    /// `new` for the invoice that opened the subscription, `recurring` otherwise
    pub fn from_billing_reason(billing_reason: Option<&str>) -> Self {
        match billing_reason {
            Some("subscription_create") => Self::New,
            _ => Self::Recurring,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Recurring => "recurring",
        }
    }
}

impl std::fmt::Display for RevenueChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cart item is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingCadence {
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "onetime", alias = "one_time")]
    OneTime,
}

// =============================================================================
// Money & Calendar Helpers
// =============================================================================

/// Format integer cents as dollars, e.g. `123450` → `$1,234.50`
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let dollars = (abs / 100).to_string();
    let remainder = abs % 100;

    let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
    for (i, ch) in dollars.chars().enumerate() {
        if i > 0 && (dollars.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}${}.{:02}", sign, grouped, remainder)
}

/// First day of the calendar month containing `at` (UTC)
pub fn month_start(at: OffsetDateTime) -> Date {
    let at = at.to_offset(time::UtcOffset::UTC);
    // Day 1 exists in every month
    at.date().replace_day(1).unwrap_or(at.date())
}

/// First day of the month before `month`
pub fn previous_month(month: Date) -> Date {
    let (year, prev) = match month.month() {
        Month::January => (month.year() - 1, Month::December),
        other => (month.year(), other.previous()),
    };
    Date::from_calendar_date(year, prev, 1).unwrap_or(month)
}

/// Convert a processor unix timestamp into a UTC datetime
pub fn from_unix(ts: i64) -> Result<OffsetDateTime, SharedError> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|_| SharedError::InvalidTimestamp(ts))
}
