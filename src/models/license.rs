use chrono::{DateTime, Duration, Utc};
use postgres_types::{FromSql, ToSql};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Default validity of a freshly issued license.
pub const DEFAULT_LICENSE_VALIDITY_DAYS: i64 = 30;
/// Default offline grace period, also the fallback for unparsable stored values.
pub const DEFAULT_OFFLINE_GRACE_HOURS: i64 = 72;

/// License status as persisted in the `license_status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ToSql, FromSql)]
#[postgres(name = "license_status")]
pub enum LicenseStatus {
    #[postgres(name = "active")]
    Active,
    #[postgres(name = "revoked")]
    Revoked,
}

/// Lifecycle state of a license. `Revoked` is terminal and carries the
/// instant of revocation, so `revoked_at` exists exactly when revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseState {
    Active,
    Revoked { at: DateTime<Utc> },
}

impl LicenseState {
    /// Rebuilds the state from the two persisted columns.
    pub fn from_columns(status: LicenseStatus, revoked_at: Option<DateTime<Utc>>) -> Result<Self> {
        match (status, revoked_at) {
            (LicenseStatus::Active, None) => Ok(LicenseState::Active),
            (LicenseStatus::Revoked, Some(at)) => Ok(LicenseState::Revoked { at }),
            (status, revoked_at) => Err(AppError::Internal(format!(
                "inconsistent license row: status={:?} revoked_at={:?}",
                status, revoked_at
            ))),
        }
    }
}

/// A grant of offline access to one material on one device for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct License {
    pub id: Uuid,
    pub user_id: Uuid,
    pub material_id: Uuid,
    pub device_id: Uuid,
    pub state: LicenseState,
    pub expires_at: DateTime<Utc>,
    pub offline_grace_period: Duration,
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Current single-use validation nonce (hex).
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

impl License {
    /// Builds a new active license starting at `now`.
    pub fn new(
        user_id: Uuid,
        material_id: Uuid,
        device_id: Uuid,
        validity: Duration,
        offline_grace_period: Duration,
        nonce: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            material_id,
            device_id,
            state: LicenseState::Active,
            expires_at: now + validity,
            offline_grace_period,
            last_validated_at: None,
            nonce,
            created_at: now,
        }
    }

    pub fn status(&self) -> LicenseStatus {
        match self.state {
            LicenseState::Active => LicenseStatus::Active,
            LicenseState::Revoked { .. } => LicenseStatus::Revoked,
        }
    }

    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            LicenseState::Active => None,
            LicenseState::Revoked { at } => Some(at),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == LicenseState::Active
    }

    /// Last instant at which the license still validates. A grace period
    /// reaching past the representable range never runs out.
    pub fn grace_deadline(&self) -> DateTime<Utc> {
        grace_deadline(self.expires_at, self.offline_grace_period).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Past expiry and past the grace window.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at && now > self.grace_deadline()
    }

    /// Whether the license binds this exact (user, material, device) triple.
    pub fn binds(&self, user_id: Uuid, material_id: Uuid, device_id: Uuid) -> bool {
        self.user_id == user_id && self.material_id == material_id && self.device_id == device_id
    }
}

/// `expires_at + grace`, or `None` when it does not fit in a timestamp.
pub fn grace_deadline(expires_at: DateTime<Utc>, grace: Duration) -> Option<DateTime<Utc>> {
    expires_at.checked_add_signed(grace)
}

/// Renders a duration as a Postgres interval literal.
pub fn interval_literal(d: Duration) -> String {
    format!("{} seconds", d.num_seconds())
}

/// Parses a stored grace period.
///
/// Accepts Postgres interval output (`72:00:00`, `3 days`, `1 day 02:30:00`)
/// and Go-style durations (`72h0m0s`, `90m`). Returns `None` for anything else,
/// including negative values.
pub fn parse_grace_period(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('-') {
        return None;
    }
    if !raw.contains(' ') && !raw.contains(':') {
        return parse_go_duration(raw);
    }

    let mut total = Duration::zero();
    let mut tokens = raw.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token.contains(':') {
            total = total.checked_add(&parse_clock(token)?)?;
            continue;
        }
        let amount: i64 = token.parse().ok()?;
        if amount < 0 {
            return None;
        }
        let unit = tokens.next()?;
        let part = match unit.trim_end_matches('s') {
            "day" => Duration::try_days(amount)?,
            "hour" => Duration::try_hours(amount)?,
            "min" | "minute" => Duration::try_minutes(amount)?,
            "sec" | "second" => Duration::try_seconds(amount)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
    }
    Some(total)
}

/// `HH:MM:SS[.ffffff]`, hours may exceed 24.
fn parse_clock(token: &str) -> Option<Duration> {
    let mut parts = token.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next().unwrap_or("0").parse().ok()?;
    if parts.next().is_some() || hours < 0 || !(0..60).contains(&minutes) || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Duration::try_hours(hours)?
        .checked_add(&Duration::try_minutes(minutes)?)?
        .checked_add(&Duration::try_milliseconds((seconds * 1000.0).round() as i64)?)
}

fn parse_go_duration(raw: &str) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut number = String::new();
    let mut chars = raw.chars().peekable();
    let mut seen_unit = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let millis = match c {
            'h' => value * 3_600_000.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                value
            }
            'm' => value * 60_000.0,
            's' => value * 1000.0,
            _ => return None,
        };
        // `as i64` saturates, so range-check before converting.
        if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
            return None;
        }
        total = total.checked_add(&Duration::try_milliseconds(millis.round() as i64)?)?;
        seen_unit = true;
    }

    if !number.is_empty() || !seen_unit {
        return None;
    }
    Some(total)
}
