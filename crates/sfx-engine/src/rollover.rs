//! Day-rollover detection for TODAY-semantic click counters.
//!
//! The ad platform's counter resets at local midnight; the reset is
//! recognized when a non-positive delta coincides with the observation date
//! (in the campaign's reporting zone) moving strictly past the previous
//! observation's date. Dates are compared as rendered YYYY-MM-DD strings.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Render the date component of `at` in the campaign's zone (UTC when the
/// zone is absent or unparseable).
pub fn local_date_string(at: DateTime<Utc>, zone: Option<&str>) -> String {
    match zone.and_then(|z| z.parse::<Tz>().ok()) {
        Some(tz) => at.with_timezone(&tz).format("%Y-%m-%d").to_string(),
        None => at.format("%Y-%m-%d").to_string(),
    }
}

/// Has the counter rolled over to a fresh day?
pub fn is_day_rollover(
    delta: i64,
    last_applied_clicks: i64,
    last_observed_at: DateTime<Utc>,
    observed_at: DateTime<Utc>,
    zone: Option<&str>,
) -> bool {
    delta <= 0
        && last_applied_clicks > 0
        && local_date_string(last_observed_at, zone) < local_date_string(observed_at, zone)
}
