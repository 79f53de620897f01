//! Periodic upload sinks: one ticking task per configured uploader,
//! each pulling the latest one-minute aggregate for its `pull_from_device`
//! and pushing it to a third-party network (spec.md §4.6).

pub mod aeris;
pub mod aprs;
pub mod pwsweather;
pub mod wunderground;

use std::time::Duration;

use chrono::Utc;

use crate::reading::BucketReading;
use crate::sinks::timeseries::TimeSeriesSink;

/// A `weather_1m` row is only usable for upload if it's fresher than
/// this — otherwise the tick is skipped (spec.md §4.6).
const MAX_STALENESS: Duration = Duration::from_secs(120);

/// Fetches the latest bucket for `pull_from_device`, rejecting it if
/// older than [`MAX_STALENESS`]. Shared by every ticking uploader.
pub(super) async fn fresh_latest_bucket(
    timeseries: &TimeSeriesSink,
    pull_from_device: &str,
) -> Result<BucketReading, String> {
    let bucket = timeseries
        .latest_reading(pull_from_device)
        .await
        .map_err(|e| e.to_string())?;
    let age = Utc::now().signed_duration_since(bucket.bucket);
    if age > chrono::Duration::from_std(MAX_STALENESS).unwrap() {
        return Err(format!("latest bucket for {pull_from_device} is stale ({age})"));
    }
    Ok(bucket)
}

pub(super) fn opt_f64(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}
