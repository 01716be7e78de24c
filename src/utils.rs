use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serializer;

fn fit_with_remainder(dividend: u64, divisor: u64) -> (u64, u64) {
    let fit = dividend / divisor;
    let remainder = dividend % divisor;
    (fit, remainder)
}

/// Time since `time`, zero if it's in the future
pub fn get_elapsed_time(time: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(time)
        .to_std()
        .unwrap_or_default()
}

/// Given a duration, format like "00:00:00"
pub fn format_elapsed_time(elapsed: Duration) -> String {
    let (hours, remainder) = fit_with_remainder(elapsed.as_secs(), 3600);
    let (minutes, seconds) = fit_with_remainder(remainder, 60);
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Raw message bytes as a lowercase hex string
pub fn serialize_hex<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&hex::encode(bytes))
}
