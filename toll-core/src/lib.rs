pub mod apikey;
pub mod db;
pub mod id;
pub mod money;

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since Unix epoch
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as i64
}

/// Returns the most recent UTC midnight at or before the given timestamp
pub fn utc_midnight(unix_time_ms: i64) -> i64 {
    unix_time_ms - unix_time_ms.rem_euclid(86_400_000)
}

#[cfg(test)]
mod tests {
    use super::utc_midnight;

    #[test]
    fn midnight_floors_to_day_boundary() {
        assert_eq!(utc_midnight(0), 0);

        assert_eq!(utc_midnight(86_400_000), 86_400_000);

        assert_eq!(utc_midnight(86_400_001), 86_400_000);

        assert_eq!(utc_midnight(2 * 86_400_000 - 1), 86_400_000);
    }
}
