pub mod config;
pub mod info;
pub mod monitor;
pub mod processors;
pub mod run;

use chrono::{Duration, Utc};

/// `night` if given, else yesterday's UTC date as `YYYYMMDD`.
pub fn resolve_night(night: Option<&str>) -> String {
    match night {
        Some(n) => n.to_string(),
        None => (Utc::now() - Duration::days(1)).format("%Y%m%d").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_night_is_kept() {
        assert_eq!(resolve_night(Some("20240101")), "20240101");
    }

    #[test]
    fn default_night_is_a_date() {
        let night = resolve_night(None);
        assert_eq!(night.len(), 8);
        assert!(night.bytes().all(|b| b.is_ascii_digit()));
    }
}
