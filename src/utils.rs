use chrono::{DateTime, Local, Utc};

pub struct Utils {}

impl Utils {
    pub fn now_timestamp() -> i64 {
        Utc::now().timestamp()
    }

    pub fn opt_u64_to_opt_i64(opt_u64: Option<u64>) -> Option<i64> {
        opt_u64.and_then(|v| v.try_into().ok())
    }

    pub fn opt_i64_or_none_as_str(opt_i64: Option<i64>) -> String {
        match opt_i64 {
            Some(val) => val.to_string(),
            None => "-".into(),
        }
    }

    pub fn format_db_time_short(db_time: i64) -> String {
        match DateTime::<Utc>::from_timestamp(db_time, 0) {
            Some(utc) => utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "-".into(),
        }
    }

    pub fn format_db_time_short_or_none(db_time: Option<i64>) -> String {
        match db_time {
            Some(t) => Self::format_db_time_short(t),
            None => "-".into(),
        }
    }

    /// The operator name recorded on audit rows when none is given
    pub fn default_initiator() -> String {
        std::env::var("USER")
            .ok()
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| "operator".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opt_conversions() {
        assert_eq!(Utils::opt_u64_to_opt_i64(Some(7)), Some(7));
        assert_eq!(Utils::opt_u64_to_opt_i64(Some(u64::MAX)), None);
        assert_eq!(Utils::opt_i64_or_none_as_str(None), "-");
        assert_eq!(Utils::format_db_time_short_or_none(None), "-");
    }

    #[test]
    fn test_format_db_time_shape() {
        let formatted = Utils::format_db_time_short(1_700_000_000);
        assert_eq!(formatted.len(), 19);
        assert_eq!(&formatted[4..5], "-");
    }
}
