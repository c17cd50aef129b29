use crate::layout::SEGMENT_NAME;
use std::time::Duration;

/// Bucket count used when none (or a non-positive one) is given.
pub const DEFAULT_BUCKET_COUNT: usize = 32;

/// How often a serving loop re-checks its stop flag while idle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Turns the optional, signed command-line bucket count into a usable one.
pub fn resolve_bucket_count(requested: Option<i64>) -> usize {
    match requested {
        Some(n) if n > 0 => n as usize,
        _ => DEFAULT_BUCKET_COUNT,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub segment_name: String,
    pub bucket_count: usize,
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            segment_name: SEGMENT_NAME.to_owned(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}
