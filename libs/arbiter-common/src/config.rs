// Default values shared by the judge service and its tooling

/// Internal port the build agent listens on inside its container
pub const DEFAULT_BUILD_AGENT_PORT: u16 = 7742;
/// Internal port the test agent listens on inside its container
pub const DEFAULT_TEST_AGENT_PORT: u16 = 7743;

pub const DEFAULT_STARTUP_GRACE_MS: u64 = 250;
pub const DEFAULT_AGENT_RETRIES: u32 = 3;
pub const DEFAULT_AGENT_RETRY_SPACING_MS: u64 = 500;
pub const DEFAULT_AGENT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Captured stdout/stderr are cut to this many characters before storage or logging
pub const DEFAULT_STREAM_CHAR_LIMIT: usize = 1000;
pub const DEFAULT_EVALUATOR_TIMEOUT_MS: u64 = 5000;
/// Time an evaluator interpreter may spend starting up, on top of the script budget
pub const DEFAULT_EVALUATOR_STARTUP_ALLOWANCE_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub submission_ttl_seconds: u64,
}

impl RedisSettings {
    pub fn new() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            submission_ttl_seconds: 86400,
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self::new()
    }
}
