// Judge service configuration, read once from the environment at startup

use crate::agent::RetryPolicy;
use crate::pipeline::JudgeSettings;
use anyhow::{bail, Context, Result};
use arbiter_common::config::{
    RedisSettings, DEFAULT_AGENT_REQUEST_TIMEOUT_MS, DEFAULT_AGENT_RETRIES,
    DEFAULT_AGENT_RETRY_SPACING_MS, DEFAULT_BUILD_AGENT_PORT, DEFAULT_EVALUATOR_STARTUP_ALLOWANCE_MS,
    DEFAULT_EVALUATOR_TIMEOUT_MS,
    DEFAULT_STARTUP_GRACE_MS, DEFAULT_STREAM_CHAR_LIMIT, DEFAULT_TEST_AGENT_PORT,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemSourceKind {
    File,
    Redis,
}

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub listen_addr: String,
    pub redis: RedisSettings,
    pub store: StoreKind,
    pub problem_source: ProblemSourceKind,
    pub problem_dir: PathBuf,
    pub agent_host: Option<String>,
    pub startup_grace: Duration,
    pub agent_retry: RetryPolicy,
    pub agent_request_timeout: Duration,
    pub evaluator_program: String,
    pub evaluator_startup_allowance: Duration,
    pub container_memory_mb: Option<u64>,
    pub container_cpus: Option<f64>,
    pub container_network: Option<String>,
    pub settings: JudgeSettings,
}

impl JudgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value lookup; unset and empty values take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let store = match get("STATUS_STORE").as_deref() {
            None | Some("redis") => StoreKind::Redis,
            Some("memory") => StoreKind::Memory,
            Some(other) => bail!("STATUS_STORE must be 'redis' or 'memory', got '{}'", other),
        };
        let problem_source = match get("PROBLEM_SOURCE").as_deref() {
            None | Some("file") => ProblemSourceKind::File,
            Some("redis") => ProblemSourceKind::Redis,
            Some(other) => bail!("PROBLEM_SOURCE must be 'file' or 'redis', got '{}'", other),
        };

        let mut redis = RedisSettings::new();
        if let Some(url) = get("REDIS_URL") {
            redis.url = url;
        }
        redis.submission_ttl_seconds = parse_or(&get, "SUBMISSION_TTL_SECS", redis.submission_ttl_seconds)?;

        let settings = JudgeSettings {
            build_agent_port: parse_or(&get, "BUILD_AGENT_PORT", DEFAULT_BUILD_AGENT_PORT)?,
            test_agent_port: parse_or(&get, "TEST_AGENT_PORT", DEFAULT_TEST_AGENT_PORT)?,
            stream_limit: parse_or(&get, "STREAM_CHAR_LIMIT", DEFAULT_STREAM_CHAR_LIMIT)?,
            evaluator_timeout: Duration::from_millis(parse_or(
                &get,
                "EVALUATOR_TIMEOUT_MS",
                DEFAULT_EVALUATOR_TIMEOUT_MS,
            )?),
        };

        Ok(Self {
            listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:7070".to_string()),
            redis,
            store,
            problem_source,
            problem_dir: PathBuf::from(get("PROBLEM_DIR").unwrap_or_else(|| "problems".to_string())),
            agent_host: get("AGENT_HOST"),
            startup_grace: Duration::from_millis(parse_or(&get, "STARTUP_GRACE_MS", DEFAULT_STARTUP_GRACE_MS)?),
            agent_retry: RetryPolicy {
                retries: parse_or(&get, "AGENT_RETRIES", DEFAULT_AGENT_RETRIES)?,
                spacing: Duration::from_millis(parse_or(
                    &get,
                    "AGENT_RETRY_SPACING_MS",
                    DEFAULT_AGENT_RETRY_SPACING_MS,
                )?),
            },
            agent_request_timeout: Duration::from_millis(parse_or(
                &get,
                "AGENT_REQUEST_TIMEOUT_MS",
                DEFAULT_AGENT_REQUEST_TIMEOUT_MS,
            )?),
            evaluator_program: get("EVALUATOR_PROGRAM").unwrap_or_else(|| "node".to_string()),
            evaluator_startup_allowance: Duration::from_millis(parse_or(
                &get,
                "EVALUATOR_STARTUP_ALLOWANCE_MS",
                DEFAULT_EVALUATOR_STARTUP_ALLOWANCE_MS,
            )?),
            container_memory_mb: parse_opt(&get, "CONTAINER_MEMORY_MB")?,
            container_cpus: parse_opt(&get, "CONTAINER_CPUS")?,
            container_network: get("CONTAINER_NETWORK"),
            settings,
        })
    }
}

fn parse_opt<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: '{}'", key, raw))
        })
        .transpose()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}
