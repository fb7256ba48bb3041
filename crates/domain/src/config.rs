use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine-wide configuration, parsed once from the process environment at
/// startup into a single immutable value (§1.3, §9: "a single Config value
/// constructed at startup; environment reads happen once"). Nested-section
/// shape and named default functions follow this workspace's existing
/// `serde(default = "d_xxx")` convention; the source of truth is
/// environment variables rather than a TOML file, per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "d_enable_streaming")]
    pub enable_streaming: bool,
    #[serde(default)]
    pub trust_usage_info_prompt_tokens: bool,
    #[serde(default)]
    pub yolo_mode: bool,
    #[serde(default = "d_http_user_agent")]
    pub http_user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "d_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "d_streaming_timeout")]
    pub streaming_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: d_http_timeout(),
            streaming_timeout_secs: d_streaming_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_enable_exponential_wait_retry")]
    pub enable_exponential_wait_retry: bool,
    #[serde(default = "d_retry_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "d_retry_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "d_retry_fixed_delay")]
    pub fixed_delay_secs: u64,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enable_exponential_wait_retry: d_enable_exponential_wait_retry(),
            initial_delay_secs: d_retry_initial_delay(),
            max_delay_secs: d_retry_max_delay(),
            fixed_delay_secs: d_retry_fixed_delay(),
            max_attempts: 0,
        }
    }
}

fn d_enable_streaming() -> bool {
    true
}
fn d_http_user_agent() -> String {
    "Mozilla/5.0".to_string()
}
fn d_http_timeout() -> u64 {
    300
}
fn d_streaming_timeout() -> u64 {
    60
}
fn d_enable_exponential_wait_retry() -> bool {
    true
}
fn d_retry_initial_delay() -> u64 {
    2
}
fn d_retry_max_delay() -> u64 {
    64
}
fn d_retry_fixed_delay() -> u64 {
    10
}

impl Config {
    /// Build a `Config` from the process environment (§6). Missing optional
    /// vars fall back to the named defaults above; a present-but-unparsable
    /// value is a hard error — fail fast at startup, never mid-turn.
    pub fn from_env() -> Result<Self> {
        Self::from_env_source(|k| std::env::var(k).ok())
    }

    /// Testable variant of `from_env` that reads from an arbitrary lookup
    /// function instead of `std::env` directly.
    pub fn from_env_source(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let endpoint = get("API_ENDPOINT")
            .ok_or_else(|| Error::Config("API_ENDPOINT is required".into()))?;
        let api_key =
            get("API_KEY").ok_or_else(|| Error::Config("API_KEY is required".into()))?;
        let model = get("MODEL").ok_or_else(|| Error::Config("MODEL is required".into()))?;

        let parse_f64 = |name: &str| -> Result<Option<f64>> {
            match get(name) {
                None => Ok(None),
                Some(v) => v
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|e| Error::Config(format!("{name}: {e}"))),
            }
        };
        let parse_i64 = |name: &str| -> Result<Option<i64>> {
            match get(name) {
                None => Ok(None),
                Some(v) => v
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|e| Error::Config(format!("{name}: {e}"))),
            }
        };
        let parse_u32 = |name: &str| -> Result<Option<u32>> {
            match get(name) {
                None => Ok(None),
                Some(v) => v
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|e| Error::Config(format!("{name}: {e}"))),
            }
        };
        let parse_u64_default = |name: &str, default: u64| -> Result<u64> {
            match get(name) {
                None => Ok(default),
                Some(v) => v
                    .parse::<u64>()
                    .map_err(|e| Error::Config(format!("{name}: {e}"))),
            }
        };
        let parse_bool_default = |name: &str, default: bool| -> Result<bool> {
            match get(name) {
                None => Ok(default),
                Some(v) => match v.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    other => Err(Error::Config(format!(
                        "{name}: cannot parse {other:?} as bool"
                    ))),
                },
            }
        };

        Ok(Config {
            api: ApiConfig {
                endpoint,
                api_key,
                model,
            },
            sampling: SamplingConfig {
                temperature: parse_f64("TEMPERATURE")?,
                top_p: parse_f64("TOP_P")?,
                top_k: parse_i64("TOP_K")?,
                repetition_penalty: parse_f64("REPETITION_PENALTY")?,
                max_tokens: parse_u32("MAX_TOKENS")?,
            },
            timeouts: TimeoutConfig {
                http_timeout_secs: parse_u64_default("HTTP_TIMEOUT", d_http_timeout())?,
                streaming_timeout_secs: parse_u64_default(
                    "STREAMING_TIMEOUT",
                    d_streaming_timeout(),
                )?,
            },
            retry: RetryConfig {
                enable_exponential_wait_retry: parse_bool_default(
                    "ENABLE_EXPONENTIAL_WAIT_RETRY",
                    d_enable_exponential_wait_retry(),
                )?,
                initial_delay_secs: parse_u64_default(
                    "RETRY_INITIAL_DELAY",
                    d_retry_initial_delay(),
                )?,
                max_delay_secs: parse_u64_default("RETRY_MAX_DELAY", d_retry_max_delay())?,
                fixed_delay_secs: parse_u64_default("RETRY_FIXED_DELAY", d_retry_fixed_delay())?,
                max_attempts: parse_u32("RETRY_MAX_ATTEMPTS")?.unwrap_or(0),
            },
            enable_streaming: parse_bool_default("ENABLE_STREAMING", d_enable_streaming())?,
            trust_usage_info_prompt_tokens: parse_bool_default(
                "TRUST_USAGE_INFO_PROMPT_TOKENS",
                false,
            )?,
            yolo_mode: parse_bool_default("YOLO_MODE", false)?,
            http_user_agent: get("HTTP_USER_AGENT").unwrap_or_else(d_http_user_agent),
        })
    }
}
