//! Process configuration.
//!
//! Built once at start-up and handed to every component by reference; there
//! are no global settings. Sources, lowest priority first:
//! 1) built-in defaults
//! 2) TOML file: `$POLARITY_CONFIG_PATH`, else `config/polarity.toml` if present
//! 3) environment variables (the binary loads `.env` first)
//!
//! Secrets (`STREAM_BEARER_TOKEN`, `INGEST_TOKEN`) are read from the
//! environment only.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_CONFIG_PATH: &str = "POLARITY_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/polarity.toml";

const DEFAULT_STREAM_URL: &str = "https://api.twitter.com/2/tweets/search/stream";
const DEFAULT_API_URL: &str = "https://api.tinybird.co/v0";
const DEFAULT_DATASOURCE: &str = "tweets";

/// The three flush thresholds. Immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushConfig {
    pub max_wait: Duration,
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(300),
            max_records: 10_000,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Bounded retry with exponential backoff for ingestion uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Capped exponential backoff (with jitter) between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub bearer_token: String,
    pub track: Vec<String>,
    /// Value written to the `tag` column when the event carries no rule tag.
    pub tag: String,
    /// Replay a JSONL file instead of the live stream.
    pub replay_path: Option<PathBuf>,
    /// Sleep between replayed lines.
    pub replay_pace: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub api_url: String,
    pub token: String,
    pub datasource: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub delivery: DeliveryConfig,
    pub flush: FlushConfig,
    pub reconnect: ReconnectPolicy,
    pub metrics_addr: Option<SocketAddr>,
}

// ---- file layer ----

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub stream: StreamFile,
    pub delivery: DeliveryFile,
    pub flush: FlushFile,
    pub reconnect: ReconnectFile,
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamFile {
    pub url: Option<String>,
    pub track: Option<Vec<String>>,
    pub tag: Option<String>,
    pub replay_path: Option<PathBuf>,
    pub replay_pace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryFile {
    pub api_url: Option<String>,
    pub datasource: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlushFile {
    pub max_wait_secs: Option<u64>,
    pub max_records: Option<usize>,
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectFile {
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl FileConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// `$POLARITY_CONFIG_PATH` must point to an existing file; the default
    /// path is optional.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(ConfigError::File {
                    path: pb.display().to_string(),
                    reason: format!("{ENV_CONFIG_PATH} points to a non-existent path"),
                });
            }
            return Self::load_from(&pb);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }
}

impl AppConfig {
    /// Full start-up load: file layer, then process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = FileConfig::load_default()?;
        Self::resolve(file, |k| std::env::var(k).ok())
    }

    /// Merge a parsed file with an environment lookup and validate.
    pub fn resolve<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |k: &str| env(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bearer_token = var("STREAM_BEARER_TOKEN");
        let ingest_token = var("INGEST_TOKEN").ok_or(ConfigError::Missing("INGEST_TOKEN"))?;

        let track = match var("STREAM_TRACK") {
            Some(v) => split_list(&v),
            None => file.stream.track.unwrap_or_else(|| vec!["covid".to_string()]),
        };
        if track.is_empty() {
            return Err(ConfigError::Invalid {
                key: "STREAM_TRACK",
                reason: "at least one track term is required".into(),
            });
        }
        let tag = var("STREAM_TAG")
            .or(file.stream.tag)
            .unwrap_or_else(|| track[0].clone());
        let replay_path = var("STREAM_REPLAY_PATH")
            .map(PathBuf::from)
            .or(file.stream.replay_path);
        let replay_pace = parse_or(&var, "STREAM_REPLAY_PACE_MS", file.stream.replay_pace_ms)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        // The live stream needs credentials; a replay file does not.
        let bearer_token = match (bearer_token, &replay_path) {
            (Some(t), _) => t,
            (None, Some(_)) => String::new(),
            (None, None) => return Err(ConfigError::Missing("STREAM_BEARER_TOKEN")),
        };

        let stream = StreamConfig {
            url: var("STREAM_URL")
                .or(file.stream.url)
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            bearer_token,
            track,
            tag,
            replay_path,
            replay_pace,
        };

        let retry_default = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&var, "DELIVERY_MAX_ATTEMPTS", file.delivery.max_attempts)?
                .unwrap_or(retry_default.max_attempts),
            base_delay: parse_or(&var, "DELIVERY_BASE_DELAY_MS", file.delivery.base_delay_ms)?
                .map(Duration::from_millis)
                .unwrap_or(retry_default.base_delay),
            max_delay: parse_or(&var, "DELIVERY_MAX_DELAY_MS", file.delivery.max_delay_ms)?
                .map(Duration::from_millis)
                .unwrap_or(retry_default.max_delay),
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "DELIVERY_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }

        let delivery = DeliveryConfig {
            api_url: var("INGEST_API_URL")
                .or(file.delivery.api_url)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            token: ingest_token,
            datasource: var("INGEST_DATASOURCE")
                .or(file.delivery.datasource)
                .unwrap_or_else(|| DEFAULT_DATASOURCE.to_string()),
            timeout: Duration::from_secs(
                parse_or(&var, "DELIVERY_TIMEOUT_SECS", file.delivery.timeout_secs)?.unwrap_or(30),
            ),
            retry,
        };

        let flush_default = FlushConfig::default();
        let flush = FlushConfig {
            max_wait: parse_or(&var, "FLUSH_MAX_WAIT_SECS", file.flush.max_wait_secs)?
                .map(Duration::from_secs)
                .unwrap_or(flush_default.max_wait),
            max_records: parse_or(&var, "FLUSH_MAX_RECORDS", file.flush.max_records)?
                .unwrap_or(flush_default.max_records),
            max_bytes: parse_or(&var, "FLUSH_MAX_BYTES", file.flush.max_bytes)?
                .unwrap_or(flush_default.max_bytes),
        };
        if flush.max_wait.is_zero() {
            return Err(invalid("FLUSH_MAX_WAIT_SECS", "must be greater than 0"));
        }
        if flush.max_records == 0 {
            return Err(invalid("FLUSH_MAX_RECORDS", "must be greater than 0"));
        }
        if flush.max_bytes == 0 {
            return Err(invalid("FLUSH_MAX_BYTES", "must be greater than 0"));
        }

        let reconnect_default = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            initial_delay: parse_or(
                &var,
                "RECONNECT_INITIAL_DELAY_MS",
                file.reconnect.initial_delay_ms,
            )?
            .map(Duration::from_millis)
            .unwrap_or(reconnect_default.initial_delay),
            max_delay: parse_or(&var, "RECONNECT_MAX_DELAY_MS", file.reconnect.max_delay_ms)?
                .map(Duration::from_millis)
                .unwrap_or(reconnect_default.max_delay),
        };
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(invalid(
                "RECONNECT_INITIAL_DELAY_MS",
                "must not exceed RECONNECT_MAX_DELAY_MS",
            ));
        }

        let metrics_addr = match var("METRICS_ADDR").or(file.metrics_addr) {
            Some(s) => Some(s.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
                key: "METRICS_ADDR",
                reason: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            stream,
            delivery,
            flush,
            reconnect,
            metrics_addr,
        })
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// Env value wins over the file value; a present but unparsable env value is an error.
fn parse_or<T, V>(var: &V, key: &'static str, file: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("{raw:?}: {e}"),
            }),
        None => Ok(file),
    }
}

fn split_list(s: &str) -> Vec<String> {
    use std::collections::BTreeSet;
    let mut seen = BTreeSet::new();
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_with_only_secrets() {
        let env = env_of(&[("STREAM_BEARER_TOKEN", "s"), ("INGEST_TOKEN", "t")]);
        let cfg = AppConfig::resolve(FileConfig::default(), env).unwrap();
        assert_eq!(cfg.flush, FlushConfig::default());
        assert_eq!(cfg.flush.max_wait, Duration::from_secs(300));
        assert_eq!(cfg.flush.max_records, 10_000);
        assert_eq!(cfg.flush.max_bytes, 1_048_576);
        assert_eq!(cfg.delivery.retry.max_attempts, 5);
        assert_eq!(cfg.stream.track, vec!["covid".to_string()]);
        assert_eq!(cfg.stream.tag, "covid");
        assert!(cfg.metrics_addr.is_none());
    }

    #[test]
    fn missing_ingest_token_is_fatal() {
        let env = env_of(&[("STREAM_BEARER_TOKEN", "s")]);
        let err = AppConfig::resolve(FileConfig::default(), env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("INGEST_TOKEN")));
    }

    #[test]
    fn replay_mode_does_not_need_stream_credentials() {
        let env = env_of(&[("INGEST_TOKEN", "t"), ("STREAM_REPLAY_PATH", "fixtures/x.jsonl")]);
        let cfg = AppConfig::resolve(FileConfig::default(), env).unwrap();
        assert!(cfg.stream.bearer_token.is_empty());
        assert!(cfg.stream.replay_path.is_some());
        assert!(cfg.stream.replay_pace.is_none());
    }

    #[test]
    fn replay_pace_from_file_or_env() {
        let file = FileConfig::from_toml_str(
            "[stream]\nreplay_path = \"capture.jsonl\"\nreplay_pace_ms = 250\n",
        )
        .unwrap();
        let cfg = AppConfig::resolve(file.clone(), env_of(&[("INGEST_TOKEN", "t")])).unwrap();
        assert_eq!(cfg.stream.replay_pace, Some(Duration::from_millis(250)));

        let env = env_of(&[("INGEST_TOKEN", "t"), ("STREAM_REPLAY_PACE_MS", "0")]);
        let cfg = AppConfig::resolve(file, env).unwrap();
        assert!(cfg.stream.replay_pace.is_none(), "0 disables pacing");
    }

    #[test]
    fn env_overrides_file_and_lists_are_deduped() {
        let file = FileConfig::from_toml_str(
            r#"
[flush]
max_records = 50
max_bytes = 2048

[stream]
track = ["a"]
"#,
        )
        .unwrap();
        let env = env_of(&[
            ("STREAM_BEARER_TOKEN", "s"),
            ("INGEST_TOKEN", "t"),
            ("FLUSH_MAX_RECORDS", "3"),
            ("STREAM_TRACK", " covid, vaccine ,covid,"),
        ]);
        let cfg = AppConfig::resolve(file, env).unwrap();
        assert_eq!(cfg.flush.max_records, 3);
        assert_eq!(cfg.flush.max_bytes, 2048);
        assert_eq!(cfg.stream.track, vec!["covid".to_string(), "vaccine".to_string()]);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let env = env_of(&[
            ("STREAM_BEARER_TOKEN", "s"),
            ("INGEST_TOKEN", "t"),
            ("FLUSH_MAX_BYTES", "0"),
        ]);
        let err = AppConfig::resolve(FileConfig::default(), env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FLUSH_MAX_BYTES", .. }));
    }

    #[test]
    fn garbage_number_is_rejected() {
        let env = env_of(&[
            ("STREAM_BEARER_TOKEN", "s"),
            ("INGEST_TOKEN", "t"),
            ("FLUSH_MAX_WAIT_SECS", "soon"),
        ]);
        assert!(AppConfig::resolve(FileConfig::default(), env).is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(350));
    }
}
