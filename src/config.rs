use crate::error::ConfigError;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process-wide configuration, read once at start-up.
#[derive(Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub openai_api_key: String,
    pub openai_realtime_url: String,
    pub openai_model: String,
    pub openai_voice: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    /// Postgres connection string; the in-memory repository is used when absent.
    pub database_url: Option<String>,
    pub seed_file: Option<PathBuf>,
    pub log_level: String,
    /// How long a connect webhook payload waits for its media stream.
    pub stream_cache_ttl: Duration,
    pub session: SessionConfig,
}

/// Tunables for a single call session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Audio frames buffered per bridge queue before the oldest is dropped.
    pub audio_queue_capacity: usize,
    /// Upper bound on each repository call made while handling a tool call.
    pub tool_timeout: Duration,
    pub max_backend_failures: u32,
    pub transcript_flush_interval: Duration,
    /// How long close waits for an in-flight tool call before finalizing anyway.
    pub close_drain_timeout: Duration,
    pub hangup_grace: Duration,
    pub default_duration_minutes: u16,
    pub slot_step_minutes: u16,
    pub alternatives_limit: usize,
    /// Where call audio is saved at close; nothing is recorded when unset.
    pub recordings_dir: Option<PathBuf>,
    /// Cap on the audio kept per side of a call.
    pub recording_limit_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio_queue_capacity: 64,
            tool_timeout: Duration::from_millis(5_000),
            max_backend_failures: 3,
            transcript_flush_interval: Duration::from_millis(2_000),
            close_drain_timeout: Duration::from_millis(5_000),
            hangup_grace: Duration::from_millis(2_000),
            default_duration_minutes: 30,
            slot_step_minutes: 30,
            alternatives_limit: 4,
            recordings_dir: None,
            // 30 minutes of 8 kHz μ-law
            recording_limit_bytes: 8_000 * 60 * 30,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("openai_api_key", &"[REDACTED]")
            .field("openai_realtime_url", &self.openai_realtime_url)
            .field("openai_model", &self.openai_model)
            .field("openai_voice", &self.openai_voice)
            .field("twilio_account_sid", &self.twilio_account_sid)
            .field("twilio_auth_token", &"[REDACTED]")
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("seed_file", &self.seed_file)
            .field("log_level", &self.log_level)
            .field("stream_cache_ttl", &self.stream_cache_ttl)
            .field("session", &self.session)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = SessionConfig::default();
        let session = SessionConfig {
            audio_queue_capacity: parse_or("AUDIO_QUEUE_CAPACITY", defaults.audio_queue_capacity)?,
            tool_timeout: millis_or("TOOL_TIMEOUT_MS", defaults.tool_timeout)?,
            max_backend_failures: parse_or("MAX_BACKEND_FAILURES", defaults.max_backend_failures)?,
            transcript_flush_interval: millis_or(
                "TRANSCRIPT_FLUSH_MS",
                defaults.transcript_flush_interval,
            )?,
            close_drain_timeout: millis_or("CLOSE_DRAIN_MS", defaults.close_drain_timeout)?,
            hangup_grace: millis_or("HANGUP_GRACE_MS", defaults.hangup_grace)?,
            default_duration_minutes: parse_or(
                "DEFAULT_DURATION_MIN",
                defaults.default_duration_minutes,
            )?,
            slot_step_minutes: parse_or("SLOT_STEP_MIN", defaults.slot_step_minutes)?,
            alternatives_limit: parse_or("ALTERNATIVES_LIMIT", defaults.alternatives_limit)?,
            recordings_dir: match env::var("RECORDINGS_DIR") {
                Ok(dir) if dir.trim().is_empty() => None,
                Ok(dir) => Some(PathBuf::from(dir)),
                Err(_) => Some(PathBuf::from("recordings")),
            },
            recording_limit_bytes: parse_or(
                "RECORDING_LIMIT_BYTES",
                defaults.recording_limit_bytes,
            )?,
        };
        if session.audio_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "AUDIO_QUEUE_CAPACITY",
                value: "0".to_string(),
            });
        }
        if session.slot_step_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "SLOT_STEP_MIN",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            bind_addr: parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_realtime_url: env::var("OPENAI_REALTIME_URL")
                .unwrap_or_else(|_| "wss://api.openai.com/v1/realtime".to_string()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-realtime".to_string()),
            openai_voice: env::var("OPENAI_VOICE").unwrap_or_else(|_| "alloy".to_string()),
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: required("TWILIO_AUTH_TOKEN")?,
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            seed_file: env::var("SEED_FILE").ok().map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string()),
            stream_cache_ttl: millis_or("STREAM_CACHE_TTL_MS", Duration::from_secs(300))?,
            session,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn millis_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        let value: usize = parse_or("CARECALL_TEST_UNSET_CAPACITY", 7).unwrap();
        assert_eq!(value, 7);
        let timeout = millis_or("CARECALL_TEST_UNSET_TIMEOUT", Duration::from_millis(250)).unwrap();
        assert_eq!(timeout, Duration::from_millis(250));
    }

    #[test]
    fn unparsable_values_are_rejected() {
        env::set_var("CARECALL_TEST_BAD_LIMIT", "four");
        let res: Result<usize, _> = parse_or("CARECALL_TEST_BAD_LIMIT", 4);
        assert!(matches!(
            res,
            Err(ConfigError::Invalid { key: "CARECALL_TEST_BAD_LIMIT", .. })
        ));
        env::remove_var("CARECALL_TEST_BAD_LIMIT");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            openai_api_key: "sk-secret".into(),
            openai_realtime_url: "wss://example.test".into(),
            openai_model: "gpt-realtime".into(),
            openai_voice: "alloy".into(),
            twilio_account_sid: "AC123".into(),
            twilio_auth_token: "token-secret".into(),
            database_url: Some("postgres://user:pw@db/care".into()),
            seed_file: None,
            log_level: "debug".into(),
            stream_cache_ttl: Duration::from_secs(300),
            session: SessionConfig::default(),
        };
        let shown = format!("{config:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(!shown.contains("token-secret"));
        assert!(!shown.contains("pw@db"));
    }
}
