use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::model::Mode;

/// Participant model set and chairman for one mode.
#[derive(Debug, Clone)]
pub struct ModeConfig {
    pub participants: Vec<String>,
    pub chairman: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub modes: HashMap<Mode, ModeConfig>,

    pub stage1_timeout: Duration,
    pub stage2_timeout: Duration,
    pub stage3_timeout: Duration,
    pub chairman_max_tokens: u64,
    pub participant_max_tokens: u64,
    pub recent_messages_window: usize,

    pub max_sessions_per_user: usize,
    pub max_concurrent_processing: usize,

    pub grace_period: Duration,
    pub stale_threshold: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub title_timeout: Duration,
}

impl Config {
    /// Loads configuration from the process environment. Missing optional
    /// values fall back to documented defaults with a warning; a completely
    /// unconfigured mode is left out of `modes` rather than erroring, since a
    /// single mode being unavailable shouldn't crash the process.
    pub fn from_env() -> Self {
        let gateway_base_url = env::var("COUNCIL_GATEWAY_BASE_URL").unwrap_or_else(|_| {
            tracing::warn!("COUNCIL_GATEWAY_BASE_URL not set — using default gateway URL");
            "https://api.openai.com/v1/chat/completions".to_string()
        });

        let gateway_api_key = env::var("COUNCIL_GATEWAY_API_KEY").unwrap_or_else(|_| {
            tracing::warn!("COUNCIL_GATEWAY_API_KEY not set — upstream calls will fail auth");
            String::new()
        });

        let mut modes = HashMap::new();

        if let Some(lite) = mode_config_from_env("LITE") {
            modes.insert(Mode::Lite, lite);
        } else {
            tracing::warn!("COUNCIL_LITE_MODELS/COUNCIL_LITE_CHAIRMAN not set — lite mode unavailable");
        }

        if let Some(ultra) = mode_config_from_env("ULTRA") {
            modes.insert(Mode::Ultra, ultra);
        } else {
            tracing::warn!("COUNCIL_ULTRA_MODELS/COUNCIL_ULTRA_CHAIRMAN not set — ultra mode unavailable");
        }

        if modes.is_empty() {
            tracing::error!("no modes configured — council cannot process any message");
        }

        Config {
            gateway_base_url,
            gateway_api_key,
            modes,
            stage1_timeout: env_duration_secs("COUNCIL_STAGE1_TIMEOUT_SECS", 60),
            stage2_timeout: env_duration_secs("COUNCIL_STAGE2_TIMEOUT_SECS", 60),
            stage3_timeout: env_duration_secs("COUNCIL_STAGE3_TIMEOUT_SECS", 180),
            chairman_max_tokens: env_u64("COUNCIL_CHAIRMAN_MAX_TOKENS", 8192),
            participant_max_tokens: env_u64("COUNCIL_PARTICIPANT_MAX_TOKENS", 4096),
            recent_messages_window: env_usize("COUNCIL_RECENT_MESSAGES_WINDOW", 10),
            max_sessions_per_user: env_usize("COUNCIL_MAX_SESSIONS_PER_USER", 50),
            max_concurrent_processing: env_usize("COUNCIL_MAX_CONCURRENT_PROCESSING", 20),
            grace_period: env_duration_secs("COUNCIL_GRACE_PERIOD_SECS", 30),
            stale_threshold: env_duration_secs("COUNCIL_STALE_THRESHOLD_SECS", 600),
            sweep_interval: env_duration_secs("COUNCIL_SWEEP_INTERVAL_SECS", 300),
            heartbeat_interval: env_duration_secs("COUNCIL_HEARTBEAT_INTERVAL_SECS", 15),
            title_timeout: env_duration_secs("COUNCIL_TITLE_TIMEOUT_SECS", 30),
        }
    }
}

fn mode_config_from_env(prefix: &str) -> Option<ModeConfig> {
    let participants = env::var(format!("COUNCIL_{prefix}_MODELS")).ok()?;
    let chairman = env::var(format!("COUNCIL_{prefix}_CHAIRMAN")).ok()?;
    let participants: Vec<String> = participants
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if participants.is_empty() {
        return None;
    }
    Some(ModeConfig { participants, chairman })
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_secs))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
