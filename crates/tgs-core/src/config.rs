use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::{
    errors::Error,
    resilience::retry::{RetryPolicy, MAX_SLEEP},
    Result,
};

const PLACEHOLDER_API_ID: &str = "your_api_id_here";
const PLACEHOLDER_API_HASH: &str = "your_api_hash_here";

/// Typed configuration, mirroring the nested JSON file layout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub api_credentials: ApiCredentials,
    #[serde(default)]
    pub scanning: ScanningConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub ai_responder: AiConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiCredentials {
    #[serde(default, deserialize_with = "string_or_number")]
    pub api_id: String,
    #[serde(default)]
    pub api_hash: String,
    /// Bot API token used by the teloxide adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

impl Default for ApiCredentials {
    fn default() -> Self {
        Self {
            api_id: PLACEHOLDER_API_ID.to_string(),
            api_hash: PLACEHOLDER_API_HASH.to_string(),
            bot_token: None,
        }
    }
}

impl ApiCredentials {
    pub fn is_placeholder(&self) -> bool {
        self.api_id == PLACEHOLDER_API_ID || self.api_hash == PLACEHOLDER_API_HASH
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanningConfig {
    pub scan_interval: u64,
    pub max_history_days: u32,
    pub selected_groups: Vec<String>,
    pub debug_mode: bool,
    /// Per-group cap on historical messages fetched at start.
    pub history_limit: usize,
    /// Upper bound on a full dialog walk.
    pub discovery_timeout_secs: u64,
    pub max_workers: usize,
    /// Capacity of the monitoring work queue; new events are dropped when full.
    pub queue_capacity: usize,
    /// JSON file holding stored messages.
    pub storage_file: PathBuf,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            scan_interval: 30,
            max_history_days: 7,
            selected_groups: Vec::new(),
            debug_mode: false,
            history_limit: 100,
            discovery_timeout_secs: 30 * 60,
            max_workers: 3,
            queue_capacity: 1000,
            storage_file: PathBuf::from("telegram_scanner_data.json"),
        }
    }
}

impl ScanningConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogicOperator {
    And,
    #[default]
    Or,
}

impl LogicOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            LogicOperator::And => "AND",
            LogicOperator::Or => "OR",
        }
    }
}

impl fmt::Display for LogicOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(LogicOperator::And),
            "OR" => Ok(LogicOperator::Or),
            other => Err(Error::Config(format!(
                "relevance.logic must be AND or OR, got {other:?}"
            ))),
        }
    }
}

impl Serialize for LogicOperator {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogicOperator {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub keywords: Vec<String>,
    pub regex_patterns: Vec<String>,
    pub logic: LogicOperator,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub requests_per_minute: u32,
    pub flood_wait_multiplier: f64,
    /// Base backoff delay in seconds.
    pub default_delay: f64,
    /// Ceiling in seconds for a single exponential backoff sleep.
    pub max_wait_time: f64,
    pub max_retries: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            flood_wait_multiplier: 1.5,
            default_delay: 1.0,
            max_wait_time: 60.0,
            max_retries: 3,
        }
    }
}

impl RateLimitingConfig {
    /// The one retry policy used across the process.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: secs_f64(self.default_delay),
            max_delay: Some(secs_f64(self.max_wait_time)),
            exponential: true,
            flood_wait_multiplier: self.flood_wait_multiplier.max(0.0),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    OpenAi,
    ProxyApi,
}

impl AiProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            AiProvider::OpenAi => "openai",
            AiProvider::ProxyApi => "proxyapi",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub provider: AiProvider,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Optional template with `{message_content}`, `{sender_username}`,
    /// `{group_name}`, `{extracted_text}`, `{timestamp}`, `{context}`.
    pub prompt_template: String,
    pub cache_responses: bool,
    /// Reply automatically to newly stored relevant messages.
    pub auto_respond: bool,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: AiProvider::OpenAi,
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 500,
            system_prompt: "You are a helpful assistant responding to Telegram messages."
                .to_string(),
            prompt_template: String::new(),
            cache_responses: true,
            auto_respond: false,
        }
    }
}

impl ScannerConfig {
    /// The file written when no config exists yet.
    pub fn template() -> Self {
        Self {
            relevance: RelevanceConfig {
                keywords: vec!["important".to_string(), "urgent".to_string()],
                regex_patterns: Vec::new(),
                logic: LogicOperator::Or,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.requests_per_minute == 0 {
            return Err(Error::Config(
                "rate_limiting.requests_per_minute must be greater than zero".to_string(),
            ));
        }
        if !self.rate_limiting.flood_wait_multiplier.is_finite()
            || self.rate_limiting.flood_wait_multiplier < 0.0
        {
            return Err(Error::Config(
                "rate_limiting.flood_wait_multiplier must be a non-negative number".to_string(),
            ));
        }
        for (name, v) in [
            ("default_delay", self.rate_limiting.default_delay),
            ("max_wait_time", self.rate_limiting.max_wait_time),
        ] {
            if !v.is_finite() || v < 0.0 || v > MAX_SLEEP.as_secs_f64() {
                return Err(Error::Config(format!(
                    "rate_limiting.{name} must be between 0 and {} seconds",
                    MAX_SLEEP.as_secs()
                )));
            }
        }
        if self.scanning.max_workers == 0 {
            return Err(Error::Config(
                "scanning.max_workers must be greater than zero".to_string(),
            ));
        }
        if self.ai_responder.enabled {
            if self.ai_responder.api_key.trim().is_empty() {
                return Err(Error::Config(
                    "ai_responder is enabled but no api_key is set".to_string(),
                ));
            }
            if self.ai_responder.api_url.trim().is_empty() {
                return Err(Error::Config(
                    "ai_responder is enabled but no api_url is set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Environment wins over the file (after `.env` is loaded).
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_str("TGS_API_ID").and_then(non_empty) {
            self.api_credentials.api_id = v;
        }
        if let Some(v) = env_str("TGS_API_HASH").and_then(non_empty) {
            self.api_credentials.api_hash = v;
        }
        if let Some(v) = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty) {
            self.api_credentials.bot_token = Some(v);
        }
        if let Some(v) = env_str("TGS_AI_API_KEY").and_then(non_empty) {
            self.ai_responder.api_key = v;
        }
    }
}

/// Loads, creates and saves the JSON config file.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    current: Option<ScannerConfig>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, writing a template first if the file does not exist.
    pub fn load(&mut self) -> Result<ScannerConfig> {
        load_dotenv_if_present(Path::new(".env"));

        if !self.path.exists() {
            info!(path = %self.path.display(), "configuration file not found");
            self.create_default()?;
        }

        let txt = fs::read_to_string(&self.path)?;
        let mut cfg: ScannerConfig = serde_json::from_str(&txt).map_err(|e| {
            Error::Config(format!(
                "invalid configuration file {}: {e}",
                self.path.display()
            ))
        })?;
        cfg.apply_env_overrides();
        cfg.validate()?;

        if cfg.api_credentials.is_placeholder() {
            warn!(
                path = %self.path.display(),
                "api credentials are still placeholders; update the configuration file"
            );
        }

        info!(path = %self.path.display(), "configuration loaded");
        self.current = Some(cfg.clone());
        Ok(cfg)
    }

    pub fn reload(&mut self) -> Result<ScannerConfig> {
        self.load()
    }

    pub fn save(&mut self, cfg: &ScannerConfig) -> Result<()> {
        cfg.validate()?;
        write_json(&self.path, cfg)?;
        self.current = Some(cfg.clone());
        info!(path = %self.path.display(), "configuration saved");
        Ok(())
    }

    pub fn current(&self) -> Option<&ScannerConfig> {
        self.current.as_ref()
    }

    fn create_default(&self) -> Result<()> {
        write_json(&self.path, &ScannerConfig::template())?;
        info!(path = %self.path.display(), "default configuration created");
        warn!("please update the configuration file with your API credentials");
        Ok(())
    }
}

fn write_json(path: &Path, cfg: &ScannerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let txt = serde_json::to_string_pretty(cfg)?;
    fs::write(path, txt)?;
    Ok(())
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    match v {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn secs_f64(v: f64) -> Duration {
    if v.is_nan() || v <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(v)
        .map(|d| d.min(MAX_SLEEP))
        .unwrap_or(MAX_SLEEP)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
