//! Runtime configuration: environment settings and panel defaults.
//!
//! Process-level settings come from the environment once at startup. The
//! panel composition (council members + chairman) additionally supports
//! per-deployment overrides persisted in `<data>/panel_config.json`;
//! conversations bind the effective panel at creation time.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default council members, by gateway model identifier.
pub const DEFAULT_COUNCIL_MODELS: [&str; 4] = [
    "openai/gpt-5.1",
    "google/gemini-3-pro-preview",
    "anthropic/claude-sonnet-4.5",
    "x-ai/grok-4",
];

/// Default chairman (synthesizes the final response).
pub const DEFAULT_CHAIRMAN_MODEL: &str = "google/gemini-3-pro-preview";

/// Fast, cheap model for conversation titles.
pub const TITLE_MODEL: &str = "google/gemini-2.5-flash";

pub const DEFAULT_ARENA_ROUNDS: u32 = 3;
pub const MIN_ARENA_ROUNDS: u32 = 2;
pub const MAX_ARENA_ROUNDS: u32 = 10;

/// Clamp a requested arena round count into the supported range.
pub fn clamp_arena_rounds(requested: u32) -> u32 {
    requested.clamp(MIN_ARENA_ROUNDS, MAX_ARENA_ROUNDS)
}

/// Log output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Process-level settings, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root data directory (conversations, pending markers, attachments).
    pub data_dir: PathBuf,
    /// HTTP bind address.
    pub bind_addr: String,
    /// Full chat-completions URL of the upstream gateway.
    pub gateway_api_url: String,
    /// Model-catalog URL of the upstream gateway.
    pub gateway_models_url: String,
    pub gateway_api_key: String,
    /// Web-search provider key; search is unavailable without it.
    pub websearch_api_key: Option<String>,
    pub auth_enabled: bool,
    /// Comma-separated IPs / CIDR ranges allowed to assert identity headers.
    pub trusted_proxy_ips: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_addr: "0.0.0.0:8001".into(),
            gateway_api_url: "https://openrouter.ai/api/v1/chat/completions".into(),
            gateway_models_url: "https://openrouter.ai/api/v1/models".into(),
            gateway_api_key: String::new(),
            websearch_api_key: None,
            auth_enabled: false,
            trusted_proxy_ips: "127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16".into(),
            log_format: LogFormat::Human,
        }
    }
}

impl Settings {
    /// Read settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            data_dir: var("LLMCOUNCIL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bind_addr: var("LLMCOUNCIL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            gateway_api_url: var("LLMCOUNCIL_GATEWAY_URL").unwrap_or(defaults.gateway_api_url),
            gateway_models_url: var("LLMCOUNCIL_GATEWAY_MODELS_URL")
                .unwrap_or(defaults.gateway_models_url),
            gateway_api_key: var("OPENROUTER_API_KEY").unwrap_or_default(),
            websearch_api_key: var("TAVILY_API_KEY"),
            auth_enabled: var("LLMCOUNCIL_AUTH_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            trusted_proxy_ips: var("LLMCOUNCIL_TRUSTED_PROXY_IPS")
                .unwrap_or(defaults.trusted_proxy_ips),
            log_format: match var("LLMCOUNCIL_LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Human,
            },
        }
    }

    fn panel_config_path(&self) -> PathBuf {
        self.data_dir.join("panel_config.json")
    }

    /// Effective council members: panel override or defaults.
    pub fn council_models(&self) -> Vec<String> {
        self.load_panel()
            .council_models
            .unwrap_or_else(|| DEFAULT_COUNCIL_MODELS.iter().map(|s| s.to_string()).collect())
    }

    /// Effective chairman model: panel override or default.
    pub fn chairman_model(&self) -> String {
        self.load_panel()
            .chairman_model
            .unwrap_or_else(|| DEFAULT_CHAIRMAN_MODEL.to_string())
    }

    /// Load the panel override file; unreadable or absent means no override.
    pub fn load_panel(&self) -> PanelConfig {
        load_panel_config(&self.panel_config_path())
    }

    /// Persist panel overrides, keeping unset fields unchanged.
    pub fn update_panel(
        &self,
        council_models: Option<Vec<String>>,
        chairman_model: Option<String>,
    ) -> Result<PanelConfig> {
        let mut panel = self.load_panel();
        if let Some(models) = council_models {
            panel.council_models = Some(models);
        }
        if let Some(chairman) = chairman_model {
            panel.chairman_model = Some(chairman);
        }

        if let Some(parent) = self.panel_config_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            self.panel_config_path(),
            serde_json::to_string_pretty(&panel)?,
        )?;
        Ok(panel)
    }
}

/// Persisted panel overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub council_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chairman_model: Option<String>,
}

fn load_panel_config(path: &Path) -> PanelConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}
