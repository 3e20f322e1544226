//! Model catalog: which back ends the gateway offers.
//!
//! External collaborator with a 1-hour in-memory cache. On upstream failure
//! a stale cache is served rather than an error; the catalog is advisory.

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const CACHE_TTL: Duration = Duration::from_secs(3600);

const EXCLUSION_PATTERNS: [&str; 7] = [
    "dall-e",
    "whisper",
    "tts",
    "text-to-speech",
    "speech-to-text",
    "embedding",
    "moderation",
];

/// One selectable back-end model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: u64,
    pub pricing: ModelPricing,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelPricing {
    pub prompt: f64,
    pub completion: f64,
}

struct CacheEntry {
    fetched_at: Instant,
    models: Vec<ModelInfo>,
}

/// Cached catalog client.
pub struct ModelCatalog {
    client: Client,
    models_url: String,
    api_key: String,
    cache: RwLock<Option<CacheEntry>>,
}

impl ModelCatalog {
    pub fn new(client: Client, models_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            models_url: models_url.into(),
            api_key: api_key.into(),
            cache: RwLock::new(None),
        }
    }

    /// Text-capable models, served from cache when fresh.
    pub async fn models(&self) -> Vec<ModelInfo> {
        if let Some(entry) = self.cache.read().await.as_ref() {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return entry.models.clone();
            }
        }

        match self.fetch().await {
            Ok(models) => {
                *self.cache.write().await = Some(CacheEntry {
                    fetched_at: Instant::now(),
                    models: models.clone(),
                });
                models
            }
            Err(e) => {
                tracing::warn!(error = %e, "model catalog fetch failed, serving stale cache");
                self.cache
                    .read()
                    .await
                    .as_ref()
                    .map(|entry| entry.models.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn fetch(&self) -> reqwest::Result<Vec<ModelInfo>> {
        let data: Value = self
            .client
            .get(&self.models_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut models: Vec<ModelInfo> = data
            .get("data")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(parse_model).collect())
            .unwrap_or_default();

        models.sort_by(|a, b| (&a.provider, &a.name).cmp(&(&b.provider, &b.name)));
        Ok(models)
    }
}

fn parse_model(entry: &Value) -> Option<ModelInfo> {
    let id = entry.get("id")?.as_str()?.to_string();
    if !is_text_model(&id, entry) {
        return None;
    }

    let pricing = entry.get("pricing").cloned().unwrap_or(Value::Null);
    let price = |key: &str| {
        pricing
            .get(key)
            .and_then(|v| match v {
                Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            })
            .unwrap_or(0.0)
    };

    Some(ModelInfo {
        name: entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&id)
            .to_string(),
        context_length: entry
            .get("context_length")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        pricing: ModelPricing {
            prompt: price("prompt"),
            completion: price("completion"),
        },
        provider: id.split('/').next().unwrap_or("unknown").to_string(),
        id,
    })
}

/// Keep only models that generate text output.
fn is_text_model(id: &str, entry: &Value) -> bool {
    let lower = id.to_ascii_lowercase();
    if EXCLUSION_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }

    // Modality like "text->text" or "text+image->text" is acceptable.
    if let Some(modality) = entry
        .get("architecture")
        .and_then(|a| a.get("modality"))
        .and_then(Value::as_str)
    {
        if !modality.to_ascii_lowercase().contains("text") {
            return false;
        }
    }

    true
}
