//! Web-search provider wrapper (Tavily-style API).
//!
//! External collaborator: the orchestrator only needs "given a query, maybe
//! a formatted context block". Failures are reported as user-facing strings,
//! never as pipeline errors; a failed search degrades to no context.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESULTS: usize = 5;
const CONTENT_SNIPPET_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

/// Client for the configured web-search provider.
#[derive(Clone)]
pub struct WebSearch {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl WebSearch {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url: "https://api.tavily.com/search".into(),
            api_key,
        }
    }

    /// Whether a search key is configured.
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Run a search and return raw results, or a user-facing error string.
    pub async fn search(&self, query: &str) -> Result<SearchResponse, String> {
        let api_key = match &self.api_key {
            Some(key) => key.clone(),
            None => return Err("Web search not configured".into()),
        };

        let response = self
            .client
            .post(&self.api_url)
            .timeout(SEARCH_TIMEOUT)
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": MAX_RESULTS,
                "search_depth": "basic",
                "include_answer": true,
                "include_raw_content": false,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "Web search timed out".to_string()
                } else {
                    tracing::warn!(error = %e, "web search request failed");
                    "Web search failed".to_string()
                }
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(match status {
                401 => "Invalid web search API key".into(),
                429 => "Web search rate limit exceeded".into(),
                _ => format!("Web search failed (HTTP {})", status),
            });
        }

        response
            .json::<SearchResponse>()
            .await
            .map_err(|_| "Web search failed".to_string())
    }

    /// Run a search and format results as a markdown context block.
    ///
    /// Returns `(Some(context), None)` on success, `(None, Some(error))` on
    /// failure, and `(None, Some("No results found"))` for an empty result.
    pub async fn search_formatted(&self, query: &str) -> (Option<String>, Option<String>) {
        match self.search(query).await {
            Ok(response) => {
                let formatted = format_search_results(&response);
                if formatted.is_empty() {
                    (None, Some("No results found".into()))
                } else {
                    (Some(formatted), None)
                }
            }
            Err(e) => (None, Some(e)),
        }
    }
}

/// Format a search response into a readable context block for prompts.
pub fn format_search_results(response: &SearchResponse) -> String {
    let mut parts = Vec::new();

    if let Some(answer) = response.answer.as_ref().filter(|a| !a.is_empty()) {
        parts.push(format!("**Web Search Summary:**\n{}\n", answer));
    }

    if !response.results.is_empty() {
        parts.push("**Sources:**".to_string());
        for (i, result) in response.results.iter().enumerate() {
            let mut content = result.content.clone();
            if content.len() > CONTENT_SNIPPET_LIMIT {
                let mut cut = CONTENT_SNIPPET_LIMIT;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
                content.push_str("...");
            }
            parts.push(format!(
                "\n{}. **{}**\n   URL: {}\n   {}",
                i + 1,
                result.title,
                result.url,
                content
            ));
        }
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(answer: Option<&str>, results: Vec<(&str, &str, &str)>) -> SearchResponse {
        SearchResponse {
            answer: answer.map(String::from),
            results: results
                .into_iter()
                .map(|(title, url, content)| SearchResult {
                    title: title.into(),
                    url: url.into(),
                    content: content.into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_format_includes_answer_and_sources() {
        let formatted = format_search_results(&response(
            Some("Summary text"),
            vec![("Title One", "https://a.example", "body one")],
        ));
        assert!(formatted.contains("**Web Search Summary:**\nSummary text"));
        assert!(formatted.contains("1. **Title One**"));
        assert!(formatted.contains("https://a.example"));
    }

    #[test]
    fn test_format_truncates_long_content() {
        let long = "x".repeat(900);
        let formatted = format_search_results(&response(None, vec![("T", "u", &long)]));
        assert!(formatted.contains(&format!("{}...", "x".repeat(500))));
        assert!(!formatted.contains(&"x".repeat(501)));
    }

    #[test]
    fn test_format_empty_response() {
        assert_eq!(format_search_results(&response(None, vec![])), "");
    }

    #[tokio::test]
    async fn test_unconfigured_search_unavailable() {
        let search = WebSearch::new(Client::new(), None);
        assert!(!search.is_available());
        let (context, error) = search.search_formatted("anything").await;
        assert!(context.is_none());
        assert_eq!(error.as_deref(), Some("Web search not configured"));
    }
}
