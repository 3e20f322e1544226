//! Per-conversation in-progress markers.
//!
//! While a deliberation runs, its conversation carries a pending marker in
//! `<scope>/pending.json` recording the mode, the user's query, and the
//! partial data accumulated so far. The marker is cleared only on successful
//! completion; after a crash or disconnect it is what makes resume possible.
//!
//! The tracker is single-writer per conversation. Overlapping in-flight
//! turns on the same conversation are a client-layer precondition violation,
//! not something this module serializes.

use crate::deliberation::{CouncilMetadata, DeliberationMode, MemberRanking, MemberResponse, Round};
use crate::error::Result;
use crate::storage::user_scope_dir;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A marker older than this (by `last_update`) counts as stale.
pub const STALE_THRESHOLD_SECONDS: i64 = 600;

fn lenient_datetime<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    // An unparseable timestamp must not make the whole pending file
    // unreadable; it just renders the marker stale.
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|v| v.as_str().map(String::from))
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

/// Partial results accumulated while a deliberation is in flight.
///
/// Council turns fill `stage1`, then `stage2` + `metadata`; arena turns grow
/// `rounds`. A pipeline failure records `error` without clearing the marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage1: Option<Vec<MemberResponse>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage2: Option<Vec<MemberRanking>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CouncilMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<Vec<Round>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartialData {
    pub fn stage1(results: Vec<MemberResponse>) -> Self {
        Self { stage1: Some(results), ..Self::default() }
    }

    pub fn rounds(rounds: Vec<Round>) -> Self {
        Self { rounds: Some(rounds), ..Self::default() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()), ..Self::default() }
    }

    /// Merge `other` into `self`: set fields win, unset fields keep.
    fn merge(&mut self, other: PartialData) {
        if other.stage1.is_some() {
            self.stage1 = other.stage1;
        }
        if other.stage2.is_some() {
            self.stage2 = other.stage2;
        }
        if other.metadata.is_some() {
            self.metadata = other.metadata;
        }
        if other.rounds.is_some() {
            self.rounds = other.rounds;
        }
        if other.error.is_some() {
            self.error = other.error;
        }
    }
}

/// The in-progress marker for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMarker {
    pub mode: DeliberationMode,
    pub started_at: String,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub last_update: Option<DateTime<Utc>>,
    pub user_content: String,
    #[serde(default)]
    pub partial_data: PartialData,
}

impl PendingMarker {
    /// Whether this marker has gone stale: no update for the threshold, or
    /// a missing/unparseable `last_update`.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_update {
            Some(last) => now - last > Duration::seconds(STALE_THRESHOLD_SECONDS),
            None => true,
        }
    }
}

/// File-backed pending tracker rooted at the data directory.
#[derive(Debug, Clone)]
pub struct PendingTracker {
    base_dir: PathBuf,
}

type PendingFile = BTreeMap<String, PendingMarker>;

impl PendingTracker {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, user: Option<&str>) -> PathBuf {
        user_scope_dir(&self.base_dir, user).join("pending.json")
    }

    fn load(&self, user: Option<&str>) -> PendingFile {
        load_pending_file(&self.path_for(user))
    }

    fn store(&self, pending: &PendingFile, user: Option<&str>) -> Result<()> {
        let path = self.path_for(user);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(pending)?)?;
        Ok(())
    }

    /// Set the marker for a conversation with `started_at = now`.
    pub fn mark_pending(
        &self,
        conversation_id: &str,
        mode: DeliberationMode,
        user_content: &str,
        user: Option<&str>,
    ) -> Result<()> {
        let mut pending = self.load(user);
        let now = Utc::now();
        pending.insert(
            conversation_id.to_string(),
            PendingMarker {
                mode,
                started_at: now.to_rfc3339(),
                last_update: Some(now),
                user_content: user_content.to_string(),
                partial_data: PartialData::default(),
            },
        );
        self.store(&pending, user)
    }

    /// Merge partial data into the marker and touch `last_update`.
    /// A no-op when the conversation has no marker.
    pub fn update_progress(
        &self,
        conversation_id: &str,
        partial: PartialData,
        user: Option<&str>,
    ) -> Result<()> {
        let mut pending = self.load(user);
        if let Some(marker) = pending.get_mut(conversation_id) {
            marker.partial_data.merge(partial);
            marker.last_update = Some(Utc::now());
            self.store(&pending, user)?;
        }
        Ok(())
    }

    /// Delete the marker on successful completion.
    pub fn clear(&self, conversation_id: &str, user: Option<&str>) -> Result<()> {
        let mut pending = self.load(user);
        if pending.remove(conversation_id).is_some() {
            self.store(&pending, user)?;
        }
        Ok(())
    }

    pub fn get(&self, conversation_id: &str, user: Option<&str>) -> Option<PendingMarker> {
        self.load(user).get(conversation_id).cloned()
    }
}

fn load_pending_file(path: &Path) -> PendingFile {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}
