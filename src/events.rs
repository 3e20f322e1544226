//! Typed event stream emitted by deliberation pipelines.
//!
//! Pipelines publish [`StreamEvent`]s into a bounded channel via
//! [`EventSink`]; the transport layer drains the channel and writes one SSE
//! `data: {json}\n\n` frame per event. The `type` discriminator and payload
//! keys are part of the wire contract consumed by the frontend and TUI.

use crate::deliberation::{
    CouncilMetadata, MemberRanking, MemberResponse, Round, Synthesis,
};
use crate::error::{CouncilError, Result};
use crate::metrics::AggregateMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Progress snapshot of a running fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub completed: usize,
    pub total: usize,
    pub completed_models: Vec<String>,
    pub pending_models: Vec<String>,
}

/// One streamed token from one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub model: String,
    pub token: String,
}

/// Outcome of the optional web-search step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchData {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events emitted while a deliberation is in progress.
///
/// Ordering contract within one council run: `stage1_complete` precedes any
/// `stage2_*` event, `stage2_complete` precedes any `stage3_*` event;
/// `title_complete` may land anywhere between `stage2_start` and `complete`.
/// After `error` the stream ends and the pending marker keeps the partial
/// data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Stage1Start {
        data: Stage1StartData,
    },
    Stage1Token {
        data: TokenData,
    },
    Stage1ModelResponse {
        data: MemberResponse,
        /// 1-indexed arrival position.
        index: usize,
        total: usize,
    },
    Stage1Progress {
        data: ProgressData,
    },
    Stage1Complete {
        data: Vec<MemberResponse>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed: Option<bool>,
    },
    Stage2Start,
    Stage2Complete {
        data: Vec<MemberRanking>,
        metadata: CouncilMetadata,
    },
    Stage3Start,
    Stage3Complete {
        data: Synthesis,
    },
    ArenaStart {
        data: ArenaStartData,
    },
    RoundStart {
        data: RoundStartData,
    },
    RoundComplete {
        data: Round,
    },
    SynthesisStart,
    SynthesisComplete {
        data: Synthesis,
        participant_mapping: BTreeMap<String, String>,
    },
    MetricsComplete {
        data: AggregateMetrics,
    },
    TitleComplete {
        data: TitleData,
    },
    WebSearchStart,
    WebSearchComplete {
        data: WebSearchData,
    },
    ResumeStart {
        data: ResumeData,
    },
    PriorContext {
        data: PriorContextData,
    },
    Complete,
    Error {
        message: String,
    },
    ServerShutdown {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1StartData {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaStartData {
    pub participant_count: usize,
    pub round_count: u32,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStartData {
    pub round_number: u32,
    pub round_type: crate::deliberation::RoundType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleData {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeData {
    pub from_stage: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorContextData {
    pub source_id: String,
}

impl StreamEvent {
    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Stage1Start { .. } => "stage1_start",
            StreamEvent::Stage1Token { .. } => "stage1_token",
            StreamEvent::Stage1ModelResponse { .. } => "stage1_model_response",
            StreamEvent::Stage1Progress { .. } => "stage1_progress",
            StreamEvent::Stage1Complete { .. } => "stage1_complete",
            StreamEvent::Stage2Start => "stage2_start",
            StreamEvent::Stage2Complete { .. } => "stage2_complete",
            StreamEvent::Stage3Start => "stage3_start",
            StreamEvent::Stage3Complete { .. } => "stage3_complete",
            StreamEvent::ArenaStart { .. } => "arena_start",
            StreamEvent::RoundStart { .. } => "round_start",
            StreamEvent::RoundComplete { .. } => "round_complete",
            StreamEvent::SynthesisStart => "synthesis_start",
            StreamEvent::SynthesisComplete { .. } => "synthesis_complete",
            StreamEvent::MetricsComplete { .. } => "metrics_complete",
            StreamEvent::TitleComplete { .. } => "title_complete",
            StreamEvent::WebSearchStart => "web_search_start",
            StreamEvent::WebSearchComplete { .. } => "web_search_complete",
            StreamEvent::ResumeStart { .. } => "resume_start",
            StreamEvent::PriorContext { .. } => "prior_context",
            StreamEvent::Complete => "complete",
            StreamEvent::Error { .. } => "error",
            StreamEvent::ServerShutdown { .. } => "server_shutdown",
        }
    }

    /// Serialize to one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        format!("data: {}\n\n", json)
    }

    /// The control event broadcast to in-flight streams at shutdown.
    pub fn server_shutdown() -> Self {
        StreamEvent::ServerShutdown {
            message: "Server is restarting — your request will resume automatically".into(),
        }
    }
}

/// Sending half of the pipeline event channel.
///
/// A failed send means the consumer (SSE writer) is gone; pipelines treat
/// that as cancellation so in-flight upstream work stops, while the pending
/// marker keeps whatever was already persisted.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    /// Create a bounded event channel; the receiver feeds the SSE writer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: StreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CouncilError::Cancelled)
    }

    /// Emit without failing the caller; used on error paths where the client
    /// may already be gone.
    pub async fn emit_best_effort(&self, event: StreamEvent) {
        let _ = self.tx.send(event).await;
    }
}
