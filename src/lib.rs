//! # LLM Council
//!
//! A deliberation orchestrator: one user question is routed through a panel
//! of heterogeneous LLM back ends and synthesized into a single, vetted
//! answer, streamed to the client as typed SSE events.
//!
//! Two deliberation modes:
//!
//! - **Council**: three sequential stages of parallel candidate responses,
//!   peer-anonymized ranking, chairman synthesis.
//! - **Arena**: N debate rounds (opening + rebuttals) among anonymized
//!   participants, closed by a moderator synthesis.
//!
//! ## Architecture
//!
//! ```text
//! [HTTP layer]              routing, SSE transport, trusted-proxy auth
//!         │
//!         ▼
//! [Deliberation pipelines]  council / arena / retry state machines
//!         │            │
//!         ▼            ▼
//! [Fan-out engine]   [Pending tracker]    event channel → SSE
//!         │                   │
//!         ▼                   ▼
//! [Gateway client]    [Conversation store]
//!   retry + classify     append-only JSON
//! ```
//!
//! Partial results are persisted to the per-conversation pending marker as
//! stages complete, so an interrupted deliberation can **resume** at the
//! first incomplete stage, and a failed synthesis can be **retried** without
//! re-querying the panel.

pub mod attachments;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod deliberation;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gateway;
pub mod labels;
pub mod metrics;
pub mod pending;
pub mod pipeline;
pub mod prompts;
pub mod ranking;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod websearch;

pub use config::Settings;
pub use deliberation::{
    DeliberationMode, DeliberationResult, Metrics, ParticipantResponse, Round, RoundType,
    Synthesis,
};
pub use error::{CouncilError, Result};
pub use events::{EventSink, StreamEvent};
pub use fanout::{Fanout, FanoutOptions, FanoutPrompt};
pub use gateway::{
    BackoffConfig, ErrorCategory, Gateway, MockGateway, ModelError, ModelReply, OpenRouterGateway,
};
pub use pipeline::{PipelineCtx, RequestContext};
