//! The conversation engine: history, request building, transport + retry,
//! stream decoding, tool dispatch, and the turn loop that ties them
//! together. The host application supplies a `UiSink` and `ToolRegistry`
//! (and, optionally, `JsonRpcTransport`/`McpStdioPool`) and drives the loop
//! through `Engine::run_turn`.

pub mod approval;
pub mod cancel;
pub mod collaborators;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod mode;
pub mod request;
pub mod retry;
pub mod stats;
pub mod stream_decoder;
pub mod token;
pub mod transport;
pub mod turn;

pub use approval::{ApprovalCache, Fingerprint};
pub use cancel::{CancelScope, CancelSignal};
pub use collaborators::{ApprovalAnswer, JsonRpcTransport, McpStdioPool, ToolRegistry, UiSink};
pub use dispatch::ToolDispatcher;
pub use error::{EngineError, Result};
pub use history::{HistoryError, HistoryStore};
pub use mode::ModeGate;
pub use request::{build as build_request, RequestSpec};
pub use retry::{classify, classify_transport_failure, RetryClass, RetryDecision, RetryPolicy};
pub use stats::Stats;
pub use stream_decoder::{Decoded, StreamDecoder};
pub use token::TokenEstimator;
pub use transport::{TransportClient, TransportOutcome, TransportResponse};
pub use turn::{Engine, MAX_TOOL_LOOPS};
