//! Multi-agent pools with routed delegation and portable `.pear` bundles.
//!
//! The crate provides:
//! - Specialist [`Agent`]s bound to a persona, a fixed toolset and a model.
//! - A [`RoutingAgent`] that picks exactly one agent per request, or declines.
//! - A [`Pool`] that drives route → turn → tool → answer under an iteration budget.
//! - [`HistoryStore`] backends with single-writer-per-session ordering.
//! - `pear` bundles that freeze a configured pool into one versioned document.

mod agent;
mod config;
mod context;
mod error;
mod history;
mod llm;
mod logging;
mod message;
mod pool;
mod retry;
mod router;
mod tool;

pub mod pear;

pub use agent::{Agent, AgentDirective, TurnResult};
pub use config::{LogFormat, LoggingConfig, PoolSettings, RuntimeConfig, ToolSettings};
pub use context::{ContextPolicy, ContextStrategy};
pub use error::{PeargentError, Result};
#[cfg(feature = "persistence")]
pub use history::SqlHistoryStore;
pub use history::{
    FileHistoryStore, HistoryConfig, HistoryStore, InMemoryHistory, SessionLocks, StoreKind,
};
pub use llm::{LanguageModel, ModelBinding, ModelCompletion, ModelProvider, StubModel};
pub use logging::init_tracing;
pub use message::{Message, Role, ToolCall, ToolObservation, ToolResult, Turn, TurnRole};
pub use pear::{PearLoader, PEAR_VERSION};
pub use pool::{Pool, PoolBuilder, PoolResponse, RunControl, DEFAULT_MAX_ITER};
pub use retry::RetryPolicy;
pub use router::{AgentRef, RosterEntry, RoutingAgent, Selection};
pub use tool::{
    FunctionTool, OnError, ParamType, Parameter, ParameterSchema, Tool, ToolCatalog,
    ToolDescription, ToolParam, ToolPolicy, ToolRegistry, ToolResolver,
};

pub use tokio_util::sync::CancellationToken;
