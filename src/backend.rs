use crate::batch::CompletionSink;
use crate::routing::BatchFragment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Structured backend error record carried through error aggregation.
/// Whether a code is abort-class is decided by configuration, not here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    pub code: u64,
    pub sql_state: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        BackendError {
            code,
            sql_state: "HY000".to_string(),
            message: message.into(),
        }
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = sql_state.into();
        self
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ({}) {}", self.code, self.sql_state, self.message)
    }
}

impl std::error::Error for BackendError {}

#[derive(Error, Debug)]
pub enum TransportErr {
    #[error("Failed to connect to shard '{0}'")]
    Connection(String),

    #[error("No backend available for shard '{0}'")]
    NoBackend(String),
}

/// Everything a sub-client needs for one fan-out leg of one statement:
/// the per-statement correlation id, the fragment to run, trace ids for
/// logging, and the sink its single terminal signal must go to.
#[derive(Clone)]
pub struct BatchDispatch {
    pub client_id: String,
    pub fragment: BatchFragment,
    pub request_id: String,
    pub rpc_id: String,
    pub sink: CompletionSink,
}

/// One asynchronous channel to one shard backend. The coordinator treats
/// it opaquely: start it, receive exactly one completion notification on
/// the dispatch's sink (`on_success`, `on_ordinary_error` or `on_abort`),
/// delivered from whatever thread the transport completes on.
pub trait SubClient: Send + Sync {
    fn shard(&self) -> &str;

    /// Starts the fragment asynchronously. Returns false when the leg
    /// could not be started; in that case no sink callback will follow.
    fn execute(&self, dispatch: BatchDispatch) -> bool;

    /// Safe to call repeatedly; extra calls are ignored by the transport.
    fn terminate(&self, reason: &str);
}

/// Connection-establishment boundary. Pooling, transport I/O and
/// per-leg cancellation live behind this trait.
pub trait BackendTransport: Send + Sync {
    fn open(&self, shard: &str) -> Result<Arc<dyn SubClient>, TransportErr>;
}
