use crate::backend::BackendError;
use std::collections::VecDeque;

/// One response decision for one client statement. Error packets stay
/// structured until they cross this boundary; result packets are opaque,
/// already-encoded payloads supplied by the resolving sub-client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseBatch {
    /// Accumulated SQL errors for the statement, in arrival order.
    Errors(Vec<BackendError>),
    /// Result packets forwarded verbatim to the client.
    Results(VecDeque<Vec<u8>>),
}

/// The parent per-client session that owns the client-facing connection
/// and the transaction/autocommit context. The coordinator consumes the
/// read-only accessors and issues exactly one response decision per
/// statement through `send_response`.
pub trait SessionContext: Send + Sync {
    fn transaction_id(&self) -> String;
    fn connection_id(&self) -> u64;
    fn group_name(&self) -> String;
    fn autocommit(&self) -> bool;
    fn bind_master(&self) -> bool;

    /// Trace id of the request currently driven by the session.
    fn current_request_id(&self) -> String;
    /// Next per-leg rpc id, for stamping outgoing dispatches.
    fn next_rpc_id(&self) -> String;

    fn send_response(&self, batch: ResponseBatch);

    /// Tears down the client-facing channel. The coordinator guards this
    /// with its own latch, so implementations may assume at most one call
    /// per coordinator.
    fn close_client_conn(&self);
}
