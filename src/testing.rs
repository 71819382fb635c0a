//! Deterministic collaborator stand-ins for tests: an inline scheduler,
//! a fixed-table router, a scripted transport whose completions are
//! driven by hand, and a session that records every outcome.

use crate::backend::{BackendTransport, BatchDispatch, SubClient, TransportErr};
use crate::batch::CompletionSink;
use crate::routing::{BatchFragment, RouteErr, StatementRouter};
use crate::scheduler::{Scheduler, WorkItem};
use crate::session::{ResponseBatch, SessionContext};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Runs every work item on the posting thread, making whole fan-out
/// rounds synchronous and single-process deterministic.
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn post(&self, item: WorkItem) {
        item.run();
    }
}

/// Routes every statement to the same fixed fragment table.
pub struct StaticRouter {
    fragments: Option<HashMap<String, BatchFragment>>,
}

impl StaticRouter {
    pub fn for_shards(shards: &[&str]) -> StaticRouter {
        let fragments = shards
            .iter()
            .map(|shard| {
                (
                    shard.to_string(),
                    BatchFragment::new(*shard, format!("insert into t_{shard} values (1)")),
                )
            })
            .collect();
        StaticRouter {
            fragments: Some(fragments),
        }
    }

    pub fn unroutable() -> StaticRouter {
        StaticRouter { fragments: None }
    }
}

impl StatementRouter for StaticRouter {
    fn route(&self, _statement: &[u8]) -> Result<HashMap<String, BatchFragment>, RouteErr> {
        match &self.fragments {
            Some(fragments) => Ok(fragments.clone()),
            None => Err(RouteErr::Unroutable("no shard table".to_string())),
        }
    }
}

/// One dispatch accepted by the scripted transport. Tests drive the
/// statement forward by invoking the recorded sink.
#[derive(Clone)]
pub struct RecordedDispatch {
    pub shard: String,
    pub client_id: String,
    pub query: String,
    pub sink: CompletionSink,
}

#[derive(Default)]
struct TransportState {
    fail_open: Mutex<HashSet<String>>,
    fail_execute: Mutex<HashSet<String>>,
    opened: Mutex<Vec<String>>,
    dispatches: Mutex<Vec<RecordedDispatch>>,
    terminated: Mutex<Vec<(String, String)>>,
}

/// Transport whose per-shard outcomes are scripted up front. Successful
/// dispatches are only recorded; completion signals are delivered later
/// by the test through the recorded sinks, like real backend callbacks.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Arc<TransportState>,
}

impl ScriptedTransport {
    pub fn fail_open(&self, shard: &str) {
        self.state.fail_open.lock().unwrap().insert(shard.to_string());
    }

    pub fn fail_execute(&self, shard: &str) {
        self.state
            .fail_execute
            .lock()
            .unwrap()
            .insert(shard.to_string());
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.opened.lock().unwrap().clone()
    }

    pub fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.state.dispatches.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<(String, String)> {
        self.state.terminated.lock().unwrap().clone()
    }
}

impl BackendTransport for ScriptedTransport {
    fn open(&self, shard: &str) -> Result<Arc<dyn SubClient>, TransportErr> {
        if self.state.fail_open.lock().unwrap().contains(shard) {
            return Err(TransportErr::Connection(shard.to_string()));
        }
        self.state.opened.lock().unwrap().push(shard.to_string());
        Ok(Arc::new(ScriptedClient {
            shard: shard.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedClient {
    shard: String,
    state: Arc<TransportState>,
}

impl SubClient for ScriptedClient {
    fn shard(&self) -> &str {
        &self.shard
    }

    fn execute(&self, dispatch: BatchDispatch) -> bool {
        if self.state.fail_execute.lock().unwrap().contains(&self.shard) {
            return false;
        }
        self.state.dispatches.lock().unwrap().push(RecordedDispatch {
            shard: self.shard.clone(),
            client_id: dispatch.client_id,
            query: dispatch.fragment.query,
            sink: dispatch.sink,
        });
        true
    }

    fn terminate(&self, reason: &str) {
        self.state
            .terminated
            .lock()
            .unwrap()
            .push((self.shard.clone(), reason.to_string()));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Response,
    Closed,
}

/// Session stand-in that records every response batch and close call and
/// publishes an event per outcome so async tests can await them.
pub struct RecordingSession {
    trans_id: String,
    conn_id: u64,
    responses: Mutex<Vec<ResponseBatch>>,
    close_calls: AtomicUsize,
    request_ids: AtomicU64,
    rpc_ids: AtomicU64,
    event_tx: flume::Sender<SessionEvent>,
    event_rx: flume::Receiver<SessionEvent>,
}

impl RecordingSession {
    pub fn new(trans_id: impl Into<String>, conn_id: u64) -> RecordingSession {
        let (event_tx, event_rx) = flume::unbounded();
        RecordingSession {
            trans_id: trans_id.into(),
            conn_id,
            responses: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            request_ids: AtomicU64::new(0),
            rpc_ids: AtomicU64::new(0),
            event_tx,
            event_rx,
        }
    }

    pub fn sent(&self) -> Vec<ResponseBatch> {
        self.responses.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    pub fn events(&self) -> flume::Receiver<SessionEvent> {
        self.event_rx.clone()
    }
}

impl SessionContext for RecordingSession {
    fn transaction_id(&self) -> String {
        self.trans_id.clone()
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }

    fn group_name(&self) -> String {
        "test-group".to_string()
    }

    fn autocommit(&self) -> bool {
        true
    }

    fn bind_master(&self) -> bool {
        false
    }

    fn current_request_id(&self) -> String {
        format!("req-{}", self.request_ids.fetch_add(1, Ordering::Relaxed))
    }

    fn next_rpc_id(&self) -> String {
        format!("rpc-{}", self.rpc_ids.fetch_add(1, Ordering::Relaxed))
    }

    fn send_response(&self, batch: ResponseBatch) {
        self.responses.lock().unwrap().push(batch);
        let _ = self.event_tx.send(SessionEvent::Response);
    }

    fn close_client_conn(&self) {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        let _ = self.event_tx.send(SessionEvent::Closed);
    }
}
