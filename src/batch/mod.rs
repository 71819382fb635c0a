//! The batch coordination core: one `BatchCoordinator` per client
//! transaction fans each statement out across per-shard sub-clients,
//! aggregates their asynchronous completions, and decides exactly once
//! how to answer the client.

mod state;

pub use state::BatchState;

use crate::backend::{BackendError, BackendTransport, BatchDispatch, SubClient, TransportErr};
use crate::config::BatchConfig;
use crate::error::BatchErr;
use crate::routing::{BatchFragment, StatementRouter};
use crate::scheduler::{Resolution, Scheduler, StateEntry};
use crate::session::{ResponseBatch, SessionContext};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Coordinates one transaction's worth of batch statements. Bound 1:1 to
/// a transaction for its whole life and abandoned when the transaction
/// ends, never reused across transactions.
///
/// Completion bookkeeping is written from arbitrary sub-client callback
/// threads, so those fields are atomics or short-lived mutex sections.
/// State advancement is not written from callback threads at all: it runs
/// inside scheduler work items, which execute in post order for one
/// coordinator.
pub struct BatchCoordinator {
    /// Stable for the coordinator's lifetime, correlation only.
    trans_id: String,
    /// Correlation prefix carried on every log line of this coordinator.
    log_id: String,

    state: Mutex<BatchState>,
    /// Cleared only while `state` is Quit; once false, completion signals
    /// are ignored. Release on store, Acquire on load.
    alive: AtomicBool,
    /// User-closed latch; AcqRel swap makes the close call unique.
    closed_user: AtomicBool,

    /// Raw payload of the in-flight statement.
    statement: Mutex<Vec<u8>>,
    /// Shard name to fragment, replaced wholesale before each dispatch.
    fragments: Mutex<HashMap<String, BatchFragment>>,
    /// One sub-client per shard, kept for the life of the transaction so
    /// successive statements reuse the same backend leg.
    shard_clients: Mutex<HashMap<String, Arc<dyn SubClient>>>,
    /// Client-id to handle for the current statement only.
    active: Mutex<HashMap<String, Arc<dyn SubClient>>>,
    /// Client-id to "result received". The false-to-true edge is taken
    /// under the lock, so exactly one signal per id bumps `finished`.
    returned: Mutex<HashMap<String, bool>>,
    /// Count of distinct client ids that have reported. AcqRel increments.
    finished: AtomicUsize,
    /// First abort wins; consumed (swapped false) by the resolving call.
    abort_detected: AtomicBool,
    /// Pending error packets for the in-flight statement, arrival order.
    errors: Mutex<Vec<BackendError>>,
    /// One-shot emission latch; makes a racing duplicate resolution a
    /// no-op. Re-armed when the next statement is routed.
    responded: AtomicBool,
    /// Monotonic client-id source, scoped to the coordinator's lifetime.
    id_gen: AtomicU64,

    session: Arc<dyn SessionContext>,
    router: Arc<dyn StatementRouter>,
    transport: Arc<dyn BackendTransport>,
    scheduler: Arc<dyn Scheduler>,
    config: Arc<BatchConfig>,
}

impl BatchCoordinator {
    pub fn new(
        session: Arc<dyn SessionContext>,
        router: Arc<dyn StatementRouter>,
        transport: Arc<dyn BackendTransport>,
        scheduler: Arc<dyn Scheduler>,
        config: Arc<BatchConfig>,
    ) -> Arc<BatchCoordinator> {
        let trans_id = session.transaction_id();
        let log_id = format!(
            "batch transId={},clientConnId={}",
            trans_id,
            session.connection_id()
        );

        Arc::new(BatchCoordinator {
            trans_id,
            log_id,
            state: Mutex::new(BatchState::Analyze),
            alive: AtomicBool::new(true),
            closed_user: AtomicBool::new(false),
            statement: Mutex::new(Vec::new()),
            fragments: Mutex::new(HashMap::new()),
            shard_clients: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            returned: Mutex::new(HashMap::new()),
            finished: AtomicUsize::new(0),
            abort_detected: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            responded: AtomicBool::new(false),
            id_gen: AtomicU64::new(0),
            session,
            router,
            transport,
            scheduler,
            config,
        })
    }

    pub fn trans_id(&self) -> &str {
        &self.trans_id
    }

    pub fn current_state(&self) -> BatchState {
        *self.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn statement(&self) -> Vec<u8> {
        self.statement.lock().unwrap().clone()
    }

    pub fn group_name(&self) -> String {
        self.session.group_name()
    }

    pub fn autocommit(&self) -> bool {
        self.session.autocommit()
    }

    pub fn bind_master(&self) -> bool {
        self.session.bind_master()
    }

    /// Accepts the next statement of the transaction and posts an Analyze
    /// re-entry. Callable once the previous statement has resolved.
    pub fn submit(self: &Arc<Self>, statement: Vec<u8>) {
        if !self.is_alive() {
            warn!(log_id = %self.log_id, "statement submitted to a dead coordinator, ignoring");
            return;
        }
        *self.statement.lock().unwrap() = statement;
        self.enqueue(BatchState::Analyze);
    }

    /// Posts a Quit re-entry. The parent session calls this when the
    /// transaction ends or the client disconnects.
    pub fn quit(self: &Arc<Self>) {
        self.enqueue(BatchState::Quit);
    }

    fn enqueue(self: &Arc<Self>, target: BatchState) {
        self.scheduler.post(
            StateEntry {
                ctx: Arc::clone(self),
                target,
            }
            .into(),
        );
    }

    /// Advances the state tag. Targets outside the transition table are
    /// logged and ignored; re-entering the current state is a no-op.
    pub fn enter(&self, target: BatchState) {
        let mut state = self.state.lock().unwrap();
        if *state == target {
            return;
        }
        if !state.transitions().contains(&target) {
            error!(log_id = %self.log_id, current = %state, requested = %target, "invalid state transition, ignoring");
            return;
        }
        debug!(log_id = %self.log_id, from = %state, to = %target, "state transition");
        *state = target;
    }

    /// Runs the current phase once and reports whether further internal
    /// progress is possible without external input.
    pub fn step(self: &Arc<Self>) -> bool {
        match self.current_state() {
            BatchState::Analyze => self.on_analyze(),
            BatchState::Handle => self.on_handle(),
            BatchState::Result => self.try_resolve(None),
            BatchState::Quit => self.on_quit(),
        }
    }

    /// Steps until the machine is quiescent.
    pub fn drive(self: &Arc<Self>) {
        while self.step() {}
    }

    fn on_analyze(self: &Arc<Self>) -> bool {
        let statement = self.statement.lock().unwrap().clone();
        if statement.is_empty() {
            return false;
        }
        match self.router.route(&statement) {
            Ok(fragments) if fragments.is_empty() => {
                debug!(log_id = %self.log_id, "statement routed to zero shards, nothing to dispatch");
                self.statement.lock().unwrap().clear();
                false
            }
            Ok(fragments) => {
                self.set_fragments(fragments);
                self.responded.store(false, Ordering::Release);
                self.enter(BatchState::Handle);
                true
            }
            Err(e) => {
                error!(log_id = %self.log_id, error = %e, "failed to route batch statement, closing client connection");
                self.close_client_conn();
                self.enter(BatchState::Quit);
                true
            }
        }
    }

    fn on_handle(self: &Arc<Self>) -> bool {
        let fragments: Vec<BatchFragment> =
            self.fragments.lock().unwrap().values().cloned().collect();

        for fragment in fragments {
            if self.dispatch_fragment(fragment).is_err() {
                self.enter(BatchState::Quit);
                return true;
            }
        }

        self.enter(BatchState::Result);
        true
    }

    /// Opens (or reuses) the shard's sub-client and dispatches one
    /// fragment on it. Any failure is fatal for the statement; the
    /// client connection is already closed when this returns an error.
    fn dispatch_fragment(self: &Arc<Self>, fragment: BatchFragment) -> Result<(), BatchErr> {
        let client = match self.shard_client(&fragment.shard) {
            Ok(client) => client,
            Err(e) => {
                error!(log_id = %self.log_id, shard = %fragment.shard, error = %e, "failed to open sub-client, closing client connection");
                self.close_client_conn();
                return Err(e.into());
            }
        };
        self.dispatch(client, fragment)
    }

    fn on_quit(&self) -> bool {
        let clients: Vec<Arc<dyn SubClient>> = self
            .shard_clients
            .lock()
            .unwrap()
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in &clients {
            client.terminate("batch session quit");
        }
        self.active.lock().unwrap().clear();
        self.mark_dead();
        info!(log_id = %self.log_id, released = clients.len(), "{self} quit");
        false
    }

    fn shard_client(&self, shard: &str) -> Result<Arc<dyn SubClient>, TransportErr> {
        let mut clients = self.shard_clients.lock().unwrap();
        if let Some(client) = clients.get(shard) {
            return Ok(Arc::clone(client));
        }
        let client = self.transport.open(shard)?;
        clients.insert(shard.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Starts one sub-client for one fragment. On start failure the leg
    /// is terminated, the client connection force-closed and the handle
    /// left unregistered; the statement cannot be served anymore.
    pub fn dispatch(
        self: &Arc<Self>,
        client: Arc<dyn SubClient>,
        fragment: BatchFragment,
    ) -> Result<(), BatchErr> {
        let client_id = self.generate_client_id();
        let shard = fragment.shard.clone();
        let dispatch = BatchDispatch {
            client_id: client_id.clone(),
            fragment,
            request_id: self.session.current_request_id(),
            rpc_id: self.session.next_rpc_id(),
            sink: CompletionSink {
                ctx: Arc::clone(self),
            },
        };

        if !client.execute(dispatch) {
            error!(log_id = %self.log_id, shard = %shard, %client_id, "failed to execute sub-client, closing client connection");
            client.terminate("failed to execute");
            self.close_client_conn();
            return Err(BatchErr::Dispatch(shard));
        }

        self.active.lock().unwrap().insert(client_id.clone(), client);
        self.returned.lock().unwrap().insert(client_id, false);
        Ok(())
    }

    /// Marks one client id as returned. Unknown ids are a protocol
    /// anomaly: logged and dropped, never an escalation. Only the genuine
    /// false-to-true edge bumps the completed count, so re-signals are
    /// safe no-ops.
    pub fn signal_completion(&self, client_id: &str) {
        if !self.is_alive() {
            return;
        }
        let mut returned = self.returned.lock().unwrap();
        match returned.get_mut(client_id) {
            None => {
                warn!(log_id = %self.log_id, client_id, "completion signal for unknown client id, ignoring");
            }
            Some(seen) if !*seen => {
                *seen = true;
                self.finished.fetch_add(1, Ordering::AcqRel);
            }
            Some(_) => {}
        }
    }

    /// An abort notification means the backend side is tearing the whole
    /// leg down; ordinary errors collected so far are moot. First abort
    /// wins, later ones are dropped.
    pub fn signal_abort(&self, err: BackendError) {
        if self.abort_detected.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut errors = self.errors.lock().unwrap();
        errors.clear();
        errors.push(err);
    }

    /// Queues an ordinary error unless an abort already dominates it.
    /// The flag is re-checked under the list lock so an error can never
    /// slip in behind a concurrent abort's clear.
    pub fn add_ordinary_error(&self, err: BackendError) {
        let mut errors = self.errors.lock().unwrap();
        if self.abort_detected.load(Ordering::Acquire) {
            return;
        }
        errors.push(err);
    }

    fn all_results_received(&self) -> bool {
        let active = self.active.lock().unwrap();
        !active.is_empty() && self.finished.load(Ordering::Acquire) >= active.len()
    }

    /// The single point deciding the client-visible outcome, deliberately
    /// deferred until every dispatched sub-client has reported even when
    /// some already reported a fatal error: answering early would let the
    /// client issue the next statement while stale legs of this one are
    /// still in flight. Returns whether the statement resolved.
    pub fn try_resolve(&self, packets: Option<VecDeque<Vec<u8>>>) -> bool {
        if self.current_state() == BatchState::Quit {
            return false;
        }
        if !self.all_results_received() {
            return false;
        }
        if self.abort_detected.swap(false, Ordering::AcqRel) {
            self.close_client_conn();
            self.enter(BatchState::Quit);
            return true;
        }
        self.respond(packets)
    }

    /// Emits the one response for the resolved statement and re-arms the
    /// coordinator for the transaction's next statement. Guarded by the
    /// `responded` latch, so a duplicate resolution emits nothing.
    fn respond(&self, packets: Option<VecDeque<Vec<u8>>>) -> bool {
        let errors = self.errors.lock().unwrap().clone();
        if !errors.is_empty() {
            self.enter(BatchState::Analyze);
            if !self.responded.swap(true, Ordering::AcqRel) {
                // Reset before emitting: the client may submit the next
                // statement the moment the response reaches it.
                self.reset();
                let first = &errors[0];
                if self.config.is_abort_code(first.code) {
                    // The backend already forced the leg closed; its error
                    // packet must not reach the client as an ordinary error.
                    debug!(log_id = %self.log_id, code = first.code, "abort-class error resolved the statement, suppressing error packets");
                } else {
                    self.session.send_response(ResponseBatch::Errors(errors));
                }
            }
            return true;
        }

        match packets {
            Some(packets) if !packets.is_empty() => {
                self.enter(BatchState::Analyze);
                if !self.responded.swap(true, Ordering::AcqRel) {
                    self.reset();
                    self.session.send_response(ResponseBatch::Results(packets));
                }
                true
            }
            _ => false,
        }
    }

    /// Replaces the per-statement fragment map wholesale.
    pub fn set_fragments(&self, fragments: HashMap<String, BatchFragment>) {
        let mut current = self.fragments.lock().unwrap();
        current.clear();
        current.extend(fragments);
    }

    /// Clears per-statement state. The transaction identifier, liveness,
    /// user-closed latch, shard clients and id generator survive.
    pub fn reset(&self) {
        self.statement.lock().unwrap().clear();
        self.fragments.lock().unwrap().clear();
        self.active.lock().unwrap().clear();
        self.returned.lock().unwrap().clear();
        self.finished.store(0, Ordering::Release);
        self.errors.lock().unwrap().clear();
    }

    /// Next correlation id for a dispatch, unique within the
    /// coordinator's life even when shard clients are reused.
    pub fn generate_client_id(&self) -> String {
        (self.id_gen.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Effective only while the coordinator is in Quit; a coordinator
    /// whose in-flight work has not been formally terminated stays alive.
    pub fn mark_dead(&self) {
        if self.current_state() != BatchState::Quit {
            return;
        }
        self.alive.store(false, Ordering::Release);
    }

    /// Requests the parent session to tear down the client-facing
    /// channel; the latch makes repeated calls no-ops.
    pub fn close_client_conn(&self) {
        if !self.closed_user.swap(true, Ordering::AcqRel) {
            self.session.close_client_conn();
        }
    }
}

impl fmt::Display for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BatchCoordinator[transId:{}, state:{}]",
            self.trans_id,
            self.current_state()
        )
    }
}

/// The coordinator's half of the sub-client completion protocol. Each
/// dispatch carries one clone; the transport calls exactly one of the
/// three methods, from whatever thread it completes on. Bookkeeping is
/// updated inline, the resolution check is posted to the scheduler.
#[derive(Clone)]
pub struct CompletionSink {
    ctx: Arc<BatchCoordinator>,
}

impl CompletionSink {
    pub fn on_success(&self, client_id: &str, packets: VecDeque<Vec<u8>>) {
        if !self.ctx.is_alive() {
            debug!(log_id = %self.ctx.log_id, client_id, "success signal for dead coordinator, ignoring");
            return;
        }
        self.ctx.signal_completion(client_id);
        self.post_resolution(Some(packets));
    }

    pub fn on_ordinary_error(&self, client_id: &str, err: BackendError) {
        if !self.ctx.is_alive() {
            debug!(log_id = %self.ctx.log_id, client_id, "error signal for dead coordinator, ignoring");
            return;
        }
        self.ctx.add_ordinary_error(err);
        self.ctx.signal_completion(client_id);
        self.post_resolution(None);
    }

    pub fn on_abort(&self, client_id: &str, err: BackendError) {
        if !self.ctx.is_alive() {
            debug!(log_id = %self.ctx.log_id, client_id, "abort signal for dead coordinator, ignoring");
            return;
        }
        warn!(log_id = %self.ctx.log_id, client_id, error = %err, "sub-client connection aborted by backend");
        self.ctx.signal_abort(err);
        self.ctx.signal_completion(client_id);
        self.post_resolution(None);
    }

    fn post_resolution(&self, packets: Option<VecDeque<Vec<u8>>>) {
        self.ctx.scheduler.post(
            Resolution {
                ctx: Arc::clone(&self.ctx),
                packets,
            }
            .into(),
        );
    }
}
