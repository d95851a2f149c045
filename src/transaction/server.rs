//! Server transactions: RFC 3261 §17.2.1 (INVITE) and §17.2.2 (non-INVITE).
//!
//! A server transaction starts in `proceeding` once the manager has stored
//! it. Retransmissions of the originating request are absorbed by re-sending
//! the last response; TU responses drive the state machine through
//! `completed` (and, for INVITE, `confirmed` once the ACK arrives).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::message::{copy_headers, HasHeaders, Header, Message, Method, Request, Response};
use crate::timer::{send_after, TimerHandle, TimerSettings};
use crate::transaction::key::TransactionKey;
use crate::transaction::store::TransactionStore;
use crate::transaction::{AtomicTransactionState, TransactionState};

/// How many absorbed ACKs the TU queue buffers.
const ACK_QUEUE_SIZE: usize = 1;
/// How many errors the per-transaction TU queue buffers.
const ERRORS_QUEUE_SIZE: usize = 1;

/// Inputs fed to a server transaction's event loop.
#[derive(Debug, Clone)]
pub(crate) enum ServerInput {
    /// A request correlated to this transaction (a retransmission of the
    /// origin, or the ACK for a non-2xx final).
    Receive(Request),
    /// A response handed down by the TU.
    Respond(Response),
    /// Response retransmission timer (INVITE, non-reliable transports).
    TimerG,
    /// Wait for ACK.
    TimerH,
    /// Linger in `confirmed` absorbing ACK retransmissions.
    TimerI,
    /// Linger in `completed` absorbing request retransmissions (non-INVITE).
    TimerJ,
}

/// Correlation handle kept in the transaction store.
#[derive(Debug, Clone)]
pub(crate) struct ServerTxHandle {
    cmd_tx: mpsc::UnboundedSender<ServerInput>,
}

impl ServerTxHandle {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<ServerInput>) -> Self {
        ServerTxHandle { cmd_tx }
    }

    pub(crate) fn receive(&self, req: Request) {
        let _ = self.cmd_tx.send(ServerInput::Receive(req));
    }
}

/// The TU-facing side of a server transaction.
#[derive(Debug)]
pub struct ServerTransaction {
    key: TransactionKey,
    origin: Request,
    state: Arc<AtomicTransactionState>,
    cmd_tx: mpsc::UnboundedSender<ServerInput>,
    ack: mpsc::Receiver<Request>,
    errors: mpsc::Receiver<Error>,
}

impl ServerTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// The received request that created this transaction.
    pub fn origin(&self) -> &Request {
        &self.origin
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    /// Hands a response to the transaction. The status class decides the
    /// state machine input: 1xx keeps the transaction in `proceeding`, a
    /// final response moves it towards termination.
    pub fn respond(&self, res: Response) -> Result<()> {
        self.cmd_tx
            .send(ServerInput::Respond(res))
            .map_err(|_| Error::Terminated)
    }

    /// Sends a `100 Trying` built from the origin request (Via, From, To,
    /// Call-ID, CSeq and any Timestamp copied over), plus `extra_headers`.
    pub fn trying(&self, extra_headers: Vec<Header>) -> Result<()> {
        self.respond(make_trying(&self.origin, extra_headers))
    }

    /// ACKs absorbed for a non-2xx final response (RFC 3261 §17.2.1).
    pub fn ack(&mut self) -> &mut mpsc::Receiver<Request> {
        &mut self.ack
    }

    /// Timeout and transport errors. The transaction is terminated by the
    /// time anything arrives here.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<Error> {
        &mut self.errors
    }
}

/// Creates a server transaction for `request`, stores its correlation handle
/// (so retransmissions match before the TU ever sees it) and spawns the
/// event loop.
pub(crate) fn spawn(
    key: TransactionKey,
    request: Request,
    destination: String,
    transport: Arc<dyn crate::transport::Transport>,
    store: Arc<TransactionStore>,
    settings: TimerSettings,
) -> ServerTransaction {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_SIZE);
    let (errors_tx, errors_rx) = mpsc::channel(ERRORS_QUEUE_SIZE);
    let state = Arc::new(AtomicTransactionState::new(TransactionState::Proceeding));

    store.put_server(key.clone(), ServerTxHandle::new(cmd_tx.clone()));

    let reliable = transport.is_reliable();
    let task = ServerTask {
        key: key.clone(),
        invite: request.method == Method::Invite,
        origin: request.clone(),
        destination,
        reliable,
        transport,
        store,
        state: state.clone(),
        cmd_tx: cmd_tx.clone(),
        cmd_rx,
        ack_tx,
        errors_tx,
        last_response: None,
        timer_g: None,
        timer_g_interval: settings.t1,
        timer_h: None,
        timer_i: None,
        timer_j: None,
        settings,
    };
    tokio::spawn(task.run());

    ServerTransaction {
        key,
        origin: request,
        state,
        cmd_tx,
        ack: ack_rx,
        errors: errors_rx,
    }
}

/// A transaction-less ACK (the acknowledgement of a 2xx has its own branch
/// and never matches the INVITE server transaction). It is surfaced to the
/// TU as an already-terminated server transaction: `respond` fails and
/// nothing is stored.
pub(crate) fn degenerate(key: TransactionKey, request: Request) -> ServerTransaction {
    let (cmd_tx, _) = mpsc::unbounded_channel();
    let (_, ack_rx) = mpsc::channel(ACK_QUEUE_SIZE);
    let (_, errors_rx) = mpsc::channel(ERRORS_QUEUE_SIZE);
    ServerTransaction {
        key,
        origin: request,
        state: Arc::new(AtomicTransactionState::new(TransactionState::Terminated)),
        cmd_tx,
        ack: ack_rx,
        errors: errors_rx,
    }
}

struct ServerTask {
    key: TransactionKey,
    invite: bool,
    origin: Request,
    destination: String,
    reliable: bool,
    transport: Arc<dyn crate::transport::Transport>,
    store: Arc<TransactionStore>,
    state: Arc<AtomicTransactionState>,
    cmd_tx: mpsc::UnboundedSender<ServerInput>,
    cmd_rx: mpsc::UnboundedReceiver<ServerInput>,
    ack_tx: mpsc::Sender<Request>,
    errors_tx: mpsc::Sender<Error>,
    last_response: Option<Response>,
    timer_g: Option<TimerHandle>,
    timer_g_interval: Duration,
    timer_h: Option<TimerHandle>,
    timer_i: Option<TimerHandle>,
    timer_j: Option<TimerHandle>,
    settings: TimerSettings,
}

impl ServerTask {
    async fn run(mut self) {
        debug!(id = %self.key, method = %self.origin.method, dest = %self.destination,
               "starting server transaction");
        while !self.state.get().is_terminated() {
            match self.cmd_rx.recv().await {
                Some(input) => self.dispatch(input).await,
                None => break,
            }
        }
        trace!(id = %self.key, "server transaction event loop ended");
    }

    async fn dispatch(&mut self, input: ServerInput) {
        match input {
            ServerInput::Receive(req) => {
                if req.method == self.origin.method {
                    self.on_retransmitted_request().await;
                } else if req.method == Method::Ack {
                    self.on_ack(req);
                } else {
                    warn!(id = %self.key, method = %req.method,
                          "invalid message correlated to server transaction");
                }
            }
            ServerInput::Respond(res) => self.on_respond(res).await,
            ServerInput::TimerG => self.on_timer_g().await,
            ServerInput::TimerH => self.on_timer_h(),
            ServerInput::TimerI => self.on_timer_i(),
            ServerInput::TimerJ => self.on_timer_j(),
        }
    }

    /// A retransmission of the originating request: re-send whatever we last
    /// answered, if anything.
    async fn on_retransmitted_request(&mut self) {
        match self.state.get() {
            TransactionState::Proceeding | TransactionState::Completed => {
                match self.last_response.clone() {
                    Some(last) => {
                        debug!(id = %self.key, status = last.status,
                               "retransmitted request, re-sending last response");
                        self.send_response(&last).await;
                    }
                    None => trace!(id = %self.key, "retransmitted request, nothing to re-send yet"),
                }
            }
            state => trace!(id = %self.key, state = ?state, "absorbing retransmitted request"),
        }
    }

    /// ACK for a non-2xx final response.
    fn on_ack(&mut self, ack: Request) {
        match self.state.get() {
            TransactionState::Completed => {
                debug!(id = %self.key, "ACK received, state transition: Completed -> Confirmed");
                self.timer_g = None;
                self.timer_h = None;
                self.state.set(TransactionState::Confirmed);
                if self.ack_tx.try_send(ack).is_err() {
                    warn!(id = %self.key, "TU ack queue full or gone, dropping ACK");
                }
                self.timer_i = Some(send_after(
                    self.settings.timer_i(self.reliable),
                    self.cmd_tx.clone(),
                    ServerInput::TimerI,
                ));
            }
            TransactionState::Confirmed => {
                trace!(id = %self.key, "absorbing retransmitted ACK");
            }
            state => warn!(id = %self.key, state = ?state, "ACK in unexpected state, ignoring"),
        }
    }

    async fn on_respond(&mut self, res: Response) {
        if self.state.get() != TransactionState::Proceeding {
            warn!(id = %self.key, status = res.status, state = ?self.state.get(),
                  "TU response ignored outside Proceeding state");
            return;
        }
        self.last_response = Some(res.clone());
        if !self.send_response(&res).await {
            return;
        }
        if res.is_provisional() {
            // Stay in Proceeding; the response is remembered for
            // retransmission absorption.
        } else if res.is_success() {
            if self.invite {
                // 2xx responses to INVITE are the TU/dialog layer's to
                // retransmit; the transaction is done.
                self.terminate();
            } else {
                self.enter_completed_non_invite();
            }
        } else if res.is_redirection_or_error() {
            if self.invite {
                self.enter_completed_invite();
            } else {
                self.enter_completed_non_invite();
            }
        }
    }

    async fn on_timer_g(&mut self) {
        if self.state.get() != TransactionState::Completed {
            return;
        }
        if let Some(last) = self.last_response.clone() {
            debug!(id = %self.key, status = last.status, "timer G fired, re-sending final response");
            self.send_response(&last).await;
        }
        self.timer_g_interval = std::cmp::min(self.timer_g_interval * 2, self.settings.t2);
        if let Some(timer_g) = &self.timer_g {
            timer_g.reset(self.timer_g_interval);
        }
    }

    fn on_timer_h(&mut self) {
        if self.state.get() != TransactionState::Completed {
            return;
        }
        warn!(id = %self.key, "timed out waiting for ACK");
        self.report(Error::Timeout(self.key.clone()));
        self.terminate();
    }

    fn on_timer_i(&mut self) {
        if self.state.get() == TransactionState::Confirmed {
            debug!(id = %self.key, "timer I fired, terminating");
            self.terminate();
        }
    }

    fn on_timer_j(&mut self) {
        if self.state.get() == TransactionState::Completed {
            debug!(id = %self.key, "timer J fired, terminating");
            self.terminate();
        }
    }

    /// Non-2xx final sent on an INVITE transaction: retransmit it on timer G
    /// (non-reliable transports) until the ACK arrives or timer H gives up.
    fn enter_completed_invite(&mut self) {
        debug!(id = %self.key, "state transition: Proceeding -> Completed");
        self.state.set(TransactionState::Completed);
        if !self.reliable {
            self.timer_g_interval = self.settings.t1;
            self.timer_g = Some(send_after(
                self.timer_g_interval,
                self.cmd_tx.clone(),
                ServerInput::TimerG,
            ));
        }
        self.timer_h = Some(send_after(
            self.settings.transaction_timeout,
            self.cmd_tx.clone(),
            ServerInput::TimerH,
        ));
    }

    /// Final sent on a non-INVITE transaction: linger for timer J to absorb
    /// request retransmissions.
    fn enter_completed_non_invite(&mut self) {
        debug!(id = %self.key, "state transition: Proceeding -> Completed");
        self.state.set(TransactionState::Completed);
        self.timer_j = Some(send_after(
            self.settings.timer_j(self.reliable),
            self.cmd_tx.clone(),
            ServerInput::TimerJ,
        ));
    }

    /// Returns whether the send succeeded; a failure has already terminated
    /// the transaction.
    async fn send_response(&mut self, res: &Response) -> bool {
        let msg = Message::Response(res.clone());
        match self.transport.send(&self.destination, msg).await {
            Ok(()) => true,
            Err(e) => {
                self.transport_failed(e);
                false
            }
        }
    }

    fn report(&mut self, err: Error) {
        if self.errors_tx.try_send(err).is_err() {
            warn!(id = %self.key, "TU error queue full or gone, dropping error");
        }
    }

    fn transport_failed(&mut self, err: Error) {
        error!(id = %self.key, error = %err, "transport failure, terminating transaction");
        self.report(err);
        self.terminate();
    }

    fn terminate(&mut self) {
        self.timer_g = None;
        self.timer_h = None;
        self.timer_i = None;
        self.timer_j = None;
        self.state.set(TransactionState::Terminated);
        self.store.remove_server(&self.key);
        debug!(id = %self.key, "server transaction terminated");
    }
}

/// Builds the `100 Trying` for `origin`: Via, From, To, Call-ID and CSeq are
/// copied over, and per RFC 3261 §8.2.6.1 any Timestamp header comes along
/// too.
pub(crate) fn make_trying(origin: &Request, extra_headers: Vec<Header>) -> Response {
    let mut trying = Response::new(100, "Trying");
    trying.version = origin.version.clone();
    copy_headers("Via", origin, &mut trying);
    copy_headers("From", origin, &mut trying);
    copy_headers("To", origin, &mut trying);
    copy_headers("Call-ID", origin, &mut trying);
    copy_headers("CSeq", origin, &mut trying);
    copy_headers("Timestamp", origin, &mut trying);
    for h in extra_headers {
        trying.add_header(h);
    }
    trying
}
