//! Client transactions: RFC 3261 §17.1.1 (INVITE) and §17.1.2 (non-INVITE).
//!
//! Both variants share one event loop and state set
//! (`calling → proceeding → completed → terminated`); they differ in how
//! timer A backs off, whether retransmission continues in `proceeding`, how
//! a final response is absorbed, and whether a non-2xx final is ACKed from
//! inside the transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::message::{copy_headers, CSeq, HasHeaders, Header, Message, Method, Request, Response};
use crate::timer::{send_after, TimerHandle, TimerSettings};
use crate::transaction::key::TransactionKey;
use crate::transaction::store::TransactionStore;
use crate::transaction::{AtomicTransactionState, TransactionState};

/// How many responses the per-transaction TU queue buffers.
const RESPONSES_QUEUE_SIZE: usize = 3;
/// How many errors the per-transaction TU queue buffers.
const ERRORS_QUEUE_SIZE: usize = 1;

/// Inputs fed to a client transaction's event loop.
#[derive(Debug, Clone)]
pub(crate) enum ClientInput {
    /// A response correlated to this transaction by the dispatcher.
    Response(Response),
    /// Retransmission timer.
    TimerA,
    /// Transaction timeout.
    TimerB,
    /// Linger after a final response.
    TimerD,
}

/// Correlation handle kept in the transaction store; forwards matched
/// responses into the event loop.
#[derive(Debug, Clone)]
pub(crate) struct ClientTxHandle {
    cmd_tx: mpsc::UnboundedSender<ClientInput>,
}

impl ClientTxHandle {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<ClientInput>) -> Self {
        ClientTxHandle { cmd_tx }
    }

    /// Delivers a correlated response. A send failure means the event loop
    /// already terminated; the message is dropped, which is exactly what a
    /// terminated transaction does with late responses.
    pub(crate) fn receive(&self, res: Response) {
        let _ = self.cmd_tx.send(ClientInput::Response(res));
    }
}

/// The TU-facing side of a client transaction.
///
/// Owns the receive halves of the response and error queues; the state
/// machine itself runs on its own task and is observable through
/// [`state`](ClientTransaction::state).
#[derive(Debug)]
pub struct ClientTransaction {
    key: TransactionKey,
    origin: Request,
    state: Arc<AtomicTransactionState>,
    responses: mpsc::Receiver<Response>,
    errors: mpsc::Receiver<Error>,
}

impl ClientTransaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// The request that started this transaction.
    pub fn origin(&self) -> &Request {
        &self.origin
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    /// Responses passed up by the transaction, in wire-arrival order.
    pub fn responses(&mut self) -> &mut mpsc::Receiver<Response> {
        &mut self.responses
    }

    /// Timeout and transport errors. The transaction is terminated by the
    /// time anything arrives here.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<Error> {
        &mut self.errors
    }

    /// Reserved: the RFC 3261 §9 CANCEL procedure pairs a dedicated CANCEL
    /// client transaction with this one.
    pub fn cancel(&self) -> Result<()> {
        Err(Error::NotSupported("CANCEL"))
    }
}

/// Creates a client transaction, registers it in the store (unless keying
/// failed upstream), and spawns its event loop. The loop performs the
/// initial send and arms timer A (non-reliable transports only) and timer B.
pub(crate) fn spawn(
    key: TransactionKey,
    registered: bool,
    request: Request,
    destination: String,
    transport: Arc<dyn crate::transport::Transport>,
    store: Arc<TransactionStore>,
    settings: TimerSettings,
) -> ClientTransaction {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (responses_tx, responses_rx) = mpsc::channel(RESPONSES_QUEUE_SIZE);
    let (errors_tx, errors_rx) = mpsc::channel(ERRORS_QUEUE_SIZE);
    let state = Arc::new(AtomicTransactionState::new(TransactionState::Calling));

    if registered {
        store.put_client(key.clone(), ClientTxHandle::new(cmd_tx.clone()));
    }

    let reliable = transport.is_reliable();
    let task = ClientTask {
        key: key.clone(),
        invite: request.method == Method::Invite,
        registered,
        origin: request.clone(),
        destination,
        reliable,
        transport,
        store,
        state: state.clone(),
        cmd_tx,
        cmd_rx,
        responses_tx,
        errors_tx,
        timer_a: None,
        timer_a_interval: settings.t1,
        timer_b: None,
        timer_d: None,
        timer_d_duration: settings.timer_d(reliable),
        settings,
    };
    tokio::spawn(task.run());

    ClientTransaction {
        key,
        origin: request,
        state,
        responses: responses_rx,
        errors: errors_rx,
    }
}

struct ClientTask {
    key: TransactionKey,
    invite: bool,
    registered: bool,
    origin: Request,
    destination: String,
    reliable: bool,
    transport: Arc<dyn crate::transport::Transport>,
    store: Arc<TransactionStore>,
    state: Arc<AtomicTransactionState>,
    cmd_tx: mpsc::UnboundedSender<ClientInput>,
    cmd_rx: mpsc::UnboundedReceiver<ClientInput>,
    responses_tx: mpsc::Sender<Response>,
    errors_tx: mpsc::Sender<Error>,
    timer_a: Option<TimerHandle>,
    timer_a_interval: Duration,
    timer_b: Option<TimerHandle>,
    timer_d: Option<TimerHandle>,
    timer_d_duration: Duration,
    settings: TimerSettings,
}

impl ClientTask {
    async fn run(mut self) {
        debug!(id = %self.key, method = %self.origin.method, dest = %self.destination,
               "starting client transaction");
        self.initiate().await;
        while !self.state.get().is_terminated() {
            match self.cmd_rx.recv().await {
                Some(input) => self.dispatch(input).await,
                None => break,
            }
        }
        trace!(id = %self.key, "client transaction event loop ended");
    }

    /// Initial send plus timer arming. Timer A only runs on non-reliable
    /// transports; timer B always runs.
    async fn initiate(&mut self) {
        let msg = Message::Request(self.origin.clone());
        if let Err(e) = self.transport.send(&self.destination, msg).await {
            self.transport_failed(e);
            return;
        }
        if !self.reliable {
            self.timer_a_interval = self.settings.t1;
            self.timer_a = Some(send_after(
                self.timer_a_interval,
                self.cmd_tx.clone(),
                ClientInput::TimerA,
            ));
        }
        self.timer_b = Some(send_after(
            self.settings.transaction_timeout,
            self.cmd_tx.clone(),
            ClientInput::TimerB,
        ));
    }

    async fn dispatch(&mut self, input: ClientInput) {
        match input {
            ClientInput::Response(res) => self.on_response(res).await,
            ClientInput::TimerA => self.on_timer_a().await,
            ClientInput::TimerB => self.on_timer_b(),
            ClientInput::TimerD => self.on_timer_d(),
        }
    }

    async fn on_response(&mut self, res: Response) {
        let state = self.state.get();
        match state {
            TransactionState::Calling | TransactionState::Proceeding => {
                if res.is_provisional() {
                    if state == TransactionState::Calling {
                        debug!(id = %self.key, status = res.status,
                               "state transition: Calling -> Proceeding");
                        self.state.set(TransactionState::Proceeding);
                    }
                    self.pass_up(res);
                } else if res.is_success() {
                    self.pass_up(res);
                    if self.invite {
                        // The TU sends its own ACK for a 2xx, as a separate
                        // transaction.
                        self.terminate();
                    } else {
                        self.enter_completed();
                    }
                } else {
                    self.pass_up(res.clone());
                    if self.invite {
                        self.send_ack(&res).await;
                        if self.state.get().is_terminated() {
                            return;
                        }
                    }
                    self.enter_completed();
                }
            }
            TransactionState::Completed => {
                if self.invite && res.is_redirection_or_error() {
                    // Retransmitted final response; absorb it by re-sending
                    // the ACK.
                    debug!(id = %self.key, status = res.status,
                           "re-ACKing retransmitted final response");
                    self.send_ack(&res).await;
                } else {
                    trace!(id = %self.key, status = res.status,
                           "ignoring response in Completed state");
                }
            }
            TransactionState::Confirmed | TransactionState::Terminated => {
                trace!(id = %self.key, status = res.status,
                       "ignoring response in terminal state");
            }
        }
    }

    async fn on_timer_a(&mut self) {
        let state = self.state.get();
        let resends = match state {
            TransactionState::Calling => true,
            // Non-INVITE requests keep retransmitting while provisionals
            // trickle in; INVITE stops once a provisional arrives.
            TransactionState::Proceeding => !self.invite,
            _ => false,
        };
        if !resends {
            trace!(id = %self.key, state = ?state, "timer A fired outside retransmission window");
            return;
        }
        self.timer_a_interval *= 2;
        if !self.invite && self.timer_a_interval > self.settings.t2 {
            self.timer_a_interval = self.settings.t2;
        }
        if let Some(timer_a) = &self.timer_a {
            timer_a.reset(self.timer_a_interval);
        }
        debug!(id = %self.key, next = ?self.timer_a_interval, "timer A fired, retransmitting request");
        self.resend().await;
    }

    fn on_timer_b(&mut self) {
        let state = self.state.get();
        let times_out = state == TransactionState::Calling
            || (!self.invite && state == TransactionState::Proceeding);
        if !times_out {
            trace!(id = %self.key, state = ?state, "timer B fired outside timeout window");
            return;
        }
        warn!(id = %self.key, "transaction timed out waiting for a final response");
        self.report(Error::Timeout(self.key.clone()));
        self.terminate();
    }

    fn on_timer_d(&mut self) {
        if self.state.get() == TransactionState::Completed {
            debug!(id = %self.key, "timer D fired, terminating");
            self.terminate();
        }
    }

    async fn resend(&mut self) {
        let msg = Message::Request(self.origin.clone());
        if let Err(e) = self.transport.send(&self.destination, msg).await {
            self.transport_failed(e);
        }
    }

    /// Final response seen: stop retransmitting and linger for timer D
    /// (zero on reliable transports) to absorb stragglers.
    fn enter_completed(&mut self) {
        self.timer_a = None;
        self.timer_b = None;
        debug!(id = %self.key, "state transition: -> Completed");
        self.state.set(TransactionState::Completed);
        self.timer_d = Some(send_after(
            self.timer_d_duration,
            self.cmd_tx.clone(),
            ClientInput::TimerD,
        ));
    }

    async fn send_ack(&mut self, res: &Response) {
        match make_ack(&self.origin, res) {
            Ok(ack) => {
                if let Err(e) = self
                    .transport
                    .send(&self.destination, Message::Request(ack))
                    .await
                {
                    self.transport_failed(e);
                }
            }
            Err(e) => {
                error!(id = %self.key, error = %e, "failed to build ACK, abandoning send");
            }
        }
    }

    fn pass_up(&mut self, res: Response) {
        trace!(id = %self.key, status = res.status, "passing response up to TU");
        if self.responses_tx.try_send(res).is_err() {
            warn!(id = %self.key, "TU response queue full or gone, dropping response");
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
        self.timer_a = None;
        self.timer_b = None;
        self.timer_d = None;
        self.state.set(TransactionState::Terminated);
        if self.registered {
            self.store.remove_client(&self.key);
        }
        debug!(id = %self.key, "client transaction terminated");
    }
}

/// Builds the ACK for a non-2xx final response (RFC 3261 §17.1.1.3): the
/// origin's Request-URI, SIP version, From, Call-ID, Route and top Via, a
/// CSeq with the method swapped to ACK, and the To header taken from the
/// response so it carries the to-tag.
fn make_ack(origin: &Request, res: &Response) -> Result<Request> {
    let cseq = origin.cseq().ok_or_else(|| {
        Error::MalformedMessage(format!("{}: missing CSeq header", origin.short()))
    })?;
    let via = origin.via().ok_or_else(|| {
        Error::MalformedMessage(format!("{}: missing Via header", origin.short()))
    })?;

    let mut ack = Request::new(Method::Ack, origin.recipient.clone());
    ack.version = origin.version.clone();
    copy_headers("From", origin, &mut ack);
    copy_headers("Call-ID", origin, &mut ack);
    copy_headers("Route", origin, &mut ack);
    ack.add_header(Header::CSeq(CSeq::new(cseq.seq, Method::Ack)));
    ack.add_header(Header::Via(via.clone()));
    copy_headers("To", res, &mut ack);
    Ok(ack)
}
