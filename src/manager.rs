//! The transaction manager: the single entry point of the transaction layer.
//!
//! Owns the transaction store, demultiplexes the transport's inbound stream
//! onto existing transactions, creates server transactions for new requests,
//! and exposes `send` for TU-initiated client transactions. Correlation is
//! non-blocking and runs in arrival order; anything that waits on the TU is
//! spawned off so a slow TU never stalls the dispatcher.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::message::{generate_branch, HasHeaders, Message, Method, Request, Response};
use crate::timer::TimerSettings;
use crate::transaction::key::TransactionKey;
use crate::transaction::store::TransactionStore;
use crate::transaction::{client, server, ClientTransaction, ServerTransaction};
use crate::transport::Transport;

/// How many not-yet-collected server transactions the TU stream buffers.
const REQUESTS_QUEUE_SIZE: usize = 5;
/// How many unmatched responses the TU stream buffers.
const STRAY_RESPONSES_QUEUE_SIZE: usize = 5;

/// The TU's receive side of the manager: new server transactions and
/// responses that matched no client transaction (which RFC 3261 §17.1.1.2
/// says go straight up).
#[derive(Debug)]
pub struct Incoming {
    pub requests: mpsc::Receiver<ServerTransaction>,
    pub responses: mpsc::Receiver<Response>,
}

/// Creates, stores and correlates transactions on top of a [`Transport`].
///
/// Cheap to clone; all clones share the same store and transport. Dropping
/// the manager does not stop in-flight transactions; call
/// [`stop`](TransactionManager::stop) to shut the transport down (in-flight
/// transactions are lost).
#[derive(Debug, Clone)]
pub struct TransactionManager {
    transport: Arc<dyn Transport>,
    store: Arc<TransactionStore>,
    settings: TimerSettings,
    requests_tx: mpsc::Sender<ServerTransaction>,
    stray_tx: mpsc::Sender<Response>,
}

impl TransactionManager {
    /// Starts listening on `local_addr` and spawns the dispatcher over the
    /// transport's inbound stream. `settings` defaults to the RFC 3261
    /// values.
    pub async fn new(
        transport: Arc<dyn Transport>,
        local_addr: &str,
        settings: Option<TimerSettings>,
    ) -> Result<(Self, Incoming)> {
        transport.listen(local_addr).await?;
        let mut incoming = transport.take_incoming().ok_or_else(|| {
            Error::Transport("transport inbound stream was already taken".to_string())
        })?;

        let (requests_tx, requests_rx) = mpsc::channel(REQUESTS_QUEUE_SIZE);
        let (stray_tx, stray_rx) = mpsc::channel(STRAY_RESPONSES_QUEUE_SIZE);

        let manager = TransactionManager {
            transport,
            store: Arc::new(TransactionStore::new()),
            settings: settings.unwrap_or_default(),
            requests_tx,
            stray_tx,
        };

        // Correlation runs inline on the dispatcher task: a store lookup and
        // an unbounded send into the matched FSM never block, and handling
        // messages in arrival order is what keeps per-transaction delivery
        // in wire order. Only the TU-facing enqueues are spawned off.
        let dispatcher = manager.clone();
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                dispatcher.handle(msg).await;
            }
            debug!("transport inbound stream closed, dispatcher exiting");
        });

        Ok((
            manager,
            Incoming {
                requests: requests_rx,
                responses: stray_rx,
            },
        ))
    }

    /// Creates a client transaction for `request` and dispatches the initial
    /// send towards `destination` (`host:port`).
    ///
    /// The transaction is stored before anything hits the wire so the fastest
    /// possible response still correlates. A request whose top Via lacks an
    /// RFC 3261 branch cannot be keyed; the failure is logged and the
    /// returned transaction runs unstored, so responses will not correlate
    /// back to it.
    pub fn send(&self, request: Request, destination: &str) -> ClientTransaction {
        debug!(dest = %destination, msg = %request.short(), "sending request");
        let (key, registered) = match TransactionKey::client_from_request(&request) {
            Ok(key) => (key, true),
            Err(e) => {
                error!(error = %e, msg = %request.short(),
                       "cannot key client transaction, responses will not correlate");
                let branch = generate_branch();
                (TransactionKey::from_parts(&branch, &request.method), false)
            }
        };
        client::spawn(
            key,
            registered,
            request,
            destination.to_string(),
            self.transport.clone(),
            self.store.clone(),
            self.settings.clone(),
        )
    }

    /// Stops the transport. The inbound stream closes, pending sends fail,
    /// and in-flight transactions terminate through their transport-error
    /// paths. Idempotent.
    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    /// Whether a client transaction is currently stored under `key`.
    pub fn has_client_transaction(&self, key: &TransactionKey) -> bool {
        self.store.contains_client(key)
    }

    /// Whether a server transaction is currently stored under `key`.
    pub fn has_server_transaction(&self, key: &TransactionKey) -> bool {
        self.store.contains_server(key)
    }

    async fn handle(&self, msg: Message) {
        trace!(msg = %msg.short(), "dispatching inbound message");
        match msg {
            Message::Request(req) => self.handle_request(req).await,
            Message::Response(res) => self.handle_response(res).await,
        }
    }

    /// RFC 3261 §17.2: match a request to its server transaction, or create
    /// one.
    async fn handle_request(&self, req: Request) {
        let key = match TransactionKey::server(&req) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, msg = %req.short(), "cannot key inbound request, dropping");
                return;
            }
        };

        if let Some(tx) = self.store.get_server(&key) {
            trace!(id = %key, "matched request to existing server transaction");
            tx.receive(req);
            return;
        }

        if req.method == Method::Ack {
            // The ACK for a 2xx carries its own branch, so it never matches
            // the INVITE server transaction. Hand it up transaction-less.
            debug!(id = %key, "unmatched ACK, passing up as transaction-less request");
            self.enqueue_request(server::degenerate(key, req));
            return;
        }

        // Destination for responses comes from the top Via hop, port
        // defaulting to 5060. Not the full §18.2.2 selection, but where the
        // request told us it came from.
        let destination = match req.via_hop() {
            Some(hop) => format!("{}:{}", hop.host, hop.effective_port()),
            None => {
                warn!(msg = %req.short(), "no Via hop on new request, dropping");
                return;
            }
        };

        let is_invite = req.method == Method::Invite;
        debug!(id = %key, dest = %destination, "creating server transaction");
        let tx = server::spawn(
            key,
            req,
            destination,
            self.transport.clone(),
            self.store.clone(),
            self.settings.clone(),
        );

        if is_invite {
            // Answer INVITEs with 100 Trying immediately so the client stops
            // retransmitting; for everything else provisionals are the TU's
            // call.
            if let Err(e) = tx.trying(Vec::new()) {
                warn!(id = %tx.key(), error = %e, "could not send automatic 100 Trying");
            }
        }

        self.enqueue_request(tx);
    }

    /// Hands a new server transaction to the TU on its own task, so a TU
    /// that is slow to drain the requests stream backpressures that task
    /// and not the dispatcher.
    fn enqueue_request(&self, tx: ServerTransaction) {
        let requests_tx = self.requests_tx.clone();
        tokio::spawn(async move {
            if requests_tx.send(tx).await.is_err() {
                warn!("TU requests stream gone, dropping server transaction");
            }
        });
    }

    /// RFC 3261 §17.1.3: match a response to its client transaction;
    /// unmatched responses go straight up to the TU.
    async fn handle_response(&self, res: Response) {
        let key = match TransactionKey::client_from_response(&res) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, msg = %res.short(), "cannot key inbound response, dropping");
                return;
            }
        };

        match self.store.get_client(&key) {
            Some(tx) => {
                trace!(id = %key, "matched response to client transaction");
                tx.receive(res);
            }
            None => {
                debug!(id = %key, status = res.status,
                       "unmatched response, forwarding to TU");
                let stray_tx = self.stray_tx.clone();
                tokio::spawn(async move {
                    if stray_tx.send(res).await.is_err() {
                        warn!("TU responses stream gone, dropping unmatched response");
                    }
                });
            }
        }
    }
}
