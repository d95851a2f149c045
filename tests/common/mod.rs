//! Shared fixtures: a scriptable in-memory transport and SIP message
//! builders used across the scenario tests.

#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use sip_transaction::prelude::*;

/// Mock transport: records every outbound message and lets the test inject
/// inbound ones.
pub struct MockTransport {
    reliable: bool,
    fail_sends: AtomicBool,
    closed: AtomicBool,
    listen_addrs: Mutex<Vec<String>>,
    sent_tx: mpsc::UnboundedSender<(String, Message)>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

/// The test's side of a [`MockTransport`].
pub struct TransportProbe {
    /// Every message the transaction layer sent, with its destination.
    pub sent: mpsc::UnboundedReceiver<(String, Message)>,
    inject_tx: mpsc::Sender<Message>,
    transport: Arc<MockTransport>,
}

impl TransportProbe {
    /// Makes every subsequent send fail with a transport error.
    pub fn break_sends(&self) {
        self.transport.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn listen_addrs(&self) -> Vec<String> {
        self.transport.listen_addrs.lock().unwrap().clone()
    }

    /// Drains everything currently recorded as sent.
    pub fn drain_sent(&mut self) -> Vec<(String, Message)> {
        let mut out = Vec::new();
        while let Ok(item) = self.sent.try_recv() {
            out.push(item);
        }
        out
    }

    /// Injects a message and lets the stack process it.
    pub async fn inject(&self, msg: impl Into<Message>) {
        self.inject_tx
            .send(msg.into())
            .await
            .expect("inbound channel closed");
        settle().await;
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("reliable", &self.reliable)
            .finish()
    }
}

pub fn mock_transport(reliable: bool) -> (Arc<MockTransport>, TransportProbe) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inject_tx, incoming_rx) = mpsc::channel(16);
    let transport = Arc::new(MockTransport {
        reliable,
        fail_sends: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        listen_addrs: Mutex::new(Vec::new()),
        sent_tx,
        incoming_rx: Mutex::new(Some(incoming_rx)),
    });
    let probe = TransportProbe {
        sent: sent_rx,
        inject_tx,
        transport: transport.clone(),
    };
    (transport, probe)
}

#[async_trait]
impl Transport for MockTransport {
    async fn listen(&self, addr: &str) -> Result<()> {
        self.listen_addrs.lock().unwrap().push(addr.to_string());
        Ok(())
    }

    async fn send(&self, addr: &str, msg: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock send failure".to_string()));
        }
        self.sent_tx
            .send((addr.to_string(), msg))
            .map_err(|_| Error::ChannelClosed)
    }

    async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.incoming_rx.lock().unwrap().take()
    }
}

pub const CLIENT_ADDR: &str = "client.example.com:5060";
pub const SERVER_ADDR: &str = "server.example.com:5060";

/// Call at the top of a test to see transaction logs while debugging:
/// `RUST_LOG=sip_transaction=trace cargo test -- --nocapture`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Lets every runnable task make progress without moving the paused clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Paused-clock equivalent of letting `d` of wall time pass.
pub async fn elapse(d: std::time::Duration) {
    tokio::time::advance(d).await;
    settle().await;
}

pub fn request(method: Method, branch: &str) -> Request {
    let uri = Uri::sip("bob", "server.example.com");
    Request::new(method.clone(), uri)
        .with_header(Header::Via(Via(vec![ViaHop::new(
            "UDP",
            "client.example.com",
            Some(5060),
        )
        .with_branch(branch)])))
        .with_header(Header::From(
            NameAddr::new(Uri::sip("alice", "client.example.com")).with_tag("from-tag-1"),
        ))
        .with_header(Header::To(NameAddr::new(Uri::sip("bob", "server.example.com"))))
        .with_header(Header::CallId(format!("cid-{}", branch)))
        .with_header(Header::CSeq(CSeq::new(1, method)))
}

pub fn invite(branch: &str) -> Request {
    request(Method::Invite, branch)
}

pub fn options(branch: &str) -> Request {
    request(Method::Options, branch)
}

/// Builds a response to `origin` with the usual identity headers copied
/// over. `to_tag` goes onto a fresh To header when given.
pub fn response_to(origin: &Request, status: u16, reason: &str, to_tag: Option<&str>) -> Response {
    let mut res = Response::new(status, reason);
    copy_headers("Via", origin, &mut res);
    copy_headers("From", origin, &mut res);
    match to_tag {
        Some(tag) => {
            let addr = origin.to().expect("origin has To").clone().with_tag(tag);
            res.add_header(Header::To(addr));
        }
        None => copy_headers("To", origin, &mut res),
    }
    copy_headers("Call-ID", origin, &mut res);
    copy_headers("CSeq", origin, &mut res);
    res
}

/// The ACK a remote UAC would send for a non-2xx final response: same
/// branch as the INVITE, CSeq method swapped to ACK.
pub fn ack_for_final(origin: &Request) -> Request {
    let branch = origin.branch().expect("origin has branch").to_string();
    let cseq = origin.cseq().expect("origin has CSeq").seq;
    let mut ack = request(Method::Ack, &branch);
    ack.headers.retain(|h| h.name() != "CSeq");
    ack.add_header(Header::CSeq(CSeq::new(cseq, Method::Ack)));
    ack
}

pub fn method_of(msg: &Message) -> Option<Method> {
    match msg {
        Message::Request(req) => Some(req.method.clone()),
        Message::Response(_) => None,
    }
}

pub fn status_of(msg: &Message) -> Option<u16> {
    match msg {
        Message::Request(_) => None,
        Message::Response(res) => Some(res.status),
    }
}
