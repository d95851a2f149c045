//! UDP transport adapter.
//!
//! Binds a tokio [`UdpSocket`], decodes datagrams through a caller-supplied
//! hook (the SIP parser lives outside this crate) and feeds the inbound
//! message channel the manager consumes. UDP is unreliable, so every
//! retransmission timer in the transaction layer runs at full strength.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::Transport;

const MAX_UDP_PACKET_SIZE: usize = 65_535;
const INCOMING_QUEUE_SIZE: usize = 100;

/// Turns a received datagram into a parsed message. Returning `None` drops
/// the datagram (after a log line).
pub type Decoder = dyn Fn(&[u8]) -> Option<Message> + Send + Sync;

pub struct UdpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    decode: Box<Decoder>,
    socket: OnceLock<Arc<UdpSocket>>,
    closed: AtomicBool,
    incoming_tx: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Creates an unbound transport; [`Transport::listen`] binds the socket
    /// and starts the receive loop.
    pub fn new(decode: impl Fn(&[u8]) -> Option<Message> + Send + Sync + 'static) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        UdpTransport {
            inner: Arc::new(Inner {
                decode: Box::new(decode),
                socket: OnceLock::new(),
                closed: AtomicBool::new(false),
                incoming_tx: Mutex::new(Some(incoming_tx)),
                incoming_rx: Mutex::new(Some(incoming_rx)),
                recv_task: Mutex::new(None),
            }),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.inner
            .socket
            .get()
            .cloned()
            .ok_or_else(|| Error::Transport("transport is not listening".to_string()))
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .field(
                "local_addr",
                &self.inner.socket.get().and_then(|s| s.local_addr().ok()),
            )
            .finish()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn listen(&self, addr: &str) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        debug!(local = %socket.local_addr()?, "UDP transport listening");
        self.inner
            .socket
            .set(socket.clone())
            .map_err(|_| Error::Transport("transport is already listening".to_string()))?;

        let incoming_tx = self
            .inner
            .incoming_tx
            .lock()
            .expect("incoming sender lock poisoned")
            .take()
            .ok_or_else(|| Error::Transport("transport was already started".to_string()))?;

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_UDP_PACKET_SIZE];
            loop {
                let (len, src) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        if inner.closed.load(Ordering::Acquire) {
                            break;
                        }
                        error!(error = %e, "error receiving UDP packet");
                        continue;
                    }
                };
                match (inner.decode)(&buffer[..len]) {
                    Some(msg) => {
                        debug!(source = %src, msg = %msg.short(), "received message");
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => warn!(source = %src, len, "dropping undecodable datagram"),
                }
            }
        });
        *self
            .inner
            .recv_task
            .lock()
            .expect("receive task lock poisoned") = Some(task);
        Ok(())
    }

    async fn send(&self, addr: &str, msg: Message) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }
        let socket = self.socket()?;
        let dest = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::Transport(format!("cannot resolve {}", addr)))?;
        let rendered = msg.to_string();
        socket.send_to(rendered.as_bytes(), dest).await?;
        Ok(())
    }

    async fn stop(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self
            .inner
            .recv_task
            .lock()
            .expect("receive task lock poisoned")
            .take()
        {
            task.abort();
        }
        debug!("UDP transport stopped");
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner
            .incoming_rx
            .lock()
            .expect("incoming receiver lock poisoned")
            .take()
    }
}
