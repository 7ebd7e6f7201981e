//! Reply-socket server: bind, serve loop, dispatch.
//!
//! One server serves one registry at one address. A lightweight transport
//! task per connection reads a request message, hands it to the single
//! dispatch loop, and writes the reply before reading the next message, so
//! request/reply alternation holds per connection while dispatch stays
//! strictly one request at a time in arrival order across connections.
//!
//! The dispatch loop receives with a timeout so it can check the stop flag
//! between iterations; `stop()` therefore takes effect within one receive
//! timeout at worst.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::registry::{CallRegistry, Params};
use crate::wire::codec::{FrameCodec, MAX_FRAME_LEN, Message};
use crate::wire::envelope::{Fault, Reply, Request};

/// Receive timeout between stop-flag checks.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(4000);

type RequestQueue = mpsc::Sender<(Message, oneshot::Sender<Message>)>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long one receive blocks before the loop re-checks the stop flag.
    /// Callers that need prompt shutdown set this short.
    pub recv_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

/// Shared set of addresses held by live servers, so two listeners cannot
/// silently collide on one port. Collaborating servers share a clone;
/// independent fixtures create their own.
#[derive(Debug, Clone, Default)]
pub struct AddressGuard {
    held: Arc<Mutex<HashSet<String>>>,
}

impl AddressGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, endpoint: &Endpoint) -> bool {
        self.held
            .lock()
            .expect("address guard lock poisoned")
            .contains(&endpoint.authority())
    }

    fn acquire(&self, endpoint: &Endpoint) -> bool {
        self.held
            .lock()
            .expect("address guard lock poisoned")
            .insert(endpoint.authority())
    }

    fn release(&self, endpoint: &Endpoint) {
        self.held
            .lock()
            .expect("address guard lock poisoned")
            .remove(&endpoint.authority());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("address already bound in this process: {0}")]
    AddressHeld(Endpoint),

    #[error("server is already bound to {0}")]
    AlreadyBound(Endpoint),

    #[error("server is not bound")]
    NotBound,

    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),
}

/// Cloneable handle that stops a serve loop. Terminal: a stopped server
/// stays stopped.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Debug)]
struct BoundState {
    endpoint: Endpoint,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Serves one registry's dispatch table at one bound address.
///
/// Lifecycle: unbound → [`bind`](Server::bind) → [`serve`](Server::serve) →
/// stop → unbind.
pub struct Server {
    registry: Arc<CallRegistry>,
    guard: AddressGuard,
    config: ServerConfig,
    stop: CancellationToken,
    bound: Option<BoundState>,
}

impl Server {
    pub fn new(registry: Arc<CallRegistry>, guard: AddressGuard) -> Self {
        Self::with_config(registry, guard, ServerConfig::default())
    }

    pub fn with_config(
        registry: Arc<CallRegistry>,
        guard: AddressGuard,
        config: ServerConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            config,
            stop: CancellationToken::new(),
            bound: None,
        }
    }

    /// Bind the reply socket. Refused if a live server in this process
    /// already holds the address.
    pub async fn bind(&mut self, endpoint: &Endpoint) -> Result<(), ServeError> {
        if let Some(bound) = &self.bound {
            return Err(ServeError::AlreadyBound(bound.endpoint.clone()));
        }
        if !self.guard.acquire(endpoint) {
            tracing::error!(%endpoint, "Address already held by another server");
            return Err(ServeError::AddressHeld(endpoint.clone()));
        }

        let listener = match TcpListener::bind(endpoint.authority()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.guard.release(endpoint);
                return Err(ServeError::Bind(e));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                self.guard.release(endpoint);
                return Err(ServeError::Bind(e));
            }
        };
        tracing::info!(%endpoint, %local_addr, "Bound reply socket");

        self.bound = Some(BoundState {
            endpoint: endpoint.clone(),
            listener,
            local_addr,
        });
        Ok(())
    }

    /// Actual bound address; differs from the requested endpoint when the
    /// port was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.as_ref().map(|b| b.local_addr)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Receive/dispatch/reply until stopped.
    ///
    /// Request decode faults become error replies; a send failure closes
    /// that connection and the loop continues.
    pub async fn serve(&mut self) -> Result<(), ServeError> {
        let bound = self.bound.as_ref().ok_or(ServeError::NotBound)?;
        let listener = &bound.listener;
        tracing::info!(endpoint = %bound.endpoint, "Serving calls");

        let (queue_tx, mut queue_rx) =
            mpsc::channel::<(Message, oneshot::Sender<Message>)>(1);

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            tokio::select! {
                conn = listener.accept() => match conn {
                    Ok((stream, peer)) => {
                        tracing::trace!(%peer, "Peer connected");
                        tokio::spawn(connection_loop(
                            stream,
                            peer,
                            queue_tx.clone(),
                            self.stop.clone(),
                            self.config.max_frame_len,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },

                received = timeout(self.config.recv_timeout, queue_rx.recv()) => match received {
                    // Idle tick; loop around and re-check the stop flag.
                    Err(_) => continue,
                    Ok(None) => break,
                    Ok(Some((message, reply_tx))) => {
                        let reply = handle_message(&self.registry, &message);
                        let _ = reply_tx.send(reply.encode());
                    }
                },
            }
        }

        self.stop.cancel();
        tracing::info!(endpoint = %bound.endpoint, "Serve loop stopped");
        Ok(())
    }

    /// Release the bound socket and its address-guard entry.
    pub fn unbind(&mut self) {
        if let Some(bound) = self.bound.take() {
            self.guard.release(&bound.endpoint);
            tracing::info!(endpoint = %bound.endpoint, "Unbound reply socket");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(bound) = self.bound.take() {
            self.guard.release(&bound.endpoint);
        }
    }
}

/// Decode one request message and dispatch it. Every fault becomes an error
/// reply; this function never fails.
fn handle_message(registry: &CallRegistry, message: &Message) -> Reply {
    let request = match parse_request(message) {
        Ok(request) => request,
        Err(fault) => {
            tracing::error!(error = %fault, "Rejected request");
            return Reply::Error(fault.to_string());
        }
    };

    tracing::debug!(call = %request.call, "REQ");
    let params = Params::new(request.params);
    let table = registry.table();
    match table.dispatch(&request.call, &params) {
        Ok(payload) => {
            tracing::debug!(call = %request.call, "REP ok");
            payload.into()
        }
        Err(fault) => {
            tracing::error!(call = %request.call, error = %fault, "REP error");
            Reply::Error(fault.to_string())
        }
    }
}

fn parse_request(message: &Message) -> Result<Request, Fault> {
    // A request is a single envelope frame; payload frames belong to replies.
    match message.as_slice() {
        [envelope] => Request::parse(envelope),
        _ => Err(Fault::BadRequest),
    }
}

/// Per-connection transport task: read one message, queue it for dispatch,
/// write the reply, repeat. Alternation per connection is enforced by
/// awaiting the reply before the next read.
async fn connection_loop(
    stream: TcpStream,
    peer: SocketAddr,
    queue: RequestQueue,
    stop: CancellationToken,
    max_frame_len: usize,
) {
    let mut framed = Framed::new(stream, FrameCodec::with_max_frame_len(max_frame_len));

    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "Receive failed");
                    break;
                }
                None => {
                    tracing::trace!(%peer, "Peer disconnected");
                    break;
                }
            },
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if queue.send((message, reply_tx)).await.is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            break;
        };

        if let Err(e) = framed.send(reply).await {
            tracing::warn!(%peer, error = %e, "Send failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio_util::bytes::Bytes;

    fn test_registry() -> Arc<CallRegistry> {
        let registry = CallRegistry::new();
        registry.register_value("echo", |params| params.require::<Value>("text"));
        registry.rebuild();
        Arc::new(registry)
    }

    fn request_frames(body: &[u8]) -> Message {
        vec![Bytes::copy_from_slice(body)]
    }

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.recv_timeout, DEFAULT_RECV_TIMEOUT);
        assert_eq!(config.max_frame_len, MAX_FRAME_LEN);
    }

    #[test]
    fn handle_dispatches_echo() {
        let registry = test_registry();
        let reply = handle_message(
            &registry,
            &request_frames(br#"{"kind":"call","call":"echo","params":{"text":"hi"}}"#),
        );
        assert_eq!(reply, Reply::Value(json!("hi")));
    }

    #[test]
    fn handle_reports_bad_json() {
        let registry = test_registry();
        let reply = handle_message(&registry, &request_frames(b"{broken"));
        assert_eq!(reply, Reply::Error("JSON error".to_string()));
    }

    #[test]
    fn handle_reports_unknown_call() {
        let registry = test_registry();
        let reply = handle_message(&registry, &request_frames(b"nope"));
        assert_eq!(reply, Reply::Error("Unknown call: nope".to_string()));
    }

    #[test]
    fn multi_frame_request_is_bad_request() {
        let registry = test_registry();
        let reply = handle_message(
            &registry,
            &vec![Bytes::from_static(b"echo"), Bytes::from_static(b"extra")],
        );
        assert_eq!(reply, Reply::Error("Bad request".to_string()));
    }

    #[tokio::test]
    async fn second_bind_on_held_address_is_refused() {
        let guard = AddressGuard::new();
        let endpoint = Endpoint::new("127.0.0.1", 0);

        let mut first = Server::new(test_registry(), guard.clone());
        first.bind(&endpoint).await.unwrap();
        assert!(guard.is_held(&endpoint));

        let mut second = Server::new(test_registry(), guard.clone());
        let err = second.bind(&endpoint).await.unwrap_err();
        assert!(matches!(err, ServeError::AddressHeld(_)));
    }

    #[tokio::test]
    async fn unbind_releases_the_address() {
        let guard = AddressGuard::new();
        let endpoint = Endpoint::new("127.0.0.1", 0);

        let mut server = Server::new(test_registry(), guard.clone());
        server.bind(&endpoint).await.unwrap();
        server.unbind();
        assert!(!guard.is_held(&endpoint));

        let mut again = Server::new(test_registry(), guard.clone());
        again.bind(&endpoint).await.unwrap();
    }

    #[tokio::test]
    async fn drop_releases_the_address() {
        let guard = AddressGuard::new();
        let endpoint = Endpoint::new("127.0.0.1", 0);

        {
            let mut server = Server::new(test_registry(), guard.clone());
            server.bind(&endpoint).await.unwrap();
        }
        assert!(!guard.is_held(&endpoint));
    }

    #[tokio::test]
    async fn rebinding_a_bound_server_is_an_error() {
        let guard = AddressGuard::new();
        let mut server = Server::new(test_registry(), guard);
        server.bind(&Endpoint::new("127.0.0.1", 0)).await.unwrap();
        let err = server.bind(&Endpoint::new("127.0.0.1", 0)).await.unwrap_err();
        assert!(matches!(err, ServeError::AlreadyBound(_)));
    }

    #[tokio::test]
    async fn serve_without_bind_is_an_error() {
        let guard = AddressGuard::new();
        let mut server = Server::new(test_registry(), guard);
        assert!(matches!(server.serve().await, Err(ServeError::NotBound)));
    }
}
