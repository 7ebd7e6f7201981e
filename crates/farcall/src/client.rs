//! Request-socket client: connect, call, decode the matching reply.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::endpoint::Endpoint;
use crate::wire::codec::{FrameCodec, MAX_FRAME_LEN};
use crate::wire::envelope::{Reply, ReplyParseError, Request};
use crate::wire::image::ImageFrame;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(4000);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Bound on one call's receive wait; `None` blocks indefinitely.
    pub recv_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recv_timeout: Some(DEFAULT_CALL_TIMEOUT),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    pub fn with_recv_timeout(recv_timeout: Option<Duration>) -> Self {
        Self {
            recv_timeout,
            ..Self::default()
        }
    }
}

/// Why a call did not produce a decoded reply.
///
/// `Rejected` is the server answering with an error reply; every other
/// variant means no usable reply arrived, so callers can tell "the server
/// rejected the call" from "the server is unreachable".
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The server answered with an error reply.
    #[error("server rejected call: {0}")]
    Rejected(String),

    /// No reply within the receive timeout, or the peer closed the socket.
    #[error("no reply from server")]
    NoReply,

    /// A reply arrived but did not decode.
    #[error("malformed reply: {0}")]
    BadReply(#[from] ReplyParseError),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}

impl CallError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    pub fn is_no_reply(&self) -> bool {
        matches!(self, CallError::NoReply)
    }
}

/// A successful call's decoded reply.
#[derive(Debug, Clone)]
pub enum CallReply {
    Value(Value),
    Raw(Vec<Bytes>),
    Image(ImageFrame),
}

impl CallReply {
    pub fn into_value(self) -> Option<Value> {
        match self {
            CallReply::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_raw(self) -> Option<Vec<Bytes>> {
        match self {
            CallReply::Raw(payloads) => Some(payloads),
            _ => None,
        }
    }

    /// The single raw buffer, for targets that return exactly one.
    pub fn into_single_raw(self) -> Option<Bytes> {
        match self {
            CallReply::Raw(mut payloads) if payloads.len() == 1 => payloads.pop(),
            _ => None,
        }
    }

    pub fn into_image(self) -> Option<ImageFrame> {
        match self {
            CallReply::Image(frame) => Some(frame),
            _ => None,
        }
    }
}

/// One request socket speaking strict request/reply alternation.
///
/// After a `NoReply` timeout the socket may still deliver the stale reply of
/// the timed-out call; callers that keep going after a timeout should drop
/// the client and connect a fresh one.
pub struct Client {
    framed: Framed<TcpStream, FrameCodec>,
    config: ClientConfig,
    endpoint: Endpoint,
}

impl Client {
    /// Connect a request socket, bounded by the config's connect timeout.
    pub async fn connect(endpoint: &Endpoint, config: ClientConfig) -> Result<Self, CallError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(endpoint.authority()))
            .await
            .map_err(|_| CallError::ConnectTimeout)??;
        tracing::debug!(%endpoint, "Connected request socket");

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::with_max_frame_len(config.max_frame_len)),
            config,
            endpoint: endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Invoke a named call with keyword parameters.
    pub async fn call(
        &mut self,
        call: &str,
        params: Map<String, Value>,
    ) -> Result<CallReply, CallError> {
        self.request(Request::with_params(call, params)).await
    }

    /// Invoke a named call with no parameters.
    pub async fn call_simple(&mut self, call: &str) -> Result<CallReply, CallError> {
        self.request(Request::new(call)).await
    }

    async fn request(&mut self, request: Request) -> Result<CallReply, CallError> {
        tracing::debug!(call = %request.call, "REQ");
        self.framed.send(vec![request.encode()]).await?;

        let next = match self.config.recv_timeout {
            Some(wait) => match timeout(wait, self.framed.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(call = %request.call, "Receive timed out");
                    return Err(CallError::NoReply);
                }
            },
            None => self.framed.next().await,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(CallError::Transport(e)),
            None => {
                tracing::warn!(call = %request.call, "Server closed the socket");
                return Err(CallError::NoReply);
            }
        };

        match Reply::decode(message)? {
            Reply::Error(msg) => {
                tracing::debug!(call = %request.call, msg = %msg, "REP error");
                Err(CallError::Rejected(msg))
            }
            Reply::Value(value) => {
                tracing::debug!(call = %request.call, "REP value");
                Ok(CallReply::Value(value))
            }
            Reply::Raw(payloads) => {
                tracing::debug!(call = %request.call, frames = payloads.len(), "REP raw");
                Ok(CallReply::Raw(payloads))
            }
            Reply::Image(frame) => {
                tracing::debug!(call = %request.call, shape = ?frame.shape(), "REP image");
                Ok(CallReply::Image(frame))
            }
        }
    }

    /// Release the socket.
    pub async fn close(mut self) {
        let _ = self.framed.close().await;
        tracing::debug!(endpoint = %self.endpoint, "Closed request socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.recv_timeout, Some(DEFAULT_CALL_TIMEOUT));
    }

    #[test]
    fn single_raw_accessor() {
        let one = CallReply::Raw(vec![Bytes::from_static(b"only")]);
        assert_eq!(one.into_single_raw().unwrap(), Bytes::from_static(b"only"));

        let two = CallReply::Raw(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(two.into_single_raw().is_none());
    }

    #[test]
    fn accessors_match_variants() {
        assert_eq!(
            CallReply::Value(json!(5)).into_value().unwrap(),
            json!(5)
        );
        assert!(CallReply::Value(json!(5)).into_raw().is_none());
        assert!(CallReply::Raw(Vec::new()).into_image().is_none());
    }

    #[tokio::test]
    async fn connect_to_unreachable_address_fails() {
        // Nothing listens here; expect a transport error or timeout, not a hang.
        let endpoint = Endpoint::new("127.0.0.1", 1);
        let config = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        let err = Client::connect(&endpoint, config).await.err().unwrap();
        assert!(matches!(
            err,
            CallError::Transport(_) | CallError::ConnectTimeout
        ));
    }
}
