//! Latest-frame feed over the call layer.
//!
//! [`FrameServer`] holds the most recently written image frame and exports a
//! `read` call returning it as an image reply; [`FrameClient`] wraps a
//! [`Client`] with a `read()` that decodes it. A typical producer is a
//! capture loop writing each grabbed frame; a typical consumer is a remote
//! viewer polling `read`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::client::{CallError, CallReply, Client, ClientConfig};
use crate::endpoint::Endpoint;
use crate::registry::{CallRegistry, InvokeError, ObjectExport};
use crate::runner::{RunnerError, ServerRunner};
use crate::server::{AddressGuard, ServerConfig};
use crate::wire::image::ImageFrame;

/// Well-known port for the frame feed.
pub const DEFAULT_FEED_PORT: u16 = 61616;

/// Call name the feed exports.
pub const DEFAULT_READ_CALL: &str = "FrameServer.read";

/// Readers allow remote feeds a generous window to produce their first frame.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10_000);

const WAIT_INTERVAL: Duration = Duration::from_millis(100);
const MAX_WAIT: Duration = Duration::from_secs(2);

/// Latest-frame cell shared between the writer and the exported read call.
struct FrameSlot {
    frame: Mutex<Option<ImageFrame>>,
    // True until the first read; that read waits a bounded time for a frame
    // so clients connecting right after startup do not see an empty feed.
    fresh: AtomicBool,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            fresh: AtomicBool::new(true),
        }
    }

    fn write(&self, frame: ImageFrame) {
        *self.frame.lock().expect("frame slot lock poisoned") = Some(frame);
    }

    fn clear(&self) {
        *self.frame.lock().expect("frame slot lock poisoned") = None;
    }

    fn read(&self) -> Result<ImageFrame, InvokeError> {
        if self.fresh.swap(false, Ordering::AcqRel) {
            let deadline = Instant::now() + MAX_WAIT;
            while self.is_empty() && Instant::now() < deadline {
                std::thread::sleep(WAIT_INTERVAL);
            }
        }

        self.frame
            .lock()
            .expect("frame slot lock poisoned")
            .clone()
            .ok_or_else(|| InvokeError::fault("no frame available"))
    }

    fn is_empty(&self) -> bool {
        self.frame
            .lock()
            .expect("frame slot lock poisoned")
            .is_none()
    }
}

/// Serves the latest written frame as `FrameServer.read`.
pub struct FrameServer {
    slot: Arc<FrameSlot>,
    registry: Arc<CallRegistry>,
    runner: Option<ServerRunner>,
}

impl FrameServer {
    /// Export the feed and start serving it in the background.
    pub fn start(endpoint: Endpoint, guard: AddressGuard) -> Result<Self, RunnerError> {
        Self::start_with_config(endpoint, guard, ServerConfig::default())
    }

    /// Feed on the well-known frame port, all interfaces.
    pub fn start_default() -> Result<Self, RunnerError> {
        Self::start(Endpoint::bind_on(DEFAULT_FEED_PORT), AddressGuard::new())
    }

    pub fn start_with_config(
        endpoint: Endpoint,
        guard: AddressGuard,
        config: ServerConfig,
    ) -> Result<Self, RunnerError> {
        let slot = Arc::new(FrameSlot::new());
        let registry = Arc::new(CallRegistry::new());

        let read_slot = Arc::clone(&slot);
        registry.register_object(
            ObjectExport::new("FrameServer")
                .image_method("read", move |_params| read_slot.read()),
        );
        registry.rebuild();

        let runner = ServerRunner::spawn(Arc::clone(&registry), guard, endpoint, config)?;
        Ok(Self {
            slot,
            registry,
            runner: Some(runner),
        })
    }

    /// Publish the next frame. Overwrites the previous one.
    pub fn write(&self, frame: ImageFrame) {
        self.slot.write(frame);
    }

    /// The feed's registry, for exporting further calls alongside `read`.
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.runner.as_ref().map(|r| r.local_addr())
    }

    /// Clear the held frame (late readers observe shutdown) and stop serving.
    pub fn stop(mut self) {
        self.slot.clear();
        if let Some(runner) = self.runner.take() {
            runner.join();
        }
    }
}

/// Client for a remote frame feed.
pub struct FrameClient {
    client: Client,
    read_call: String,
}

impl FrameClient {
    pub async fn connect(
        endpoint: &Endpoint,
        read_call: impl Into<String>,
    ) -> Result<Self, CallError> {
        let config = ClientConfig::with_recv_timeout(Some(DEFAULT_READ_TIMEOUT));
        Self::connect_with_config(endpoint, read_call, config).await
    }

    pub async fn connect_default() -> Result<Self, CallError> {
        Self::connect(&Endpoint::connect_to(DEFAULT_FEED_PORT), DEFAULT_READ_CALL).await
    }

    pub async fn connect_with_config(
        endpoint: &Endpoint,
        read_call: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, CallError> {
        let client = Client::connect(endpoint, config).await?;
        Ok(Self {
            client,
            read_call: read_call.into(),
        })
    }

    /// Fetch the current frame. `Ok(None)` means the feed answered but has
    /// no frame (not yet written, or stopping); errors are transport-level.
    pub async fn read(&mut self) -> Result<Option<ImageFrame>, CallError> {
        match self.client.call_simple(&self.read_call).await {
            Ok(CallReply::Image(frame)) => Ok(Some(frame)),
            Ok(_) => Ok(None),
            Err(CallError::Rejected(msg)) => {
                tracing::debug!(call = %self.read_call, msg = %msg, "Feed has no frame");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn close(self) {
        self.client.close().await;
    }
}
