//! Background server runner.
//!
//! Runs bind + serve on a dedicated OS thread with its own current-thread
//! runtime, so a host application's own loop (async or not) keeps running
//! while calls are served. The constructor hands back control only after the
//! spawned thread has completed the bind and reported its outcome, so a
//! caller that immediately connects a client cannot race a not-yet-bound
//! socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use crate::endpoint::Endpoint;
use crate::registry::CallRegistry;
use crate::server::{AddressGuard, ServeError, Server, ServerConfig, StopHandle};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn server thread: {0}")]
    Thread(#[source] io::Error),

    #[error("failed to start server runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error("server thread exited before binding")]
    Died,
}

/// A server running on its own background thread.
///
/// `stop()` follows the server's stop contract (takes effect within one
/// receive timeout); `join()` additionally waits for the thread to exit and
/// the bind address to be released.
pub struct ServerRunner {
    stop: StopHandle,
    thread: Option<thread::JoinHandle<()>>,
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl ServerRunner {
    /// Bind and serve `registry` at `endpoint` on a background thread.
    ///
    /// Returns once the bind has completed; bind failures (including an
    /// address already held by the guard) surface here, synchronously.
    pub fn spawn(
        registry: Arc<CallRegistry>,
        guard: AddressGuard,
        endpoint: Endpoint,
        config: ServerConfig,
    ) -> Result<Self, RunnerError> {
        let mut server = Server::with_config(registry, guard, config);
        let stop = server.stop_handle();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr, RunnerError>>();

        let thread_endpoint = endpoint.clone();
        let thread = thread::Builder::new()
            .name("farcall-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Server runtime failed to start");
                        let _ = ready_tx.send(Err(RunnerError::Runtime(e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    if let Err(e) = server.bind(&thread_endpoint).await {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                    // bind() succeeded, so the address is present.
                    let local_addr = match server.local_addr() {
                        Some(addr) => addr,
                        None => {
                            let _ = ready_tx.send(Err(ServeError::NotBound.into()));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(local_addr));

                    if let Err(e) = server.serve().await {
                        tracing::error!(error = %e, "Serve loop failed");
                    }
                    server.unbind();
                });
            })
            .map_err(RunnerError::Thread)?;

        let local_addr = match ready_rx.recv() {
            Ok(Ok(local_addr)) => local_addr,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(RunnerError::Died);
            }
        };

        tracing::info!(%endpoint, %local_addr, "Server running in background");
        Ok(Self {
            stop,
            thread: Some(thread),
            endpoint,
            local_addr,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Actual bound address; differs from the requested endpoint when the
    /// port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop the serve loop and wait for the thread to exit.
    pub fn join(mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerRunner {
    fn drop(&mut self) {
        // Signal the loop; the thread winds down on its own within one
        // receive timeout. join() is the blocking variant.
        self.stop.stop();
    }
}
