//! farcall: call-export and request/reply RPC over multipart message sockets.
//!
//! A host application exports named callables into a [`CallRegistry`], each
//! with a fixed payload kind (plain JSON value, raw byte buffers, or an image
//! frame with shape/dtype metadata), rebuilds the dispatch table, and serves
//! it with a [`Server`] (or a background [`ServerRunner`]). A remote process
//! connects a [`Client`] and invokes calls by name; replies come back typed
//! by the target's payload kind. The built-in `list-calls` call enumerates
//! everything exported.
//!
//! # Architecture
//!
//! - **wire**: multipart frame codec, envelopes, fault taxonomy, image payloads
//! - **registry**: exported targets and the atomically published dispatch table
//! - **server** / **client**: the reply and request ends of the socket pair
//! - **runner**: serves in the background so the host loop keeps running
//! - **frames**: latest-image feed built on top of the call layer

pub mod client;
pub mod endpoint;
pub mod frames;
pub mod registry;
pub mod runner;
pub mod server;
pub mod wire;

pub use client::{CallError, CallReply, Client, ClientConfig};
pub use endpoint::{DEFAULT_PORT, Endpoint, EndpointError};
pub use frames::{DEFAULT_FEED_PORT, DEFAULT_READ_CALL, FrameClient, FrameServer};
pub use registry::{
    Callable, CallRegistry, DispatchTable, InvokeError, LIST_CALLS, ObjectExport, Params, Payload,
    PayloadKind,
};
pub use runner::{RunnerError, ServerRunner};
pub use server::{AddressGuard, ServeError, Server, ServerConfig, StopHandle};
pub use wire::envelope::{Fault, Reply, ReplyHeader, Request};
pub use wire::image::{Dtype, ImageError, ImageFrame};
