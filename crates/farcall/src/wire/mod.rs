//! Wire protocol for the call service.
//!
//! - **codec**: multipart frame codec for AsyncRead/AsyncWrite streams
//! - **envelope**: request/reply envelopes and the recoverable fault taxonomy
//! - **image**: image payloads with shape and element-type metadata

pub mod codec;
pub mod envelope;
pub mod image;
