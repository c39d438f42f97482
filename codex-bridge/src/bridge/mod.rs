//! Line protocol bridge to the app-server subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Request, Response, Notification) and RpcError
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: serialized writes and single-pass message stream over the child's pipes

pub mod codec;
pub mod protocol;
pub mod transport;
