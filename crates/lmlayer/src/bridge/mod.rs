//! Message bridge between the host proxy and the model worker.
//!
//! # Architecture
//!
//! - **protocol**: Message kinds and payload shapes shared by both sides
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **channel**: In-process `postMessage` pair (no shared state)

pub mod channel;
pub mod codec;
pub mod protocol;
