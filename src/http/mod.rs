//! Hrana over pipelined HTTP requests.
//!
//! Each stream is driven by its own background task, which batches every
//! operation queued at the moment of a flush into one pipeline request and
//! carries the server's baton from one request to the next.

mod client;
mod conn;
mod cursor;
mod stream;

pub use client::HttpClient;
pub use stream::HttpStream;
