//! `hrana-client` is an async client for the Hrana protocol spoken by libsql
//! servers.
//!
//! Two transports are provided:
//! - [`WsClient`]: one WebSocket connection multiplexing many streams.
//! - [`HttpClient`]: streams continued across pipelined HTTP requests.
//!
//! Both hand out [`Stream`]s, on which statements, batches and cursors run
//! in order. [`Client`] picks the transport from the URL scheme.
//!
//! ```no_run
//! use hrana_client::{Client, ClientOptions, Stmt};
//!
//! # async fn run() -> hrana_client::Result<()> {
//! let client = Client::open("http://127.0.0.1:8080", None, ClientOptions::default())?;
//! let stream = client.open_stream()?;
//! stream.execute(Stmt::new("CREATE TABLE IF NOT EXISTS t (x)")).await?;
//! let result = stream.execute(Stmt::new("SELECT ?").bind(42)).await?;
//! assert_eq!(result.rows[0][0].as_i64(), Some(42));
//! stream.close_gracefully().await?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod client;
mod cursor;
mod decode;
#[doc(hidden)]
pub mod encoding;
mod error;
mod http;
mod id_alloc;
mod options;
mod params;
mod sql;
mod sql_cache;
mod stream;
mod types;
mod value;
pub mod wire;
mod ws;

pub use batch::{Batch, BatchCond, BatchStep, StepRef};
pub use client::Client;
pub use cursor::Cursor;
pub use error::HranaError;
pub use http::{HttpClient, HttpStream};
pub use options::ClientOptions;
pub use params::{Params, SqlText, Stmt};
pub use sql::Sql;
pub use stream::Stream;
pub use types::{
    Col, DescribeCol, DescribeParam, DescribeResult, ResultKind, Row, StepOutput, StepResult,
    StmtResult,
};
pub use value::{IntMode, Value};
pub use ws::{WsClient, WsStream};

pub type Result<T> = std::result::Result<T, HranaError>;
