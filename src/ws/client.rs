use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use super::actor::{self, Shared};
use super::{Command, Release, WsStream};
use crate::id_alloc::IdAlloc;
use crate::sql::SqlOwner;
use crate::wire::ws::{Request, Response};
use crate::{ClientOptions, HranaError, Result, Sql};

/// State shared by a [`WsClient`] and the streams opened from it.
pub(crate) struct WsShared {
    cmd_tx: mpsc::UnboundedSender<Command>,
    version_rx: watch::Receiver<Option<u32>>,
    closed: Arc<Mutex<Option<HranaError>>>,
    stream_ids: Arc<Mutex<IdAlloc>>,
    cursor_ids: Arc<Mutex<IdAlloc>>,
    sql_ids: Mutex<IdAlloc>,
    pub options: ClientOptions,
}

impl WsShared {
    pub fn closed_error(&self) -> Option<HranaError> {
        self.closed
            .lock()
            .as_ref()
            .map(|reason| HranaError::closed("WebSocket client is closed", Some(reason.clone())))
    }

    pub fn check_open(&self) -> Result<()> {
        match self.closed_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| self.gone())
    }

    fn gone(&self) -> HranaError {
        self.closed_error().unwrap_or_else(|| {
            HranaError::closed("WebSocket client is closed", None)
        })
    }

    /// Sends a request and waits for its response.
    pub async fn request(&self, request: Request, stream_id: Option<i32>) -> Result<Response> {
        self.send_request(request, stream_id, None).await
    }

    /// Like [`WsShared::request`], releasing an id once the server answers.
    pub async fn request_with_release(
        &self,
        request: Request,
        stream_id: i32,
        release: Release,
    ) -> Result<Response> {
        self.send_request(request, Some(stream_id), Some(release))
            .await
    }

    async fn send_request(
        &self,
        request: Request,
        stream_id: Option<i32>,
        release: Option<Release>,
    ) -> Result<Response> {
        self.check_open()?;
        let (tx, rx) = oneshot::channel();
        self.send(Command::Request {
            request,
            stream_id,
            reply: Some(tx),
            release,
        })?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Sends a request without waiting; failures are logged by the connection task.
    pub fn request_detached(&self, request: Request, stream_id: Option<i32>, release: Option<Release>) {
        let kind = request.kind();
        let cmd = Command::Request {
            request,
            stream_id,
            reply: None,
            release,
        };
        if self.cmd_tx.send(cmd).is_err() {
            tracing::debug!(kind, "websocket connection is gone, dropping request");
        }
    }

    pub fn fail_stream(&self, stream_id: i32, error: HranaError) {
        let _ = self.cmd_tx.send(Command::FailStream { stream_id, error });
    }

    pub fn alloc_cursor_id(&self) -> i32 {
        self.cursor_ids.lock().alloc()
    }

    pub fn free_cursor_id(&self, cursor_id: i32) {
        if let Err(err) = self.cursor_ids.lock().free(cursor_id) {
            tracing::warn!(%err, "failed to free cursor id");
        }
    }

    /// Resolves once the subprotocol has been negotiated.
    pub async fn version(&self) -> Result<u32> {
        let mut version_rx = self.version_rx.clone();
        loop {
            if let Some(version) = *version_rx.borrow_and_update() {
                return Ok(version);
            }
            if version_rx.changed().await.is_err() {
                return Err(self.gone());
            }
        }
    }

    pub fn version_hint(&self) -> Option<u32> {
        *self.version_rx.borrow()
    }

    /// Fails unless the negotiated version is at least `min_version`, without waiting.
    pub fn require_version_now(&self, feature: &'static str, min_version: u32) -> Result<()> {
        let version = self.version_hint().ok_or_else(|| {
            HranaError::Misuse(format!(
                "the protocol version is not known yet; await `get_version()` before using {feature}"
            ))
        })?;
        crate::stream::check_version(feature, min_version, version)
    }

    fn close(&self, reason: HranaError) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.clone());
        }
        let _ = self.cmd_tx.send(Command::Close { error: reason });
    }
}

impl SqlOwner for WsShared {
    fn store_sql(&self, sql: &str) -> Result<i32> {
        self.check_open()?;
        self.require_version_now("store_sql", 2)?;
        let sql_id = self.sql_ids.lock().alloc();
        self.request_detached(
            Request::StoreSql {
                sql_id,
                sql: sql.to_owned(),
            },
            None,
            None,
        );
        Ok(sql_id)
    }

    fn close_sql(&self, sql_id: i32) {
        if self.is_closed() {
            return;
        }
        self.request_detached(Request::CloseSql { sql_id }, None, None);
        if let Err(err) = self.sql_ids.lock().free(sql_id) {
            tracing::warn!(%err, "failed to free sql id");
        }
    }
}

/// Hrana client over a single WebSocket connection.
///
/// The connection is established in the background: operations issued
/// before the handshake completes are queued and sent once it does. The
/// client never reconnects; once the socket closes every operation fails
/// with [`HranaError::Closed`].
#[derive(Clone)]
pub struct WsClient {
    url: String,
    shared: Arc<WsShared>,
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url)
            .field("jwt", &"<redacted>")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl WsClient {
    /// Starts connecting to `url` (`ws://` or `wss://`) with default options.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect(url: impl Into<String>, jwt: Option<String>) -> Self {
        Self::connect_with_options(url, jwt, ClientOptions::default())
    }

    pub fn connect_with_options(
        url: impl Into<String>,
        jwt: Option<String>,
        options: ClientOptions,
    ) -> Self {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (version_tx, version_rx) = watch::channel(None);
        let closed = Arc::new(Mutex::new(None));
        let stream_ids = Arc::new(Mutex::new(IdAlloc::new()));
        let cursor_ids = Arc::new(Mutex::new(IdAlloc::new()));

        tokio::spawn(actor::run(
            url.clone(),
            jwt,
            options.timeout(),
            cmd_rx,
            Shared {
                closed: closed.clone(),
                stream_ids: stream_ids.clone(),
                cursor_ids: cursor_ids.clone(),
                version_tx,
            },
        ));

        Self {
            url,
            shared: Arc::new(WsShared {
                cmd_tx,
                version_rx,
                closed,
                stream_ids,
                cursor_ids,
                sql_ids: Mutex::new(IdAlloc::new()),
                options,
            }),
        }
    }

    /// Resolves the protocol version negotiated with the server.
    pub async fn get_version(&self) -> Result<u32> {
        self.shared.version().await
    }

    /// Opens a new stream on this connection.
    pub fn open_stream(&self) -> Result<WsStream> {
        self.shared.check_open()?;
        let stream_id = self.shared.stream_ids.lock().alloc();
        self.shared
            .request_detached(Request::OpenStream { stream_id }, Some(stream_id), None);
        tracing::debug!(stream_id, "opened websocket stream");
        Ok(WsStream::new(self.shared.clone(), stream_id))
    }

    /// Stores SQL text on the server for the lifetime of the connection.
    ///
    /// Requires protocol version 2, which must already be known.
    pub fn store_sql(&self, sql: &str) -> Result<Sql> {
        Sql::store(self.shared.clone(), sql)
    }

    /// Closes the connection, failing every pending operation.
    pub fn close(&self) {
        self.shared
            .close(HranaError::closed("WebSocket client was manually closed", None));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}
