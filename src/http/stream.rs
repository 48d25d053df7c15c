use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use super::client::ClientShared;
use super::conn::HttpConn;
use super::cursor::HttpCursor;
use crate::cursor::FrameReader;
use crate::id_alloc::IdAlloc;
use crate::sql::SqlOwner;
use crate::sql_cache::SqlCache;
use crate::stream::check_version;
use crate::wire::http::{
    CursorReqBody, CursorRespBody, PipelineReqBody, PipelineRespBody, StreamRequest,
    StreamResponse, StreamResult,
};
use crate::wire;
use crate::{
    Batch, Cursor, DescribeResult, HranaError, Result, Sql, SqlText, Stmt, StmtResult, Stream,
};

type Reply = oneshot::Sender<Result<StreamResponse>>;

enum StreamCmd {
    Request {
        request: StreamRequest,
        reply: Option<Reply>,
    },
    Cursor {
        batch: wire::Batch,
        reply: oneshot::Sender<Result<HttpCursor>>,
    },
}

/// State shared by an [`HttpStream`] handle and its background task.
pub(crate) struct StreamShared {
    cmd_tx: mpsc::UnboundedSender<StreamCmd>,
    conn: Arc<HttpConn>,
    client: Arc<ClientShared>,
    /// Set once the stream stops accepting operations.
    closed: Mutex<Option<HranaError>>,
    /// Set to make the background task drop whatever it is doing.
    abort_tx: watch::Sender<Option<HranaError>>,
    sql_ids: Mutex<IdAlloc>,
    /// Bumped whenever the server ends the session behind the stream.
    session: AtomicU64,
}

impl StreamShared {
    fn closed_error(&self) -> Option<HranaError> {
        if let Some(err) = &*self.closed.lock() {
            return Some(err.clone());
        }
        self.client.closed_error()
    }

    fn check_open(&self) -> Result<()> {
        match self.closed_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn gone(&self) -> HranaError {
        self.closed_error()
            .unwrap_or_else(|| HranaError::closed("stream is closed", None))
    }

    /// Marks the stream closed; returns `false` if it already was.
    fn mark_closed(&self, error: HranaError) -> bool {
        let mut closed = self.closed.lock();
        if closed.is_some() {
            return false;
        }
        *closed = Some(error);
        true
    }

    async fn send_request(&self, request: StreamRequest) -> Result<StreamResponse> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCmd::Request {
                request,
                reply: Some(tx),
            })
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    async fn request(&self, request: StreamRequest) -> Result<StreamResponse> {
        self.check_open()?;
        self.send_request(request).await
    }

    fn request_detached(&self, request: StreamRequest) {
        let kind = request.kind();
        if self
            .cmd_tx
            .send(StreamCmd::Request {
                request,
                reply: None,
            })
            .is_err()
        {
            tracing::debug!(kind, "http stream is gone, dropping request");
        }
    }
}

impl SqlOwner for StreamShared {
    fn store_sql(&self, sql: &str) -> Result<i32> {
        self.check_open()?;
        let sql_id = self.sql_ids.lock().alloc();
        self.request_detached(StreamRequest::StoreSql {
            sql_id,
            sql: sql.to_owned(),
        });
        Ok(sql_id)
    }

    fn close_sql(&self, sql_id: i32) {
        if self.closed_error().is_some() {
            return;
        }
        self.request_detached(StreamRequest::CloseSql { sql_id });
        if let Err(err) = self.sql_ids.lock().free(sql_id) {
            tracing::warn!(%err, "failed to free sql id");
        }
    }

    fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }
}

/// A server-side session continued across HTTP requests.
pub struct HttpStream {
    shared: Arc<StreamShared>,
    sql_cache: Mutex<SqlCache>,
}

impl fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStream")
            .field("url", &self.shared.conn.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn unexpected(response: StreamResponse) -> HranaError {
    HranaError::proto(format!("unexpected {} response", response.kind()))
}

impl HttpStream {
    pub(crate) fn open(client: Arc<ClientShared>, conn: Arc<HttpConn>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (abort_tx, _) = watch::channel(None);
        let capacity = client.options.sql_cache_capacity;
        let shared = Arc::new(StreamShared {
            cmd_tx,
            conn,
            client,
            closed: Mutex::new(None),
            abort_tx,
            sql_ids: Mutex::new(IdAlloc::new()),
            session: AtomicU64::new(0),
        });
        tokio::spawn(run(shared.clone(), cmd_rx));

        Self {
            sql_cache: Mutex::new(SqlCache::new(shared.clone(), capacity)),
            shared,
        }
    }

    async fn version(&self) -> u32 {
        self.shared.conn.endpoint().await.version
    }

    fn prepare<'a>(&self, stmts: impl IntoIterator<Item = &'a mut wire::Stmt>) -> Result<()> {
        self.sql_cache.lock().apply(stmts)
    }
}

#[async_trait]
impl Stream for HttpStream {
    async fn execute(&self, stmt: Stmt) -> Result<StmtResult> {
        let mut stmt = stmt.into_wire()?;
        self.prepare([&mut stmt])?;
        match self.shared.request(StreamRequest::Execute { stmt }).await? {
            StreamResponse::Execute { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    async fn describe(&self, sql: SqlText) -> Result<DescribeResult> {
        let (sql, sql_id) = sql.into_wire()?;
        match self
            .shared
            .request(StreamRequest::Describe { sql, sql_id })
            .await?
        {
            StreamResponse::Describe { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn sequence(&self, sql: SqlText) -> Result<()> {
        let (sql, sql_id) = sql.into_wire()?;
        match self
            .shared
            .request(StreamRequest::Sequence { sql, sql_id })
            .await?
        {
            StreamResponse::Sequence => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_autocommit(&self) -> Result<bool> {
        check_version("get_autocommit", 3, self.version().await)?;
        match self.shared.request(StreamRequest::GetAutocommit).await? {
            StreamResponse::GetAutocommit { is_autocommit } => Ok(is_autocommit),
            other => Err(unexpected(other)),
        }
    }

    fn store_sql(&self, sql: &str) -> Result<Sql> {
        Sql::store(self.shared.clone(), sql)
    }

    async fn get_version(&self) -> Result<u32> {
        self.shared.check_open()?;
        Ok(self.version().await)
    }

    fn close(&self) {
        let error = HranaError::closed("stream was manually closed", None);
        if !self.shared.mark_closed(error.clone()) {
            return;
        }
        tracing::debug!("closing http stream");
        self.sql_cache.lock().clear();
        self.shared.abort_tx.send_replace(Some(error));
    }

    async fn close_gracefully(&self) -> Result<()> {
        self.shared.check_open()?;
        if !self
            .shared
            .mark_closed(HranaError::closed("stream was closed", None))
        {
            return Ok(());
        }
        self.sql_cache.lock().clear();
        match self.shared.send_request(StreamRequest::Close).await? {
            StreamResponse::Close => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed_error().is_some()
    }

    async fn execute_batch(&self, mut batch: wire::Batch) -> Result<wire::BatchResult> {
        self.prepare(batch.steps.iter_mut().map(|step| &mut step.stmt))?;
        match self.shared.request(StreamRequest::Batch { batch }).await? {
            StreamResponse::Batch { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn open_cursor(&self, mut batch: wire::Batch) -> Result<Box<dyn Cursor>> {
        self.shared.check_open()?;
        check_version("cursor", 3, self.version().await)?;
        self.prepare(batch.steps.iter_mut().map(|step| &mut step.stmt))?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .cmd_tx
            .send(StreamCmd::Cursor { batch, reply: tx })
            .map_err(|_| self.shared.gone())?;
        let cursor = rx.await.map_err(|_| self.shared.gone())??;
        Ok(Box::new(cursor))
    }

    fn version_hint(&self) -> Option<u32> {
        self.shared.conn.endpoint_hint().map(|endpoint| endpoint.version)
    }
}

impl Drop for HttpStream {
    fn drop(&mut self) {
        if self
            .shared
            .mark_closed(HranaError::closed("stream was dropped", None))
        {
            self.shared.request_detached(StreamRequest::Close);
        }
    }
}

struct Item {
    request: StreamRequest,
    reply: Option<Reply>,
}

/// Session state owned by the background task.
struct StreamActor {
    shared: Arc<StreamShared>,
    baton: Option<String>,
    base_url: String,
}

/// Resolves once the stream is closed immediately or its client is closed.
async fn aborted(
    abort_rx: &mut watch::Receiver<Option<HranaError>>,
    client_rx: &mut watch::Receiver<Option<HranaError>>,
) -> HranaError {
    loop {
        if let Some(err) = abort_rx.borrow_and_update().clone() {
            return err;
        }
        if let Some(reason) = client_rx.borrow_and_update().clone() {
            return HranaError::closed("HTTP client is closed", Some(reason));
        }
        // Both senders outlive the task, so `changed` only fails after shutdown.
        tokio::select! {
            _ = abort_rx.changed() => {}
            _ = client_rx.changed() => {}
        }
    }
}

async fn run(shared: Arc<StreamShared>, mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>) {
    let mut abort_rx = shared.abort_tx.subscribe();
    let mut client_rx = shared.client.closed_tx.subscribe();
    let mut actor = StreamActor {
        base_url: shared.conn.url.clone(),
        shared,
        baton: None,
    };
    let mut stashed: Option<StreamCmd> = None;

    let reason = loop {
        let cmd = match stashed.take() {
            Some(cmd) => cmd,
            None => tokio::select! {
                reason = aborted(&mut abort_rx, &mut client_rx) => break reason,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break HranaError::closed("stream was dropped", None),
                },
            },
        };

        match cmd {
            StreamCmd::Request { request, reply } => {
                let mut items = vec![Item { request, reply }];
                while !is_closing(&items) {
                    match cmd_rx.try_recv() {
                        Ok(StreamCmd::Request { request, reply }) => {
                            items.push(Item { request, reply })
                        }
                        Ok(other) => {
                            stashed = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let closing = is_closing(&items);
                let flushed = tokio::select! {
                    reason = aborted(&mut abort_rx, &mut client_rx) => break reason,
                    flushed = actor.flush(items) => flushed,
                };
                match flushed {
                    Ok(()) if closing => break HranaError::closed("stream was closed", None),
                    Ok(()) => {}
                    Err(err) => break HranaError::closed("stream is closed", Some(err)),
                }
            }
            StreamCmd::Cursor { batch, reply } => {
                let opened = tokio::select! {
                    reason = aborted(&mut abort_rx, &mut client_rx) => break reason,
                    opened = actor.open_cursor(batch) => opened,
                };
                let done_rx = match opened {
                    Ok((cursor, done_rx)) => {
                        let _ = reply.send(Ok(cursor));
                        done_rx
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err.clone()));
                        break HranaError::closed("stream is closed", Some(err));
                    }
                };

                // Nothing else may use the stream while the cursor is open.
                tokio::select! {
                    reason = aborted(&mut abort_rx, &mut client_rx) => break reason,
                    _ = done_rx => {}
                }
            }
        }
    };

    actor.finish(reason, cmd_rx, stashed).await;
}

fn is_closing(items: &[Item]) -> bool {
    items
        .last()
        .is_some_and(|item| matches!(item.request, StreamRequest::Close))
}

impl StreamActor {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Applies the baton and base URL from a response.
    ///
    /// A response without a baton means the server ended the session. The
    /// stream stays usable: the next request opens a fresh session at the
    /// original URL, and SQL ids from the old session are abandoned.
    fn update_session(&mut self, baton: Option<String>, base_url: Option<String>) {
        if baton.is_none() {
            self.baton = None;
            self.end_session();
            return;
        }
        self.baton = baton;
        if let Some(base_url) = base_url {
            self.base_url = base_url.trim_end_matches('/').to_owned();
        }
    }

    fn end_session(&mut self) {
        tracing::debug!("server ended the http stream session");
        self.base_url = self.shared.conn.url.clone();
        *self.shared.sql_ids.lock() = IdAlloc::new();
        self.shared.session.fetch_add(1, Ordering::AcqRel);
    }

    /// Sends every item as one pipeline request and answers each of them.
    ///
    /// An error means the session is unusable.
    async fn flush(&mut self, items: Vec<Item>) -> Result<()> {
        let (requests, replies): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| (item.request, item.reply))
            .unzip();

        if self.baton.is_none() && matches!(requests.as_slice(), [StreamRequest::Close]) {
            // The server has no session to close.
            for reply in replies.into_iter().flatten() {
                let _ = reply.send(Ok(StreamResponse::Close));
            }
            return Ok(());
        }

        let kinds: Vec<&'static str> = requests.iter().map(StreamRequest::kind).collect();
        let results = match self.send_pipeline(requests).await {
            Ok(results) => results,
            Err(err) => {
                for reply in replies.into_iter().flatten() {
                    let _ = reply.send(Err(err.clone()));
                }
                return Err(err);
            }
        };

        for ((reply, kind), result) in replies.into_iter().zip(kinds).zip(results) {
            let outcome = match result {
                StreamResult::Ok { response } if response.kind() == kind => Ok(response),
                StreamResult::Ok { response } => Err(HranaError::proto(format!(
                    "received a {} response to a {kind} request",
                    response.kind()
                ))),
                StreamResult::Error { error } => Err(HranaError::response(error)),
            };
            match reply {
                Some(reply) => {
                    let _ = reply.send(outcome);
                }
                None => {
                    if let Err(err) = outcome {
                        tracing::warn!(kind, %err, "request failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_pipeline(&mut self, requests: Vec<StreamRequest>) -> Result<Vec<StreamResult>> {
        let endpoint = self.shared.conn.endpoint().await;
        let expected = requests.len();
        let body = PipelineReqBody {
            baton: self.baton.take(),
            requests,
        };
        tracing::debug!(requests = expected, "flushing http pipeline");

        let url = self.url(endpoint.pipeline_path);
        let response = self
            .shared
            .conn
            .post(&url, endpoint.encoding, endpoint.encoding.encode(&body)?, true)
            .await?;
        let data = response.bytes().await?;
        let body: PipelineRespBody = endpoint.encoding.decode(&data)?;

        if body.results.len() != expected {
            return Err(HranaError::proto(format!(
                "result count mismatch: expected {expected}, got {}",
                body.results.len()
            )));
        }
        self.update_session(body.baton, body.base_url);
        Ok(body.results)
    }

    async fn open_cursor(
        &mut self,
        batch: wire::Batch,
    ) -> Result<(HttpCursor, oneshot::Receiver<()>)> {
        let endpoint = self.shared.conn.endpoint().await;
        let cursor_path = endpoint.cursor_path.ok_or(HranaError::ProtocolVersion {
            feature: "cursor",
            min_version: 3,
            actual_version: endpoint.version,
        })?;
        let body = CursorReqBody {
            baton: self.baton.take(),
            batch,
        };

        let url = self.url(cursor_path);
        let response = self
            .shared
            .conn
            .post(&url, endpoint.encoding, endpoint.encoding.encode(&body)?, false)
            .await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(HranaError::from))
            .boxed();
        let mut reader = FrameReader::new(body, endpoint.encoding);

        let head: CursorRespBody = reader
            .next_message()
            .await?
            .ok_or_else(|| HranaError::proto("cursor response is empty"))?;
        self.update_session(head.baton, head.base_url);

        let (done_tx, done_rx) = oneshot::channel();
        Ok((HttpCursor::new(reader, done_tx), done_rx))
    }

    /// Fails whatever is still queued and closes the server session if one is open.
    async fn finish(
        mut self,
        reason: HranaError,
        mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>,
        stashed: Option<StreamCmd>,
    ) {
        tracing::debug!(%reason, "http stream finished");
        self.shared.mark_closed(reason);

        // Dropping the reply senders makes every waiter report the close reason.
        cmd_rx.close();
        drop(stashed);
        while cmd_rx.try_recv().is_ok() {}

        if let Some(baton) = self.baton.take() {
            let body = PipelineReqBody {
                baton: Some(baton),
                requests: vec![StreamRequest::Close],
            };
            let endpoint = self.shared.conn.endpoint().await;
            let url = self.url(endpoint.pipeline_path);
            let sent = match endpoint.encoding.encode(&body) {
                Ok(data) => self
                    .shared
                    .conn
                    .post(&url, endpoint.encoding, data, true)
                    .await
                    .map(drop),
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                tracing::warn!(%err, "failed to close http stream on the server");
            }
        }
    }
}
