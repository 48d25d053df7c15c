use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::WsShared;
use super::cursor::WsCursor;
use super::Release;
use crate::sql_cache::SqlCache;
use crate::stream::check_version;
use crate::wire::{self, ws::Request, ws::Response};
use crate::{
    Batch, Cursor, DescribeResult, HranaError, Result, Sql, SqlText, Stmt, StmtResult, Stream,
};

/// A stream multiplexed over a [`WsClient`](super::WsClient) connection.
pub struct WsStream {
    shared: Arc<WsShared>,
    stream_id: i32,
    closed: Mutex<Option<HranaError>>,
    sql_cache: Mutex<SqlCache>,
}

impl fmt::Debug for WsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsStream")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn unexpected(response: Response) -> HranaError {
    HranaError::proto(format!("unexpected {} response", response.kind()))
}

impl WsStream {
    pub(crate) fn new(shared: Arc<WsShared>, stream_id: i32) -> Self {
        let sql_cache = SqlCache::new(shared.clone(), shared.options.sql_cache_capacity);
        Self {
            shared,
            stream_id,
            closed: Mutex::new(None),
            sql_cache: Mutex::new(sql_cache),
        }
    }

    fn check_open(&self) -> Result<()> {
        if let Some(err) = &*self.closed.lock() {
            return Err(err.clone());
        }
        self.shared.check_open()
    }

    async fn request(&self, request: Request) -> Result<Response> {
        self.check_open()?;
        self.shared.request(request, Some(self.stream_id)).await
    }

    /// Rewrites statements to cached SQL ids when the server supports them.
    async fn prepare<'a>(&self, stmts: impl IntoIterator<Item = &'a mut wire::Stmt>) -> Result<()> {
        if self.shared.version().await? >= 2 {
            self.sql_cache.lock().apply(stmts)?;
        }
        Ok(())
    }

    async fn sql_request(&self, sql: SqlText) -> Result<(Option<String>, Option<i32>)> {
        let (sql, sql_id) = sql.into_wire()?;
        if sql_id.is_some() {
            check_version("cached SQL", 2, self.shared.version().await?)?;
        }
        Ok((sql, sql_id))
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

    fn send_close(&self) {
        self.sql_cache.lock().clear();
        self.shared.request_detached(
            Request::CloseStream {
                stream_id: self.stream_id,
            },
            Some(self.stream_id),
            Some(Release::Stream(self.stream_id)),
        );
    }
}

#[async_trait]
impl Stream for WsStream {
    async fn execute(&self, stmt: Stmt) -> Result<StmtResult> {
        let mut stmt = stmt.into_wire()?;
        self.prepare([&mut stmt]).await?;
        match self
            .request(Request::Execute {
                stream_id: self.stream_id,
                stmt,
            })
            .await?
        {
            Response::Execute { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    fn batch(&self) -> Batch<'_> {
        Batch::new(self)
    }

    async fn describe(&self, sql: SqlText) -> Result<DescribeResult> {
        check_version("describe", 2, self.shared.version().await?)?;
        let (sql, sql_id) = self.sql_request(sql).await?;
        match self
            .request(Request::Describe {
                stream_id: self.stream_id,
                sql,
                sql_id,
            })
            .await?
        {
            Response::Describe { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn sequence(&self, sql: SqlText) -> Result<()> {
        let (sql, sql_id) = self.sql_request(sql).await?;
        match self
            .request(Request::Sequence {
                stream_id: self.stream_id,
                sql,
                sql_id,
            })
            .await?
        {
            Response::Sequence => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_autocommit(&self) -> Result<bool> {
        check_version("get_autocommit", 3, self.shared.version().await?)?;
        match self
            .request(Request::GetAutocommit {
                stream_id: self.stream_id,
            })
            .await?
        {
            Response::GetAutocommit { is_autocommit } => Ok(is_autocommit),
            other => Err(unexpected(other)),
        }
    }

    fn store_sql(&self, sql: &str) -> Result<Sql> {
        self.check_open()?;
        Sql::store(self.shared.clone(), sql)
    }

    async fn get_version(&self) -> Result<u32> {
        self.shared.version().await
    }

    fn close(&self) {
        let error = HranaError::closed("stream was manually closed", None);
        if !self.mark_closed(error.clone()) {
            return;
        }
        tracing::debug!(stream_id = self.stream_id, "closing websocket stream");
        self.shared.fail_stream(self.stream_id, error);
        self.send_close();
    }

    async fn close_gracefully(&self) -> Result<()> {
        self.shared.check_open()?;
        if !self.mark_closed(HranaError::closed("stream was closed", None)) {
            return Ok(());
        }
        self.sql_cache.lock().clear();
        match self
            .shared
            .request_with_release(
                Request::CloseStream {
                    stream_id: self.stream_id,
                },
                self.stream_id,
                Release::Stream(self.stream_id),
            )
            .await?
        {
            Response::CloseStream => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.lock().is_some() || self.shared.is_closed()
    }

    async fn execute_batch(&self, mut batch: wire::Batch) -> Result<wire::BatchResult> {
        self.prepare(batch.steps.iter_mut().map(|step| &mut step.stmt))
            .await?;
        match self
            .request(Request::Batch {
                stream_id: self.stream_id,
                batch,
            })
            .await?
        {
            Response::Batch { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn open_cursor(&self, mut batch: wire::Batch) -> Result<Box<dyn Cursor>> {
        check_version("cursor", 3, self.shared.version().await?)?;
        self.prepare(batch.steps.iter_mut().map(|step| &mut step.stmt))
            .await?;

        let cursor_id = self.shared.alloc_cursor_id();
        let opened = self
            .request(Request::OpenCursor {
                stream_id: self.stream_id,
                cursor_id,
                batch,
            })
            .await;
        match opened {
            Ok(Response::OpenCursor) => Ok(Box::new(WsCursor::new(
                self.shared.clone(),
                self.stream_id,
                cursor_id,
            ))),
            Ok(other) => {
                self.shared.free_cursor_id(cursor_id);
                Err(unexpected(other))
            }
            Err(err) => {
                self.shared.free_cursor_id(cursor_id);
                Err(err)
            }
        }
    }

    fn version_hint(&self) -> Option<u32> {
        self.shared.version_hint()
    }
}

impl Drop for WsStream {
    fn drop(&mut self) {
        if self.mark_closed(HranaError::closed("stream was dropped", None)) && !self.shared.is_closed() {
            self.send_close();
        }
    }
}
