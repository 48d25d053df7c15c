use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use super::client::WsShared;
use super::Release;
use crate::wire::ws::{Request, Response};
use crate::wire::CursorEntry;
use crate::{Cursor, HranaError, Result};

/// Cursor that fetches entries from the server in chunks.
pub(crate) struct WsCursor {
    shared: Arc<WsShared>,
    stream_id: i32,
    cursor_id: i32,
    fetch_chunk: u32,
    entries: VecDeque<CursorEntry>,
    done: bool,
    closed: bool,
}

impl WsCursor {
    pub fn new(shared: Arc<WsShared>, stream_id: i32, cursor_id: i32) -> Self {
        let fetch_chunk = shared.options.cursor_fetch_chunk;
        Self {
            shared,
            stream_id,
            cursor_id,
            fetch_chunk,
            entries: VecDeque::new(),
            done: false,
            closed: false,
        }
    }
}

#[async_trait]
impl Cursor for WsCursor {
    async fn next(&mut self) -> Result<Option<CursorEntry>> {
        loop {
            if self.closed {
                return Err(HranaError::closed("cursor is closed", None));
            }
            if let Some(entry) = self.entries.pop_front() {
                return Ok(Some(entry));
            }
            if self.done {
                return Ok(None);
            }

            let response = self
                .shared
                .request(
                    Request::FetchCursor {
                        cursor_id: self.cursor_id,
                        max_count: self.fetch_chunk,
                    },
                    Some(self.stream_id),
                )
                .await?;
            match response {
                Response::FetchCursor { entries, done } => {
                    tracing::debug!(
                        cursor_id = self.cursor_id,
                        fetched = entries.len(),
                        done,
                        "fetched cursor entries"
                    );
                    self.entries.extend(entries);
                    self.done = done;
                }
                other => {
                    return Err(HranaError::proto(format!(
                        "unexpected {} response",
                        other.kind()
                    )))
                }
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.entries.clear();
        self.shared.request_detached(
            Request::CloseCursor {
                cursor_id: self.cursor_id,
            },
            Some(self.stream_id),
            Some(Release::Cursor(self.cursor_id)),
        );
    }
}

impl Drop for WsCursor {
    fn drop(&mut self) {
        self.close();
    }
}
