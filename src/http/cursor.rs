use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::cursor::FrameReader;
use crate::wire::CursorEntry;
use crate::{Cursor, HranaError, Result};

/// Cursor reading entries from a streamed `/cursor` response body.
///
/// The stream it belongs to is held until the cursor finishes or is closed.
pub(crate) struct HttpCursor {
    reader: FrameReader,
    done_tx: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl HttpCursor {
    pub fn new(reader: FrameReader, done_tx: oneshot::Sender<()>) -> Self {
        Self {
            reader,
            done_tx: Some(done_tx),
            finished: false,
        }
    }

    fn release(&mut self) {
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(());
        }
    }
}

#[async_trait]
impl Cursor for HttpCursor {
    async fn next(&mut self) -> Result<Option<CursorEntry>> {
        if self.finished {
            return Ok(None);
        }
        if self.done_tx.is_none() {
            return Err(HranaError::closed("cursor is closed", None));
        }

        match self.reader.next_message::<CursorEntry>().await {
            Ok(Some(entry)) => Ok(Some(entry)),
            Ok(None) => {
                self.finished = true;
                self.release();
                Ok(None)
            }
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        self.release();
    }
}

impl Drop for HttpCursor {
    fn drop(&mut self) {
        self.release();
    }
}
