use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;

use crate::encoding::protobuf::{get_varint, ProtoDecode};
use crate::encoding::Encoding;
use crate::{wire, HranaError, Result};

/// Server-driven sequence of batch execution events.
///
/// Entries are pulled one at a time; the transport fetches more from the
/// server as needed.
#[async_trait]
pub trait Cursor: Send {
    /// Returns the next entry, or `None` once the batch has finished.
    async fn next(&mut self) -> Result<Option<wire::CursorEntry>>;

    /// Releases the cursor. Entries not read yet are discarded.
    fn close(&mut self);
}

/// Splits a streamed response body into protocol frames.
///
/// Protobuf frames carry a varint length prefix, JSON frames end with a newline.
/// Bytes are queued until a whole frame is available.
pub(crate) struct FrameReader {
    body: BoxStream<'static, Result<Bytes>>,
    queue: BytesMut,
    encoding: Encoding,
    eof: bool,
}

impl FrameReader {
    pub fn new(body: BoxStream<'static, Result<Bytes>>, encoding: Encoding) -> Self {
        Self {
            body,
            queue: BytesMut::new(),
            encoding,
            eof: false,
        }
    }

    /// Decodes the next frame as `T`.
    pub async fn next_message<T>(&mut self) -> Result<Option<T>>
    where
        T: DeserializeOwned + ProtoDecode,
    {
        match self.next_frame().await? {
            Some(frame) => self.encoding.decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(Some(frame));
            }

            if self.eof {
                let trailing_blank = self.encoding == Encoding::Json
                    && self.queue.iter().all(u8::is_ascii_whitespace);
                if self.queue.is_empty() || trailing_blank {
                    return Ok(None);
                }
                return Err(HranaError::proto(
                    "cursor response ended in the middle of a frame",
                ));
            }

            match self.body.next().await {
                Some(chunk) => self.queue.extend_from_slice(&chunk?),
                None => self.eof = true,
            }
        }
    }

    fn split_frame(&mut self) -> Result<Option<Bytes>> {
        match self.encoding {
            Encoding::Protobuf => {
                let Some((len, prefix_len)) = get_varint(&self.queue)? else {
                    return Ok(None);
                };
                let len = usize::try_from(len)
                    .map_err(|_| HranaError::proto("cursor frame length overflows usize"))?;
                let end = prefix_len
                    .checked_add(len)
                    .ok_or_else(|| HranaError::proto("cursor frame length overflows usize"))?;
                if self.queue.len() < end {
                    return Ok(None);
                }
                self.queue.advance(prefix_len);
                Ok(Some(self.queue.split_to(len).freeze()))
            }
            Encoding::Json => loop {
                let Some(pos) = self.queue.iter().position(|byte| *byte == b'\n') else {
                    return Ok(None);
                };
                let mut line = self.queue.split_to(pos + 1).freeze();
                line.truncate(pos);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(line));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use futures_util::stream::{self, StreamExt};

    use super::FrameReader;
    use crate::encoding::protobuf::{self, put_varint};
    use crate::encoding::Encoding;
    use crate::{wire, HranaError, Result};

    fn reader(chunks: Vec<&[u8]>, encoding: Encoding) -> FrameReader {
        let chunks: Vec<Result<Bytes>> = chunks
            .into_iter()
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        FrameReader::new(stream::iter(chunks).boxed(), encoding)
    }

    fn framed(entry: &wire::CursorEntry) -> Vec<u8> {
        let body = protobuf::encode(entry);
        let mut buf = BytesMut::new();
        put_varint(&mut buf, body.len() as u64);
        buf.extend_from_slice(&body);
        buf.to_vec()
    }

    #[tokio::test]
    async fn protobuf_frame_split_across_reads() {
        let entry = wire::CursorEntry::StepBegin {
            step: 2,
            cols: vec![],
        };
        let bytes = framed(&entry);
        let (first, second) = bytes.split_at(bytes.len() / 2);

        let mut reader = reader(vec![first, second], Encoding::Protobuf);
        let decoded: wire::CursorEntry = reader.next_message().await.unwrap().unwrap();
        assert_eq!(decoded, entry);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_lines_across_reads() {
        let mut reader = reader(
            vec![
                b"{\"type\":\"step_begin\",\"step\":0,\"cols\":[]}\n{\"type\":\"row\",",
                b"\"row\":[]}\n\n",
            ],
            Encoding::Json,
        );
        let first: wire::CursorEntry = reader.next_message().await.unwrap().unwrap();
        let second: wire::CursorEntry = reader.next_message().await.unwrap().unwrap();
        assert!(matches!(first, wire::CursorEntry::StepBegin { step: 0, .. }));
        assert_eq!(second, wire::CursorEntry::Row { row: vec![] });
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_frame_at_end_is_a_protocol_error() {
        let bytes = framed(&wire::CursorEntry::Row { row: vec![] });
        let mut reader = reader(vec![&bytes[..bytes.len() - 1]], Encoding::Protobuf);
        let err = reader.next_frame().await.expect_err("must fail");
        assert!(matches!(err, HranaError::Proto(_)));
    }

    #[tokio::test]
    async fn empty_body_is_a_normal_end() {
        let mut reader = reader(vec![], Encoding::Protobuf);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn huge_frame_length_is_a_protocol_error() {
        let mut prefix = BytesMut::new();
        put_varint(&mut prefix, u64::MAX);
        prefix.extend_from_slice(b"xx");
        let mut reader = reader(vec![&prefix[..]], Encoding::Protobuf);
        let err = reader.next_frame().await.expect_err("must fail");
        assert!(matches!(err, HranaError::Proto(_)));
    }
}
