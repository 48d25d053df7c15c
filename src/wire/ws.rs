//! Messages exchanged over a WebSocket connection.

use serde::{Deserialize, Serialize};

use super::{missing, Batch, BatchResult, CursorEntry, Error, Stmt};
use crate::encoding::protobuf::{MessageReader, MessageWriter, ProtoDecode, ProtoEncode};
use crate::types::{DescribeResult, StmtResult};
use crate::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Hello {
        #[serde(default)]
        jwt: Option<String>,
    },
    Request {
        request_id: i32,
        request: Request,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    HelloOk,
    HelloError { error: Error },
    ResponseOk { request_id: i32, response: Response },
    ResponseError { request_id: i32, error: Error },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    OpenStream {
        stream_id: i32,
    },
    CloseStream {
        stream_id: i32,
    },
    Execute {
        stream_id: i32,
        stmt: Stmt,
    },
    Batch {
        stream_id: i32,
        batch: Batch,
    },
    OpenCursor {
        stream_id: i32,
        cursor_id: i32,
        batch: Batch,
    },
    CloseCursor {
        cursor_id: i32,
    },
    FetchCursor {
        cursor_id: i32,
        max_count: u32,
    },
    Sequence {
        stream_id: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql_id: Option<i32>,
    },
    Describe {
        stream_id: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql_id: Option<i32>,
    },
    StoreSql {
        sql_id: i32,
        sql: String,
    },
    CloseSql {
        sql_id: i32,
    },
    GetAutocommit {
        stream_id: i32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    OpenStream,
    CloseStream,
    Execute { result: StmtResult },
    Batch { result: BatchResult },
    OpenCursor,
    CloseCursor,
    FetchCursor { entries: Vec<CursorEntry>, done: bool },
    Sequence,
    Describe { result: DescribeResult },
    StoreSql,
    CloseSql,
    GetAutocommit { is_autocommit: bool },
}

impl Request {
    /// Wire name of the request, which the response must echo.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::OpenStream { .. } => "open_stream",
            Request::CloseStream { .. } => "close_stream",
            Request::Execute { .. } => "execute",
            Request::Batch { .. } => "batch",
            Request::OpenCursor { .. } => "open_cursor",
            Request::CloseCursor { .. } => "close_cursor",
            Request::FetchCursor { .. } => "fetch_cursor",
            Request::Sequence { .. } => "sequence",
            Request::Describe { .. } => "describe",
            Request::StoreSql { .. } => "store_sql",
            Request::CloseSql { .. } => "close_sql",
            Request::GetAutocommit { .. } => "get_autocommit",
        }
    }

    /// Stream the request belongs to, for requests scoped to a stream.
    pub fn stream_id(&self) -> Option<i32> {
        match self {
            Request::OpenStream { stream_id }
            | Request::CloseStream { stream_id }
            | Request::Execute { stream_id, .. }
            | Request::Batch { stream_id, .. }
            | Request::OpenCursor { stream_id, .. }
            | Request::Sequence { stream_id, .. }
            | Request::Describe { stream_id, .. }
            | Request::GetAutocommit { stream_id } => Some(*stream_id),
            Request::CloseCursor { .. }
            | Request::FetchCursor { .. }
            | Request::StoreSql { .. }
            | Request::CloseSql { .. } => None,
        }
    }
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::OpenStream => "open_stream",
            Response::CloseStream => "close_stream",
            Response::Execute { .. } => "execute",
            Response::Batch { .. } => "batch",
            Response::OpenCursor => "open_cursor",
            Response::CloseCursor => "close_cursor",
            Response::FetchCursor { .. } => "fetch_cursor",
            Response::Sequence => "sequence",
            Response::Describe { .. } => "describe",
            Response::StoreSql => "store_sql",
            Response::CloseSql => "close_sql",
            Response::GetAutocommit { .. } => "get_autocommit",
        }
    }
}

impl ProtoEncode for ClientMsg {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            ClientMsg::Hello { jwt } => w.nested(1, |w| {
                if let Some(jwt) = jwt {
                    w.string(1, jwt);
                }
            }),
            ClientMsg::Request {
                request_id,
                request,
            } => w.nested(2, |w| {
                w.int32(1, *request_id);
                encode_request(w, request);
            }),
        }
    }
}

fn encode_sql_source(w: &mut MessageWriter, sql: &Option<String>, sql_id: &Option<i32>) {
    if let Some(sql) = sql {
        w.string(2, sql);
    }
    if let Some(sql_id) = sql_id {
        w.int32(3, *sql_id);
    }
}

fn encode_request(w: &mut MessageWriter, request: &Request) {
    match request {
        Request::OpenStream { stream_id } => w.nested(2, |w| w.int32(1, *stream_id)),
        Request::CloseStream { stream_id } => w.nested(3, |w| w.int32(1, *stream_id)),
        Request::Execute { stream_id, stmt } => w.nested(4, |w| {
            w.int32(1, *stream_id);
            w.message(2, stmt);
        }),
        Request::Batch { stream_id, batch } => w.nested(5, |w| {
            w.int32(1, *stream_id);
            w.message(2, batch);
        }),
        Request::OpenCursor {
            stream_id,
            cursor_id,
            batch,
        } => w.nested(6, |w| {
            w.int32(1, *stream_id);
            w.int32(2, *cursor_id);
            w.message(3, batch);
        }),
        Request::CloseCursor { cursor_id } => w.nested(7, |w| w.int32(1, *cursor_id)),
        Request::FetchCursor {
            cursor_id,
            max_count,
        } => w.nested(8, |w| {
            w.int32(1, *cursor_id);
            w.uint32(2, *max_count);
        }),
        Request::Sequence {
            stream_id,
            sql,
            sql_id,
        } => w.nested(9, |w| {
            w.int32(1, *stream_id);
            encode_sql_source(w, sql, sql_id);
        }),
        Request::Describe {
            stream_id,
            sql,
            sql_id,
        } => w.nested(10, |w| {
            w.int32(1, *stream_id);
            encode_sql_source(w, sql, sql_id);
        }),
        Request::StoreSql { sql_id, sql } => w.nested(11, |w| {
            w.int32(1, *sql_id);
            w.string(2, sql);
        }),
        Request::CloseSql { sql_id } => w.nested(12, |w| w.int32(1, *sql_id)),
        Request::GetAutocommit { stream_id } => w.nested(13, |w| w.int32(1, *stream_id)),
    }
}

impl ProtoDecode for ServerMsg {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut msg = None;
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    r.skip()?;
                    msg = Some(ServerMsg::HelloOk);
                }
                2 => {
                    let mut nested = r.nested()?;
                    let mut error = Error::default();
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => error = nested.message()?,
                            _ => nested.skip()?,
                        }
                    }
                    msg = Some(ServerMsg::HelloError { error });
                }
                3 => {
                    let mut nested = r.nested()?;
                    let mut request_id = 0;
                    let mut response = None;
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => request_id = nested.int32()?,
                            2..=13 => response = Some(decode_response(&mut nested, field)?),
                            _ => nested.skip()?,
                        }
                    }
                    msg = Some(ServerMsg::ResponseOk {
                        request_id,
                        response: response.ok_or_else(|| missing("a response"))?,
                    });
                }
                4 => {
                    let mut nested = r.nested()?;
                    let mut request_id = 0;
                    let mut error = Error::default();
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => request_id = nested.int32()?,
                            2 => error = nested.message()?,
                            _ => nested.skip()?,
                        }
                    }
                    msg = Some(ServerMsg::ResponseError { request_id, error });
                }
                _ => r.skip()?,
            }
        }
        msg.ok_or_else(|| missing("a server message"))
    }
}

/// Reads the single-field body of a response message.
fn decode_result_field<T: ProtoDecode + Default>(r: &mut MessageReader<'_>) -> Result<T> {
    let mut nested = r.nested()?;
    let mut result = T::default();
    while let Some(field) = nested.next_field()? {
        match field {
            1 => result = nested.message()?,
            _ => nested.skip()?,
        }
    }
    Ok(result)
}

fn decode_response(r: &mut MessageReader<'_>, field: u32) -> Result<Response> {
    Ok(match field {
        2 => {
            r.skip()?;
            Response::OpenStream
        }
        3 => {
            r.skip()?;
            Response::CloseStream
        }
        4 => Response::Execute {
            result: decode_result_field(r)?,
        },
        5 => Response::Batch {
            result: decode_result_field(r)?,
        },
        6 => {
            r.skip()?;
            Response::OpenCursor
        }
        7 => {
            r.skip()?;
            Response::CloseCursor
        }
        8 => {
            let mut nested = r.nested()?;
            let mut entries = Vec::new();
            let mut done = false;
            while let Some(field) = nested.next_field()? {
                match field {
                    1 => entries.push(nested.message()?),
                    2 => done = nested.bool()?,
                    _ => nested.skip()?,
                }
            }
            Response::FetchCursor { entries, done }
        }
        9 => {
            r.skip()?;
            Response::Sequence
        }
        10 => Response::Describe {
            result: decode_result_field(r)?,
        },
        11 => {
            r.skip()?;
            Response::StoreSql
        }
        12 => {
            r.skip()?;
            Response::CloseSql
        }
        13 => {
            let mut nested = r.nested()?;
            let mut is_autocommit = false;
            while let Some(field) = nested.next_field()? {
                match field {
                    1 => is_autocommit = nested.bool()?,
                    _ => nested.skip()?,
                }
            }
            Response::GetAutocommit { is_autocommit }
        }
        other => return Err(crate::HranaError::proto(format!("unknown response field {other}"))),
    })
}

impl ProtoEncode for ServerMsg {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            ServerMsg::HelloOk => w.empty(1),
            ServerMsg::HelloError { error } => w.nested(2, |w| w.message(1, error)),
            ServerMsg::ResponseError { request_id, error } => w.nested(4, |w| {
                w.int32(1, *request_id);
                w.message(2, error);
            }),
            ServerMsg::ResponseOk {
                request_id,
                response,
            } => w.nested(3, |w| {
                w.int32(1, *request_id);
                match response {
                    Response::OpenStream => w.empty(2),
                    Response::CloseStream => w.empty(3),
                    Response::Execute { result } => w.nested(4, |w| w.message(1, result)),
                    Response::Batch { result } => w.nested(5, |w| w.message(1, result)),
                    Response::OpenCursor => w.empty(6),
                    Response::CloseCursor => w.empty(7),
                    Response::FetchCursor { entries, done } => w.nested(8, |w| {
                        for entry in entries {
                            w.message(1, entry);
                        }
                        w.bool(2, *done);
                    }),
                    Response::Sequence => w.empty(9),
                    Response::Describe { result } => w.nested(10, |w| w.message(1, result)),
                    Response::StoreSql => w.empty(11),
                    Response::CloseSql => w.empty(12),
                    Response::GetAutocommit { is_autocommit } => {
                        w.nested(13, |w| w.bool(1, *is_autocommit))
                    }
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::encoding::{protobuf, Encoding};

    #[test]
    fn request_json_shape() {
        let msg = ClientMsg::Request {
            request_id: 4,
            request: Request::Execute {
                stream_id: 1,
                stmt: Stmt {
                    sql: Some("SELECT 1".to_owned()),
                    want_rows: true,
                    ..Stmt::default()
                },
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "request",
                "request_id": 4,
                "request": {
                    "type": "execute",
                    "stream_id": 1,
                    "stmt": { "sql": "SELECT 1", "args": [], "named_args": [], "want_rows": true }
                }
            })
        );
    }

    #[test]
    fn server_messages_round_trip_through_protobuf() {
        let messages = [
            ServerMsg::HelloOk,
            ServerMsg::HelloError {
                error: Error {
                    message: "bad jwt".to_owned(),
                    code: None,
                },
            },
            ServerMsg::ResponseOk {
                request_id: 2,
                response: Response::FetchCursor {
                    entries: vec![CursorEntry::StepBegin {
                        step: 0,
                        cols: vec![],
                    }],
                    done: true,
                },
            },
            ServerMsg::ResponseOk {
                request_id: 3,
                response: Response::GetAutocommit {
                    is_autocommit: true,
                },
            },
            ServerMsg::ResponseOk {
                request_id: 5,
                response: Response::CloseStream,
            },
            ServerMsg::ResponseError {
                request_id: 9,
                error: Error {
                    message: "no such stream".to_owned(),
                    code: Some("STREAM_NOT_FOUND".to_owned()),
                },
            },
        ];
        for msg in &messages {
            let decoded: ServerMsg = Encoding::Protobuf
                .decode(&protobuf::encode(msg))
                .expect("must decode");
            assert_eq!(&decoded, msg);
        }
    }

    #[test]
    fn response_kind_matches_request_kind() {
        let request = Request::Describe {
            stream_id: 0,
            sql: Some("SELECT 1".to_owned()),
            sql_id: None,
        };
        let response = Response::Describe {
            result: DescribeResult::default(),
        };
        assert_eq!(request.kind(), response.kind());
        assert_eq!(request.stream_id(), Some(0));
        assert_eq!(Request::CloseSql { sql_id: 1 }.stream_id(), None);
    }
}
