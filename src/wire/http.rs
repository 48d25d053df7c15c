//! Messages exchanged with the HTTP pipeline and cursor endpoints.

use serde::{Deserialize, Serialize};

use super::{missing, Batch, BatchResult, Error, Stmt};
use crate::encoding::protobuf::{MessageReader, MessageWriter, ProtoDecode, ProtoEncode};
use crate::types::{DescribeResult, StmtResult};
use crate::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReqBody {
    pub baton: Option<String>,
    pub requests: Vec<StreamRequest>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRespBody {
    #[serde(default)]
    pub baton: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub results: Vec<StreamResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResult {
    Ok { response: StreamResponse },
    Error { error: Error },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    Close,
    Execute {
        stmt: Stmt,
    },
    Batch {
        batch: Batch,
    },
    Sequence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sql_id: Option<i32>,
    },
    Describe {
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
    GetAutocommit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    Close,
    Execute { result: StmtResult },
    Batch { result: BatchResult },
    Sequence,
    Describe { result: DescribeResult },
    StoreSql,
    CloseSql,
    GetAutocommit { is_autocommit: bool },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorReqBody {
    pub baton: Option<String>,
    pub batch: Batch,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorRespBody {
    #[serde(default)]
    pub baton: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl StreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamRequest::Close => "close",
            StreamRequest::Execute { .. } => "execute",
            StreamRequest::Batch { .. } => "batch",
            StreamRequest::Sequence { .. } => "sequence",
            StreamRequest::Describe { .. } => "describe",
            StreamRequest::StoreSql { .. } => "store_sql",
            StreamRequest::CloseSql { .. } => "close_sql",
            StreamRequest::GetAutocommit => "get_autocommit",
        }
    }
}

impl StreamResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamResponse::Close => "close",
            StreamResponse::Execute { .. } => "execute",
            StreamResponse::Batch { .. } => "batch",
            StreamResponse::Sequence => "sequence",
            StreamResponse::Describe { .. } => "describe",
            StreamResponse::StoreSql => "store_sql",
            StreamResponse::CloseSql => "close_sql",
            StreamResponse::GetAutocommit { .. } => "get_autocommit",
        }
    }
}

fn encode_sql_source(w: &mut MessageWriter, sql: &Option<String>, sql_id: &Option<i32>) {
    if let Some(sql) = sql {
        w.string(1, sql);
    }
    if let Some(sql_id) = sql_id {
        w.int32(2, *sql_id);
    }
}

impl ProtoEncode for StreamRequest {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            StreamRequest::Close => w.empty(1),
            StreamRequest::Execute { stmt } => w.nested(2, |w| w.message(1, stmt)),
            StreamRequest::Batch { batch } => w.nested(3, |w| w.message(1, batch)),
            StreamRequest::Sequence { sql, sql_id } => {
                w.nested(4, |w| encode_sql_source(w, sql, sql_id))
            }
            StreamRequest::Describe { sql, sql_id } => {
                w.nested(5, |w| encode_sql_source(w, sql, sql_id))
            }
            StreamRequest::StoreSql { sql_id, sql } => w.nested(6, |w| {
                w.int32(1, *sql_id);
                w.string(2, sql);
            }),
            StreamRequest::CloseSql { sql_id } => w.nested(7, |w| w.int32(1, *sql_id)),
            StreamRequest::GetAutocommit => w.empty(8),
        }
    }
}

impl ProtoEncode for PipelineReqBody {
    fn encode_fields(&self, w: &mut MessageWriter) {
        if let Some(baton) = &self.baton {
            w.string(1, baton);
        }
        for request in &self.requests {
            w.message(2, request);
        }
    }
}

impl ProtoEncode for CursorReqBody {
    fn encode_fields(&self, w: &mut MessageWriter) {
        if let Some(baton) = &self.baton {
            w.string(1, baton);
        }
        w.message(2, &self.batch);
    }
}

fn encode_baton_and_url(w: &mut MessageWriter, baton: &Option<String>, base_url: &Option<String>) {
    if let Some(baton) = baton {
        w.string(1, baton);
    }
    if let Some(base_url) = base_url {
        w.string(2, base_url);
    }
}

impl ProtoEncode for StreamResponse {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            StreamResponse::Close => w.empty(1),
            StreamResponse::Execute { result } => w.nested(2, |w| w.message(1, result)),
            StreamResponse::Batch { result } => w.nested(3, |w| w.message(1, result)),
            StreamResponse::Sequence => w.empty(4),
            StreamResponse::Describe { result } => w.nested(5, |w| w.message(1, result)),
            StreamResponse::StoreSql => w.empty(6),
            StreamResponse::CloseSql => w.empty(7),
            StreamResponse::GetAutocommit { is_autocommit } => {
                w.nested(8, |w| w.bool(1, *is_autocommit))
            }
        }
    }
}

impl ProtoEncode for StreamResult {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            StreamResult::Ok { response } => w.message(1, response),
            StreamResult::Error { error } => w.message(2, error),
        }
    }
}

impl ProtoEncode for PipelineRespBody {
    fn encode_fields(&self, w: &mut MessageWriter) {
        encode_baton_and_url(w, &self.baton, &self.base_url);
        for result in &self.results {
            w.message(3, result);
        }
    }
}

impl ProtoEncode for CursorRespBody {
    fn encode_fields(&self, w: &mut MessageWriter) {
        encode_baton_and_url(w, &self.baton, &self.base_url);
    }
}

fn decode_single<T: ProtoDecode + Default>(r: &mut MessageReader<'_>) -> Result<T> {
    let mut nested = r.nested()?;
    let mut value = T::default();
    while let Some(field) = nested.next_field()? {
        match field {
            1 => value = nested.message()?,
            _ => nested.skip()?,
        }
    }
    Ok(value)
}

impl ProtoDecode for StreamResponse {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut response = None;
        while let Some(field) = r.next_field()? {
            response = Some(match field {
                1 => {
                    r.skip()?;
                    StreamResponse::Close
                }
                2 => StreamResponse::Execute {
                    result: decode_single(r)?,
                },
                3 => StreamResponse::Batch {
                    result: decode_single(r)?,
                },
                4 => {
                    r.skip()?;
                    StreamResponse::Sequence
                }
                5 => StreamResponse::Describe {
                    result: decode_single(r)?,
                },
                6 => {
                    r.skip()?;
                    StreamResponse::StoreSql
                }
                7 => {
                    r.skip()?;
                    StreamResponse::CloseSql
                }
                8 => {
                    let mut nested = r.nested()?;
                    let mut is_autocommit = false;
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => is_autocommit = nested.bool()?,
                            _ => nested.skip()?,
                        }
                    }
                    StreamResponse::GetAutocommit { is_autocommit }
                }
                _ => {
                    r.skip()?;
                    continue;
                }
            });
        }
        response.ok_or_else(|| missing("a stream response"))
    }
}

impl ProtoDecode for StreamResult {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut result = None;
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    result = Some(StreamResult::Ok {
                        response: r.message()?,
                    })
                }
                2 => result = Some(StreamResult::Error { error: r.message()? }),
                _ => r.skip()?,
            }
        }
        result.ok_or_else(|| missing("a stream result"))
    }
}

impl ProtoDecode for PipelineRespBody {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut body = PipelineRespBody::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => body.baton = Some(r.string()?),
                2 => body.base_url = Some(r.string()?),
                3 => body.results.push(r.message()?),
                _ => r.skip()?,
            }
        }
        Ok(body)
    }
}

impl ProtoDecode for CursorRespBody {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut body = CursorRespBody::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => body.baton = Some(r.string()?),
                2 => body.base_url = Some(r.string()?),
                _ => r.skip()?,
            }
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::encoding::Encoding;
    use crate::Value;

    #[test]
    fn pipeline_request_json_shape() {
        let body = PipelineReqBody {
            baton: Some("b1".to_owned()),
            requests: vec![
                StreamRequest::Execute {
                    stmt: Stmt {
                        sql: Some("SELECT ?".to_owned()),
                        args: vec![Value::Integer(1)],
                        want_rows: true,
                        ..Stmt::default()
                    },
                },
                StreamRequest::Close,
            ],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "baton": "b1",
                "requests": [
                    {
                        "type": "execute",
                        "stmt": {
                            "sql": "SELECT ?",
                            "args": [{ "type": "integer", "value": "1" }],
                            "named_args": [],
                            "want_rows": true
                        }
                    },
                    { "type": "close" }
                ]
            })
        );
    }

    #[test]
    fn pipeline_response_round_trips() {
        let body = PipelineRespBody {
            baton: Some("b2".to_owned()),
            base_url: Some("https://replica.example".to_owned()),
            results: vec![
                StreamResult::Ok {
                    response: StreamResponse::Execute {
                        result: StmtResult {
                            affected_row_count: 2,
                            ..StmtResult::default()
                        },
                    },
                },
                StreamResult::Error {
                    error: Error {
                        message: "boom".to_owned(),
                        code: None,
                    },
                },
                StreamResult::Ok {
                    response: StreamResponse::GetAutocommit {
                        is_autocommit: false,
                    },
                },
                StreamResult::Ok {
                    response: StreamResponse::Close,
                },
            ],
        };
        for encoding in [Encoding::Json, Encoding::Protobuf] {
            let bytes = encoding.encode(&body).unwrap();
            let decoded: PipelineRespBody = encoding.decode(&bytes).unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[test]
    fn cursor_response_round_trips() {
        let body = CursorRespBody {
            baton: None,
            base_url: Some("https://other".to_owned()),
        };
        for encoding in [Encoding::Json, Encoding::Protobuf] {
            let bytes = encoding.encode(&body).unwrap();
            let decoded: CursorRespBody = encoding.decode(&bytes).unwrap();
            assert_eq!(decoded, body);
        }
    }
}
