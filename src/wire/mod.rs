//! Protocol messages.
//!
//! Every message derives `serde` for the JSON encoding and implements
//! [`ProtoEncode`]/[`ProtoDecode`] for the protobuf encoding. Messages the
//! client only ever sends implement just the encoding side, and vice versa.

pub mod http;
pub mod ws;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoding::json;
use crate::encoding::protobuf::{MessageReader, MessageWriter, ProtoDecode, ProtoEncode};
use crate::types::{Col, DescribeCol, DescribeParam, DescribeResult, StmtResult};
use crate::{HranaError, Result, Value};

/// Error envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_id: Option<i32>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub named_args: Vec<NamedArg>,
    #[serde(default)]
    pub want_rows: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedArg {
    pub name: String,
    pub value: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub steps: Vec<BatchStep>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BatchCond>,
    pub stmt: Stmt,
}

/// Condition over the outcome of earlier batch steps, by step index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchCond {
    Ok { step: u32 },
    Error { step: u32 },
    Not { cond: Box<BatchCond> },
    And { conds: Vec<BatchCond> },
    Or { conds: Vec<BatchCond> },
    IsAutocommit,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default, with = "json::step_map")]
    pub step_results: BTreeMap<u32, StmtResult>,
    #[serde(default, with = "json::step_map")]
    pub step_errors: BTreeMap<u32, Error>,
}

/// One event of a cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CursorEntry {
    StepBegin {
        step: u32,
        #[serde(default)]
        cols: Vec<Col>,
    },
    StepEnd {
        #[serde(default)]
        affected_row_count: u64,
        #[serde(default, with = "json::opt_i64_string")]
        last_insert_rowid: Option<i64>,
    },
    StepError {
        step: u32,
        error: Error,
    },
    Row {
        row: Vec<Value>,
    },
    Error {
        error: Error,
    },
}

fn missing(what: &str) -> HranaError {
    HranaError::proto(format!("protobuf message is missing {what}"))
}

impl ProtoEncode for Error {
    fn encode_fields(&self, w: &mut MessageWriter) {
        w.string(1, &self.message);
        if let Some(code) = &self.code {
            w.string(2, code);
        }
    }
}

impl ProtoDecode for Error {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut error = Error::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => error.message = r.string()?,
                2 => error.code = Some(r.string()?),
                _ => r.skip()?,
            }
        }
        Ok(error)
    }
}

impl ProtoEncode for Value {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            Value::Null => w.empty(1),
            Value::Integer(value) => w.sint64(2, *value),
            Value::Float(value) => w.double(3, *value),
            Value::Text(value) => w.string(4, value),
            Value::Blob(value) => w.bytes(5, value),
        }
    }
}

impl ProtoDecode for Value {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut value = None;
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    r.skip()?;
                    value = Some(Value::Null);
                }
                2 => value = Some(Value::Integer(r.sint64()?)),
                3 => value = Some(Value::Float(r.double()?)),
                4 => value = Some(Value::Text(r.string()?)),
                5 => value = Some(Value::Blob(r.bytes()?)),
                _ => r.skip()?,
            }
        }
        value.ok_or_else(|| missing("a value"))
    }
}

impl ProtoEncode for Stmt {
    fn encode_fields(&self, w: &mut MessageWriter) {
        if let Some(sql) = &self.sql {
            w.string(1, sql);
        }
        if let Some(sql_id) = self.sql_id {
            w.int32(2, sql_id);
        }
        for arg in &self.args {
            w.message(3, arg);
        }
        for arg in &self.named_args {
            w.nested(4, |w| {
                w.string(1, &arg.name);
                w.message(2, &arg.value);
            });
        }
        w.bool(5, self.want_rows);
    }
}

impl ProtoDecode for Stmt {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut stmt = Stmt::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => stmt.sql = Some(r.string()?),
                2 => stmt.sql_id = Some(r.int32()?),
                3 => stmt.args.push(r.message()?),
                4 => {
                    let mut nested = r.nested()?;
                    let mut name = String::new();
                    let mut value = None;
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => name = nested.string()?,
                            2 => value = Some(nested.message()?),
                            _ => nested.skip()?,
                        }
                    }
                    stmt.named_args.push(NamedArg {
                        name,
                        value: value.ok_or_else(|| missing("a named argument value"))?,
                    });
                }
                5 => stmt.want_rows = r.bool()?,
                _ => r.skip()?,
            }
        }
        Ok(stmt)
    }
}

impl ProtoEncode for Batch {
    fn encode_fields(&self, w: &mut MessageWriter) {
        for step in &self.steps {
            w.nested(1, |w| {
                if let Some(condition) = &step.condition {
                    w.message(1, condition);
                }
                w.message(2, &step.stmt);
            });
        }
    }
}

impl ProtoDecode for Batch {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut batch = Batch::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    let mut nested = r.nested()?;
                    let mut condition = None;
                    let mut stmt = None;
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => condition = Some(nested.message()?),
                            2 => stmt = Some(nested.message()?),
                            _ => nested.skip()?,
                        }
                    }
                    batch.steps.push(BatchStep {
                        condition,
                        stmt: stmt.ok_or_else(|| missing("a batch step statement"))?,
                    });
                }
                _ => r.skip()?,
            }
        }
        Ok(batch)
    }
}

fn encode_cond_list(w: &mut MessageWriter, field: u32, conds: &[BatchCond]) {
    w.nested(field, |w| {
        for cond in conds {
            w.message(1, cond);
        }
    });
}

fn decode_cond_list(r: &mut MessageReader<'_>) -> Result<Vec<BatchCond>> {
    let mut nested = r.nested()?;
    let mut conds = Vec::new();
    while let Some(field) = nested.next_field()? {
        match field {
            1 => conds.push(nested.message()?),
            _ => nested.skip()?,
        }
    }
    Ok(conds)
}

impl ProtoEncode for BatchCond {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            BatchCond::Ok { step } => w.uint32(1, *step),
            BatchCond::Error { step } => w.uint32(2, *step),
            BatchCond::Not { cond } => w.message(3, cond.as_ref()),
            BatchCond::And { conds } => encode_cond_list(w, 4, conds),
            BatchCond::Or { conds } => encode_cond_list(w, 5, conds),
            BatchCond::IsAutocommit => w.empty(6),
        }
    }
}

impl ProtoDecode for BatchCond {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut cond = None;
        while let Some(field) = r.next_field()? {
            match field {
                1 => cond = Some(BatchCond::Ok { step: r.uint32()? }),
                2 => cond = Some(BatchCond::Error { step: r.uint32()? }),
                3 => {
                    cond = Some(BatchCond::Not {
                        cond: Box::new(r.message()?),
                    })
                }
                4 => {
                    cond = Some(BatchCond::And {
                        conds: decode_cond_list(r)?,
                    })
                }
                5 => {
                    cond = Some(BatchCond::Or {
                        conds: decode_cond_list(r)?,
                    })
                }
                6 => {
                    r.skip()?;
                    cond = Some(BatchCond::IsAutocommit);
                }
                _ => r.skip()?,
            }
        }
        cond.ok_or_else(|| missing("a batch condition"))
    }
}

impl ProtoEncode for Col {
    fn encode_fields(&self, w: &mut MessageWriter) {
        if let Some(name) = &self.name {
            w.string(1, name);
        }
        if let Some(decltype) = &self.decltype {
            w.string(2, decltype);
        }
    }
}

impl ProtoDecode for Col {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut col = Col::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => col.name = Some(r.string()?),
                2 => col.decltype = Some(r.string()?),
                _ => r.skip()?,
            }
        }
        Ok(col)
    }
}

fn encode_row(w: &mut MessageWriter, field: u32, row: &[Value]) {
    w.nested(field, |w| {
        for value in row {
            w.message(1, value);
        }
    });
}

fn decode_row(r: &mut MessageReader<'_>) -> Result<Vec<Value>> {
    let mut nested = r.nested()?;
    let mut row = Vec::new();
    while let Some(field) = nested.next_field()? {
        match field {
            1 => row.push(nested.message()?),
            _ => nested.skip()?,
        }
    }
    Ok(row)
}

impl ProtoEncode for StmtResult {
    fn encode_fields(&self, w: &mut MessageWriter) {
        for col in &self.cols {
            w.message(1, col);
        }
        for row in &self.rows {
            encode_row(w, 2, row);
        }
        w.uint64(3, self.affected_row_count);
        if let Some(rowid) = self.last_insert_rowid {
            w.sint64(4, rowid);
        }
    }
}

impl ProtoDecode for StmtResult {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut result = StmtResult::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => result.cols.push(r.message()?),
                2 => result.rows.push(decode_row(r)?),
                3 => result.affected_row_count = r.uint64()?,
                4 => result.last_insert_rowid = Some(r.sint64()?),
                _ => r.skip()?,
            }
        }
        Ok(result)
    }
}

fn encode_step_map<T: ProtoEncode>(w: &mut MessageWriter, field: u32, map: &BTreeMap<u32, T>) {
    for (step, value) in map {
        w.nested(field, |w| {
            w.uint32(1, *step);
            w.message(2, value);
        });
    }
}

fn decode_step_map_entry<T: ProtoDecode>(r: &mut MessageReader<'_>) -> Result<(u32, T)> {
    let mut nested = r.nested()?;
    let mut step = 0;
    let mut value = None;
    while let Some(field) = nested.next_field()? {
        match field {
            1 => step = nested.uint32()?,
            2 => value = Some(nested.message()?),
            _ => nested.skip()?,
        }
    }
    Ok((step, value.ok_or_else(|| missing("a step map value"))?))
}

impl ProtoEncode for BatchResult {
    fn encode_fields(&self, w: &mut MessageWriter) {
        encode_step_map(w, 1, &self.step_results);
        encode_step_map(w, 2, &self.step_errors);
    }
}

impl ProtoDecode for BatchResult {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut result = BatchResult::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    let (step, value) = decode_step_map_entry(r)?;
                    result.step_results.insert(step, value);
                }
                2 => {
                    let (step, value) = decode_step_map_entry(r)?;
                    result.step_errors.insert(step, value);
                }
                _ => r.skip()?,
            }
        }
        Ok(result)
    }
}

impl ProtoEncode for CursorEntry {
    fn encode_fields(&self, w: &mut MessageWriter) {
        match self {
            CursorEntry::StepBegin { step, cols } => w.nested(1, |w| {
                w.uint32(1, *step);
                for col in cols {
                    w.message(2, col);
                }
            }),
            CursorEntry::StepEnd {
                affected_row_count,
                last_insert_rowid,
            } => w.nested(2, |w| {
                w.uint64(1, *affected_row_count);
                if let Some(rowid) = last_insert_rowid {
                    w.sint64(2, *rowid);
                }
            }),
            CursorEntry::StepError { step, error } => w.nested(3, |w| {
                w.uint32(1, *step);
                w.message(2, error);
            }),
            CursorEntry::Row { row } => encode_row(w, 4, row),
            CursorEntry::Error { error } => w.message(5, error),
        }
    }
}

impl ProtoDecode for CursorEntry {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut entry = None;
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    let mut nested = r.nested()?;
                    let mut step = 0;
                    let mut cols = Vec::new();
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => step = nested.uint32()?,
                            2 => cols.push(nested.message()?),
                            _ => nested.skip()?,
                        }
                    }
                    entry = Some(CursorEntry::StepBegin { step, cols });
                }
                2 => {
                    let mut nested = r.nested()?;
                    let mut affected_row_count = 0;
                    let mut last_insert_rowid = None;
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => affected_row_count = nested.uint64()?,
                            2 => last_insert_rowid = Some(nested.sint64()?),
                            _ => nested.skip()?,
                        }
                    }
                    entry = Some(CursorEntry::StepEnd {
                        affected_row_count,
                        last_insert_rowid,
                    });
                }
                3 => {
                    let mut nested = r.nested()?;
                    let mut step = 0;
                    let mut error = None;
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => step = nested.uint32()?,
                            2 => error = Some(nested.message()?),
                            _ => nested.skip()?,
                        }
                    }
                    entry = Some(CursorEntry::StepError {
                        step,
                        error: error.ok_or_else(|| missing("a step error"))?,
                    });
                }
                4 => entry = Some(CursorEntry::Row { row: decode_row(r)? }),
                5 => entry = Some(CursorEntry::Error { error: r.message()? }),
                _ => r.skip()?,
            }
        }
        entry.ok_or_else(|| missing("a cursor entry"))
    }
}

impl ProtoEncode for DescribeResult {
    fn encode_fields(&self, w: &mut MessageWriter) {
        for param in &self.params {
            w.nested(1, |w| {
                if let Some(name) = &param.name {
                    w.string(1, name);
                }
            });
        }
        for col in &self.cols {
            w.nested(2, |w| {
                w.string(1, &col.name);
                if let Some(decltype) = &col.decltype {
                    w.string(2, decltype);
                }
            });
        }
        w.bool(3, self.is_explain);
        w.bool(4, self.is_readonly);
    }
}

impl ProtoDecode for DescribeResult {
    fn decode_fields(r: &mut MessageReader<'_>) -> Result<Self> {
        let mut result = DescribeResult::default();
        while let Some(field) = r.next_field()? {
            match field {
                1 => {
                    let mut nested = r.nested()?;
                    let mut param = DescribeParam::default();
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => param.name = Some(nested.string()?),
                            _ => nested.skip()?,
                        }
                    }
                    result.params.push(param);
                }
                2 => {
                    let mut nested = r.nested()?;
                    let mut col = DescribeCol::default();
                    while let Some(field) = nested.next_field()? {
                        match field {
                            1 => col.name = nested.string()?,
                            2 => col.decltype = Some(nested.string()?),
                            _ => nested.skip()?,
                        }
                    }
                    result.cols.push(col);
                }
                3 => result.is_explain = r.bool()?,
                4 => result.is_readonly = r.bool()?,
                _ => r.skip()?,
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::json;

    use super::*;
    use crate::encoding::Encoding;

    fn round_trip<T>(msg: &T)
    where
        T: Serialize + DeserializeOwned + ProtoEncode + ProtoDecode + PartialEq + std::fmt::Debug,
    {
        for encoding in [Encoding::Json, Encoding::Protobuf] {
            let bytes = encoding.encode(msg).expect("must encode");
            let decoded: T = encoding.decode(&bytes).expect("must decode");
            assert_eq!(&decoded, msg, "{encoding:?} round trip");
        }
    }

    fn sample_result() -> StmtResult {
        StmtResult {
            cols: vec![Col {
                name: Some("v".to_owned()),
                decltype: None,
            }],
            rows: vec![
                vec![Value::Integer(i64::MIN)],
                vec![Value::Float(-0.25)],
                vec![Value::text("ünïcode")],
                vec![Value::blob(vec![0u8, 255])],
                vec![Value::Null],
            ],
            affected_row_count: 3,
            last_insert_rowid: Some(-7),
        }
    }

    #[test]
    fn statements_round_trip() {
        round_trip(&Stmt {
            sql: Some("SELECT ?, :a".to_owned()),
            sql_id: None,
            args: vec![Value::Integer(1)],
            named_args: vec![NamedArg {
                name: ":a".to_owned(),
                value: Value::text("x"),
            }],
            want_rows: true,
        });
        round_trip(&Stmt {
            sql: None,
            sql_id: Some(3),
            ..Stmt::default()
        });
    }

    #[test]
    fn batches_with_conditions_round_trip() {
        let stmt = Stmt {
            sql: Some("SELECT 1".to_owned()),
            want_rows: true,
            ..Stmt::default()
        };
        round_trip(&Batch {
            steps: vec![
                BatchStep {
                    condition: None,
                    stmt: stmt.clone(),
                },
                BatchStep {
                    condition: Some(BatchCond::And {
                        conds: vec![
                            BatchCond::Ok { step: 0 },
                            BatchCond::Not {
                                cond: Box::new(BatchCond::Or {
                                    conds: vec![
                                        BatchCond::Error { step: 0 },
                                        BatchCond::IsAutocommit,
                                    ],
                                }),
                            },
                        ],
                    }),
                    stmt,
                },
            ],
        });
    }

    #[test]
    fn results_round_trip() {
        round_trip(&sample_result());
        round_trip(&BatchResult {
            step_results: [(0, sample_result()), (2, StmtResult::default())].into(),
            step_errors: [(
                1,
                Error {
                    message: "boom".to_owned(),
                    code: Some("SQLITE_ERROR".to_owned()),
                },
            )]
            .into(),
        });
        round_trip(&DescribeResult {
            params: vec![DescribeParam { name: Some(":a".to_owned()) }, DescribeParam { name: None }],
            cols: vec![DescribeCol {
                name: "a".to_owned(),
                decltype: Some("TEXT".to_owned()),
            }],
            is_explain: false,
            is_readonly: true,
        });
    }

    #[test]
    fn cursor_entries_round_trip() {
        let entries = [
            CursorEntry::StepBegin {
                step: 2,
                cols: vec![Col::default()],
            },
            CursorEntry::Row {
                row: vec![Value::Integer(5), Value::Null],
            },
            CursorEntry::StepEnd {
                affected_row_count: 1,
                last_insert_rowid: Some(99),
            },
            CursorEntry::StepError {
                step: 3,
                error: Error {
                    message: "constraint failed".to_owned(),
                    code: None,
                },
            },
            CursorEntry::Error {
                error: Error::default(),
            },
        ];
        for entry in &entries {
            round_trip(entry);
        }
    }

    #[test]
    fn batch_result_json_uses_sparse_arrays() {
        let result: BatchResult = serde_json::from_value(json!({
            "step_results": [null, { "cols": [], "rows": [], "affected_row_count": 1 }],
            "step_errors": [{ "message": "bad" }, null]
        }))
        .unwrap();
        assert!(result.step_results.contains_key(&1));
        assert!(!result.step_results.contains_key(&0));
        assert_eq!(result.step_errors[&0].message, "bad");
    }

    #[test]
    fn cond_json_shape() {
        let cond = BatchCond::Not {
            cond: Box::new(BatchCond::Ok { step: 1 }),
        };
        assert_eq!(
            serde_json::to_value(&cond).unwrap(),
            json!({"type": "not", "cond": {"type": "ok", "step": 1}})
        );
        assert_eq!(
            serde_json::to_value(BatchCond::IsAutocommit).unwrap(),
            json!({"type": "is_autocommit"})
        );
    }
}
