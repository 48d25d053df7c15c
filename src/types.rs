use serde::{Deserialize, Serialize};

use crate::{encoding::json, HranaError, IntMode, Result, Value};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Col {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub decltype: Option<String>,
}

/// Result of a single statement.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StmtResult {
    #[serde(default)]
    pub cols: Vec<Col>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub affected_row_count: u64,
    #[serde(default, with = "json::opt_i64_string")]
    pub last_insert_rowid: Option<i64>,
}

impl StmtResult {
    pub fn column_names(&self) -> Vec<Option<&str>> {
        self.cols.iter().map(|col| col.name.as_deref()).collect()
    }

    /// Returns row `index` paired with the column metadata.
    pub fn row(&self, index: usize) -> Option<Row> {
        self.rows.get(index).map(|values| Row {
            cols: self.cols.clone(),
            values: values.clone(),
        })
    }

    /// Consumes the result into owned rows.
    pub fn into_rows(self) -> Vec<Row> {
        let cols = self.cols;
        self.rows
            .into_iter()
            .map(|values| Row {
                cols: cols.clone(),
                values,
            })
            .collect()
    }
}

/// A single row with its column metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub cols: Vec<Col>,
    pub values: Vec<Value>,
}

impl Row {
    /// Returns a value by case-insensitive column name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let idx = self.cols.iter().position(|col| {
            col.name
                .as_deref()
                .is_some_and(|col_name| col_name.eq_ignore_ascii_case(name))
        })?;
        self.values.get(idx)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_i64()
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    /// Renders the row as a JSON object keyed by column name.
    ///
    /// Columns without a name are keyed by their position.
    pub fn to_json(&self, mode: IntMode) -> Result<serde_json::Value> {
        let mut object = serde_json::Map::with_capacity(self.values.len());
        for (index, value) in self.values.iter().enumerate() {
            let key = self
                .cols
                .get(index)
                .and_then(|col| col.name.clone())
                .unwrap_or_else(|| index.to_string());
            object.insert(key, value.to_json(mode)?);
        }
        Ok(serde_json::Value::Object(object))
    }
}

/// Result of `describe`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeResult {
    #[serde(default)]
    pub params: Vec<DescribeParam>,
    #[serde(default)]
    pub cols: Vec<DescribeCol>,
    #[serde(default)]
    pub is_explain: bool,
    #[serde(default)]
    pub is_readonly: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeParam {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeCol {
    pub name: String,
    #[serde(default)]
    pub decltype: Option<String>,
}

/// Shape in which a batch step's result is reported.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResultKind {
    /// Every row.
    #[default]
    Rows,
    /// The first row, if any.
    Row,
    /// The first column of the first row, if any.
    Value,
    /// Only the affected row count and last insert rowid.
    Run,
}

/// Typed output of a step that ran successfully.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutput {
    Rows(StmtResult),
    Row(Option<Row>),
    Value(Option<Value>),
    Run {
        affected_row_count: u64,
        last_insert_rowid: Option<i64>,
    },
}

/// Outcome of one batch step.
#[derive(Clone, Debug)]
pub enum StepResult {
    /// The step's condition evaluated to false: no result and no error.
    Skipped,
    Ok(StepOutput),
    Error(HranaError),
}

impl StepResult {
    pub fn is_skipped(&self) -> bool {
        matches!(self, StepResult::Skipped)
    }

    pub fn output(&self) -> Option<&StepOutput> {
        match self {
            StepResult::Ok(output) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&HranaError> {
        match self {
            StepResult::Error(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> StmtResult {
        StmtResult {
            cols: vec![
                Col {
                    name: Some("id".to_owned()),
                    decltype: Some("INTEGER".to_owned()),
                },
                Col {
                    name: Some("Name".to_owned()),
                    decltype: Some("TEXT".to_owned()),
                },
            ],
            rows: vec![vec![Value::Integer(1), Value::text("Kit")]],
            affected_row_count: 0,
            last_insert_rowid: None,
        }
    }

    #[test]
    fn row_lookup_is_case_insensitive() {
        let row = sample().row(0).expect("row must exist");
        assert_eq!(row.get_i64("ID"), Some(1));
        assert_eq!(row.get_text("name"), Some("Kit"));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn row_to_json_uses_column_names() {
        let row = sample().into_rows().remove(0);
        assert_eq!(
            row.to_json(IntMode::String).unwrap(),
            json!({"id": "1", "Name": "Kit"})
        );
    }

    #[test]
    fn stmt_result_parses_server_json() {
        let result: StmtResult = serde_json::from_value(json!({
            "cols": [{ "name": "cnt", "decltype": "INTEGER" }],
            "rows": [[{ "type": "integer", "value": "3" }]],
            "affected_row_count": 0,
            "last_insert_rowid": null,
            "replication_index": "7"
        }))
        .unwrap();
        assert_eq!(result.rows[0][0], Value::Integer(3));
        assert_eq!(result.last_insert_rowid, None);
    }
}
