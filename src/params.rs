use crate::{wire, HranaError, Result, Sql, Value};

/// SQL parameter container.
#[derive(Clone, Debug, PartialEq)]
pub enum Params {
    /// Positional values mapped to `?` placeholders.
    Positional(Vec<Value>),
    /// Named values mapped to `:name` style placeholders.
    Named(Vec<(String, Value)>),
}

impl Params {
    /// Builds positional parameters.
    pub fn positional(values: impl Into<Vec<Value>>) -> Self {
        Self::Positional(values.into())
    }

    /// Builds named parameters.
    ///
    /// Names can be provided with or without prefix (`:`, `@`, `$`).
    pub fn named<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Named(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl<const N: usize> From<[Value; N]> for Params {
    fn from(values: [Value; N]) -> Self {
        Self::Positional(values.into())
    }
}

impl From<Vec<(String, Value)>> for Params {
    fn from(values: Vec<(String, Value)>) -> Self {
        Self::Named(values)
    }
}

/// SQL given inline or as a handle to text stored on the server.
#[derive(Clone, Debug)]
pub enum SqlText {
    Text(String),
    Cached(Sql),
}

impl SqlText {
    /// Splits into the `sql` / `sql_id` pair carried on the wire.
    pub(crate) fn into_wire(self) -> Result<(Option<String>, Option<i32>)> {
        match self {
            SqlText::Text(text) => Ok((Some(text), None)),
            SqlText::Cached(sql) => Ok((None, Some(sql.id()?))),
        }
    }
}

impl From<&str> for SqlText {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for SqlText {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Sql> for SqlText {
    fn from(value: Sql) -> Self {
        Self::Cached(value)
    }
}

impl From<&Sql> for SqlText {
    fn from(value: &Sql) -> Self {
        Self::Cached(value.clone())
    }
}

/// A statement built incrementally before it is sent.
#[derive(Clone, Debug)]
pub struct Stmt {
    /// SQL text or cached SQL handle.
    pub sql: SqlText,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub named_args: Vec<(String, Value)>,
    /// Whether the statement should return rows.
    pub want_rows: bool,
}

impl Stmt {
    /// Creates a row-returning statement without arguments.
    pub fn new(sql: impl Into<SqlText>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            named_args: Vec::new(),
            want_rows: true,
        }
    }

    /// Creates a row-returning statement.
    pub fn query<P: Into<Params>>(sql: impl Into<SqlText>, params: P) -> Self {
        Self::new(sql).with_params(params.into())
    }

    /// Creates an execution-only statement.
    pub fn execute<P: Into<Params>>(sql: impl Into<SqlText>, params: P) -> Self {
        Self::new(sql).with_params(params.into()).want_rows(false)
    }

    fn with_params(mut self, params: Params) -> Self {
        match params {
            Params::Positional(values) => self.args.extend(values),
            Params::Named(values) => self.named_args.extend(values),
        }
        self
    }

    /// Appends a positional argument.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends a named argument.
    pub fn bind_named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named_args.push((name.into(), value.into()));
        self
    }

    pub fn want_rows(mut self, want_rows: bool) -> Self {
        self.want_rows = want_rows;
        self
    }

    pub(crate) fn into_wire(self) -> Result<wire::Stmt> {
        let (sql, sql_id) = self.sql.into_wire()?;
        let args = self
            .args
            .into_iter()
            .map(check_value)
            .collect::<Result<Vec<_>>>()?;
        let named_args = self
            .named_args
            .into_iter()
            .map(|(name, value)| {
                Ok(wire::NamedArg {
                    name: normalize_named_parameter_name(&name)?,
                    value: check_value(value)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(wire::Stmt {
            sql,
            sql_id,
            args,
            named_args,
            want_rows: self.want_rows,
        })
    }
}

impl From<&str> for Stmt {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Stmt {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

impl From<&Sql> for Stmt {
    fn from(sql: &Sql) -> Self {
        Self::new(sql)
    }
}

fn check_value(value: Value) -> Result<Value> {
    match value {
        Value::Float(value) if !value.is_finite() => Err(HranaError::Misuse(format!(
            "non-finite float value '{value}' is unsupported"
        ))),
        value => Ok(value),
    }
}

fn normalize_named_parameter_name(name: &str) -> Result<String> {
    let normalized = name.trim_start_matches([':', '@', '$']);
    if normalized.is_empty() {
        return Err(HranaError::Misuse(
            "named parameter name cannot be empty".to_owned(),
        ));
    }
    Ok(normalized.to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::sql::tests::RecordingOwner;
    use crate::{HranaError, Params, Sql, Stmt, Value};

    #[test]
    fn positional_from_array() {
        let params: Params = [Value::integer(1), Value::text("kit")].into();
        match params {
            Params::Positional(values) => assert_eq!(values.len(), 2),
            _ => panic!("expected positional"),
        }
    }

    #[test]
    fn named_builder() {
        let params = Params::named([("name", Value::text("kit"))]);
        match params {
            Params::Named(values) => {
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].0, "name");
            }
            _ => panic!("expected named"),
        }
    }

    #[test]
    fn statement_constructors() {
        let query = Stmt::query("SELECT 1", ());
        let exec = Stmt::execute("DELETE FROM t", ());
        assert!(query.want_rows);
        assert!(!exec.want_rows);
    }

    #[test]
    fn into_wire_strips_named_prefix() {
        let stmt = Stmt::new("SELECT :name, ?")
            .bind_named(":name", "kit")
            .bind(1)
            .into_wire()
            .expect("must build statement");
        assert_eq!(stmt.named_args[0].name, "name");
        assert_eq!(stmt.args, vec![Value::Integer(1)]);
        assert_eq!(stmt.sql.as_deref(), Some("SELECT :name, ?"));
    }

    #[test]
    fn into_wire_rejects_non_finite_float() {
        let err = Stmt::query("SELECT ?", [Value::float(f64::NAN)])
            .into_wire()
            .expect_err("must fail");
        assert!(matches!(err, HranaError::Misuse(_)));
    }

    #[test]
    fn cached_sql_is_sent_by_id_until_closed() {
        let owner = Arc::new(RecordingOwner::default());
        let sql = Sql::store(owner, "SELECT 1").unwrap();

        let stmt = Stmt::from(&sql).into_wire().unwrap();
        assert_eq!(stmt.sql, None);
        assert_eq!(stmt.sql_id, Some(0));

        sql.close();
        let err = Stmt::from(&sql).into_wire().expect_err("closed handle");
        assert!(matches!(err, HranaError::Closed { .. }));
    }
}
