use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    decode::{decode_batch_result, shape_step_output},
    wire, HranaError, Result, ResultKind, StepResult, Stmt, StmtResult, Stream,
};

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(0);

/// Handle to a step that was added to a [`Batch`], used in conditions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StepRef {
    batch_id: u64,
    index: u32,
}

impl StepRef {
    /// Position of the step in its batch.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Condition gating a batch step on the outcome of earlier steps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BatchCond {
    /// The step ran and succeeded.
    Ok(StepRef),
    /// The step ran and failed.
    Error(StepRef),
    Not(Box<BatchCond>),
    And(Vec<BatchCond>),
    Or(Vec<BatchCond>),
    /// The connection is in autocommit mode. Requires protocol version 3.
    IsAutocommit,
}

impl BatchCond {
    pub fn ok(step: StepRef) -> Self {
        Self::Ok(step)
    }

    pub fn error(step: StepRef) -> Self {
        Self::Error(step)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(cond: BatchCond) -> Self {
        Self::Not(Box::new(cond))
    }

    pub fn and(conds: impl IntoIterator<Item = BatchCond>) -> Self {
        Self::And(conds.into_iter().collect())
    }

    pub fn or(conds: impl IntoIterator<Item = BatchCond>) -> Self {
        Self::Or(conds.into_iter().collect())
    }

    pub fn is_autocommit() -> Self {
        Self::IsAutocommit
    }

    fn to_wire(&self, batch_id: u64, step_count: u32, version: Option<u32>) -> Result<wire::BatchCond> {
        let step_index = |step: &StepRef| {
            if step.batch_id != batch_id {
                return Err(HranaError::Misuse(
                    "batch condition references a step from a different batch".to_owned(),
                ));
            }
            if step.index >= step_count {
                return Err(HranaError::Misuse(format!(
                    "batch condition references step {} which is not an earlier step",
                    step.index
                )));
            }
            Ok(step.index)
        };

        Ok(match self {
            BatchCond::Ok(step) => wire::BatchCond::Ok {
                step: step_index(step)?,
            },
            BatchCond::Error(step) => wire::BatchCond::Error {
                step: step_index(step)?,
            },
            BatchCond::Not(cond) => wire::BatchCond::Not {
                cond: Box::new(cond.to_wire(batch_id, step_count, version)?),
            },
            BatchCond::And(conds) => wire::BatchCond::And {
                conds: conds
                    .iter()
                    .map(|cond| cond.to_wire(batch_id, step_count, version))
                    .collect::<Result<_>>()?,
            },
            BatchCond::Or(conds) => wire::BatchCond::Or {
                conds: conds
                    .iter()
                    .map(|cond| cond.to_wire(batch_id, step_count, version))
                    .collect::<Result<_>>()?,
            },
            BatchCond::IsAutocommit => {
                let version = version.ok_or_else(|| {
                    HranaError::Misuse(
                        "the protocol version is not known yet; await `get_version()` \
                         before using the is_autocommit condition"
                            .to_owned(),
                    )
                })?;
                crate::stream::check_version("is_autocommit condition", 3, version)?;
                wire::BatchCond::IsAutocommit
            }
        })
    }
}

struct PendingStep {
    condition: Option<wire::BatchCond>,
    stmt: Stmt,
    kind: ResultKind,
}

/// Statements executed together, each optionally gated by a condition.
///
/// Built with [`Stream::batch`](crate::Stream::batch).
pub struct Batch<'a> {
    stream: &'a dyn Stream,
    id: u64,
    steps: Vec<PendingStep>,
}

impl<'a> Batch<'a> {
    pub fn new(stream: &'a dyn Stream) -> Self {
        Self {
            stream,
            id: NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed),
            steps: Vec::new(),
        }
    }

    /// Starts a new step.
    pub fn step(&mut self) -> BatchStep<'_, 'a> {
        BatchStep {
            batch: self,
            condition: None,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn into_wire(self) -> Result<(&'a dyn Stream, wire::Batch, Vec<ResultKind>)> {
        let mut steps = Vec::with_capacity(self.steps.len());
        let mut kinds = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            steps.push(wire::BatchStep {
                condition: step.condition,
                stmt: step.stmt.into_wire()?,
            });
            kinds.push(step.kind);
        }
        Ok((self.stream, wire::Batch { steps }, kinds))
    }

    /// Executes the batch as a single request.
    pub async fn execute(self) -> Result<Vec<StepResult>> {
        let (stream, batch, kinds) = self.into_wire()?;
        let result = stream.execute_batch(batch).await?;
        decode_batch_result(result, &kinds)
    }

    /// Executes the batch through a cursor, which streams rows instead of
    /// buffering the whole result on the server. Requires protocol version 3.
    pub async fn execute_with_cursor(self) -> Result<Vec<StepResult>> {
        let (stream, batch, kinds) = self.into_wire()?;
        let mut cursor = stream.open_cursor(batch).await?;
        let outcome = collect_cursor(cursor.as_mut(), &kinds).await;
        cursor.close();
        outcome
    }
}

/// Builder for one step of a [`Batch`].
pub struct BatchStep<'b, 'a> {
    batch: &'b mut Batch<'a>,
    condition: Option<BatchCond>,
}

impl BatchStep<'_, '_> {
    /// Runs the step only if `cond` holds.
    pub fn condition(mut self, cond: BatchCond) -> Self {
        self.condition = Some(cond);
        self
    }

    /// Adds a statement whose result includes every row.
    pub fn query(self, stmt: impl Into<Stmt>) -> Result<StepRef> {
        self.add(stmt.into(), ResultKind::Rows)
    }

    /// Adds a statement whose result is its first row.
    pub fn query_row(self, stmt: impl Into<Stmt>) -> Result<StepRef> {
        self.add(stmt.into(), ResultKind::Row)
    }

    /// Adds a statement whose result is the first value of its first row.
    pub fn query_value(self, stmt: impl Into<Stmt>) -> Result<StepRef> {
        self.add(stmt.into(), ResultKind::Value)
    }

    /// Adds a statement whose rows are not returned.
    pub fn run(self, stmt: impl Into<Stmt>) -> Result<StepRef> {
        self.add(stmt.into().want_rows(false), ResultKind::Run)
    }

    fn add(self, stmt: Stmt, kind: ResultKind) -> Result<StepRef> {
        let batch = self.batch;
        let step_count = batch.steps.len() as u32;
        let condition = self
            .condition
            .map(|cond| cond.to_wire(batch.id, step_count, batch.stream.version_hint()))
            .transpose()?;

        batch.steps.push(PendingStep {
            condition,
            stmt,
            kind,
        });
        Ok(StepRef {
            batch_id: batch.id,
            index: step_count,
        })
    }
}

/// Reassembles cursor entries into one outcome per step.
async fn collect_cursor(cursor: &mut dyn crate::Cursor, kinds: &[ResultKind]) -> Result<Vec<StepResult>> {
    let step_count = kinds.len() as u32;
    let mut outcomes: Vec<Option<StepResult>> = vec![None; kinds.len()];
    let mut next_step = 0u32;
    let mut current: Option<(u32, StmtResult)> = None;

    let check_step = |step: u32, next_step: u32| {
        if step < next_step || step >= step_count {
            return Err(HranaError::proto(format!(
                "cursor returned step {step} out of order (expected {next_step}..{step_count})"
            )));
        }
        Ok(())
    };

    while let Some(entry) = cursor.next().await? {
        match entry {
            wire::CursorEntry::StepBegin { step, cols } => {
                if current.is_some() {
                    return Err(HranaError::proto(
                        "cursor began a step before the previous one ended",
                    ));
                }
                check_step(step, next_step)?;
                next_step = step + 1;
                current = Some((
                    step,
                    StmtResult {
                        cols,
                        ..StmtResult::default()
                    },
                ));
            }
            wire::CursorEntry::Row { row } => {
                let (_, result) = current
                    .as_mut()
                    .ok_or_else(|| HranaError::proto("cursor returned a row outside of a step"))?;
                result.rows.push(row);
            }
            wire::CursorEntry::StepEnd {
                affected_row_count,
                last_insert_rowid,
            } => {
                let (step, mut result) = current
                    .take()
                    .ok_or_else(|| HranaError::proto("cursor ended a step that did not begin"))?;
                result.affected_row_count = affected_row_count;
                result.last_insert_rowid = last_insert_rowid;
                outcomes[step as usize] = Some(StepResult::Ok(shape_step_output(
                    result,
                    kinds[step as usize],
                )));
            }
            wire::CursorEntry::StepError { step, error } => {
                match current.take() {
                    Some((current_step, _)) if current_step != step => {
                        return Err(HranaError::proto(format!(
                            "cursor returned an error for step {step} inside step {current_step}"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        check_step(step, next_step)?;
                        next_step = step + 1;
                    }
                }
                outcomes[step as usize] = Some(StepResult::Error(HranaError::response(error)));
            }
            wire::CursorEntry::Error { error } => return Err(HranaError::response(error)),
        }
    }

    if let Some((step, _)) = current {
        return Err(HranaError::proto(format!(
            "cursor finished in the middle of step {step}"
        )));
    }

    Ok(outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or(StepResult::Skipped))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::BatchCond;
    use crate::{
        wire, Batch, Col, Cursor, DescribeResult, HranaError, Result, Sql, SqlText, StepOutput,
        StepResult, Stmt, StmtResult, Stream, Value,
    };

    /// Stream that answers batches from canned data and records what was sent.
    #[derive(Default)]
    struct CannedStream {
        version: Option<u32>,
        batch_result: wire::BatchResult,
        entries: Vec<wire::CursorEntry>,
        sent: Mutex<Vec<wire::Batch>>,
        cursor_closed: Arc<Mutex<bool>>,
    }

    struct CannedCursor {
        entries: VecDeque<wire::CursorEntry>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Cursor for CannedCursor {
        async fn next(&mut self) -> Result<Option<wire::CursorEntry>> {
            Ok(self.entries.pop_front())
        }

        fn close(&mut self) {
            *self.closed.lock() = true;
        }
    }

    #[async_trait]
    impl Stream for CannedStream {
        async fn execute(&self, _stmt: Stmt) -> Result<StmtResult> {
            Ok(StmtResult::default())
        }

        fn batch(&self) -> Batch<'_> {
            Batch::new(self)
        }

        async fn describe(&self, _sql: SqlText) -> Result<DescribeResult> {
            Ok(DescribeResult::default())
        }

        async fn sequence(&self, _sql: SqlText) -> Result<()> {
            Ok(())
        }

        async fn get_autocommit(&self) -> Result<bool> {
            Ok(true)
        }

        fn store_sql(&self, _sql: &str) -> Result<Sql> {
            Err(HranaError::Misuse("not supported".to_owned()))
        }

        async fn get_version(&self) -> Result<u32> {
            Ok(self.version.unwrap_or(3))
        }

        fn close(&self) {}

        async fn close_gracefully(&self) -> Result<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn execute_batch(&self, batch: wire::Batch) -> Result<wire::BatchResult> {
            self.sent.lock().push(batch);
            Ok(self.batch_result.clone())
        }

        async fn open_cursor(&self, batch: wire::Batch) -> Result<Box<dyn Cursor>> {
            self.sent.lock().push(batch);
            Ok(Box::new(CannedCursor {
                entries: self.entries.clone().into(),
                closed: self.cursor_closed.clone(),
            }))
        }

        fn version_hint(&self) -> Option<u32> {
            self.version
        }
    }

    fn col(name: &str) -> Col {
        Col {
            name: Some(name.to_owned()),
            decltype: None,
        }
    }

    #[tokio::test]
    async fn conditions_are_sent_by_step_index() {
        let stream = CannedStream::default();
        let mut batch = stream.batch();
        let begin = batch.step().run("BEGIN").unwrap();
        let insert = batch
            .step()
            .condition(BatchCond::ok(begin))
            .run("INSERT INTO t VALUES (1)")
            .unwrap();
        batch
            .step()
            .condition(BatchCond::not(BatchCond::ok(insert)))
            .run("ROLLBACK")
            .unwrap();
        batch.execute().await.unwrap();

        let sent = stream.sent.lock();
        let steps = &sent[0].steps;
        assert_eq!(steps[0].condition, None);
        assert_eq!(steps[1].condition, Some(wire::BatchCond::Ok { step: 0 }));
        assert_eq!(
            steps[2].condition,
            Some(wire::BatchCond::Not {
                cond: Box::new(wire::BatchCond::Ok { step: 1 })
            })
        );
        assert!(!steps[1].stmt.want_rows);
    }

    #[tokio::test]
    async fn foreign_step_is_rejected_before_io() {
        let stream = CannedStream::default();
        let mut other = stream.batch();
        let foreign = other.step().run("SELECT 1").unwrap();

        let mut batch = stream.batch();
        let err = batch
            .step()
            .condition(BatchCond::ok(foreign))
            .run("SELECT 2")
            .expect_err("must fail");
        assert!(matches!(err, HranaError::Misuse(_)));
        assert!(batch.is_empty());
        assert!(stream.sent.lock().is_empty());
    }

    #[test]
    fn is_autocommit_needs_a_known_version() {
        let unknown = CannedStream::default();
        let err = unknown
            .batch()
            .step()
            .condition(BatchCond::is_autocommit())
            .run("COMMIT")
            .expect_err("must fail");
        assert!(matches!(err, HranaError::Misuse(ref message) if message.contains("get_version")));

        let old = CannedStream {
            version: Some(2),
            ..CannedStream::default()
        };
        let err = old
            .batch()
            .step()
            .condition(BatchCond::is_autocommit())
            .run("COMMIT")
            .expect_err("must fail");
        assert!(matches!(err, HranaError::ProtocolVersion { .. }));
    }

    fn build(stream: &CannedStream) -> Batch<'_> {
        let mut batch = stream.batch();
        let first = batch.step().query("SELECT n FROM t").unwrap();
        batch
            .step()
            .condition(BatchCond::error(first))
            .run("SELECT 0")
            .unwrap();
        batch.step().query_value("SELECT * FROM nope").unwrap();
        batch
    }

    #[tokio::test]
    async fn cursor_matches_regular_batch() {
        let rows = StmtResult {
            cols: vec![col("n")],
            rows: vec![vec![Value::Integer(1)], vec![Value::Integer(2)]],
            affected_row_count: 0,
            last_insert_rowid: None,
        };
        let error = wire::Error {
            message: "no such table: nope".to_owned(),
            code: Some("SQLITE_ERROR".to_owned()),
        };
        let stream = CannedStream {
            version: Some(3),
            batch_result: wire::BatchResult {
                step_results: BTreeMap::from([(0, rows.clone())]),
                step_errors: BTreeMap::from([(2, error.clone())]),
            },
            entries: vec![
                wire::CursorEntry::StepBegin {
                    step: 0,
                    cols: rows.cols.clone(),
                },
                wire::CursorEntry::Row {
                    row: rows.rows[0].clone(),
                },
                wire::CursorEntry::Row {
                    row: rows.rows[1].clone(),
                },
                wire::CursorEntry::StepEnd {
                    affected_row_count: 0,
                    last_insert_rowid: None,
                },
                wire::CursorEntry::StepError { step: 2, error },
            ],
            ..CannedStream::default()
        };

        let regular = build(&stream).execute().await.unwrap();
        let cursor = build(&stream).execute_with_cursor().await.unwrap();

        for outcomes in [&regular, &cursor] {
            assert_eq!(outcomes.len(), 3);
            match &outcomes[0] {
                StepResult::Ok(StepOutput::Rows(result)) => assert_eq!(result, &rows),
                other => panic!("unexpected outcome {other:?}"),
            }
            assert!(outcomes[1].is_skipped());
            assert_eq!(outcomes[2].error().and_then(|e| e.code()), Some("SQLITE_ERROR"));
        }
        assert!(*stream.cursor_closed.lock());
    }

    #[tokio::test]
    async fn cursor_error_entry_fails_the_batch_and_closes() {
        let stream = CannedStream {
            version: Some(3),
            entries: vec![wire::CursorEntry::Error {
                error: wire::Error {
                    message: "interrupted".to_owned(),
                    code: None,
                },
            }],
            ..CannedStream::default()
        };
        let mut batch = stream.batch();
        batch.step().query("SELECT 1").unwrap();

        let err = batch.execute_with_cursor().await.expect_err("must fail");
        assert_eq!(err.to_string(), "interrupted");
        assert!(*stream.cursor_closed.lock());
    }

    #[tokio::test]
    async fn cursor_steps_out_of_order_are_a_protocol_error() {
        let stream = CannedStream {
            version: Some(3),
            entries: vec![
                wire::CursorEntry::StepBegin { step: 1, cols: vec![] },
                wire::CursorEntry::StepEnd {
                    affected_row_count: 0,
                    last_insert_rowid: None,
                },
                wire::CursorEntry::StepBegin { step: 0, cols: vec![] },
            ],
            ..CannedStream::default()
        };
        let mut batch = stream.batch();
        batch.step().run("SELECT 1").unwrap();
        batch.step().run("SELECT 2").unwrap();

        let err = batch.execute_with_cursor().await.expect_err("must fail");
        assert!(matches!(err, HranaError::Proto(_)));
    }

    #[tokio::test]
    async fn closed_sql_handle_fails_the_batch_locally() {
        let stream = CannedStream::default();
        let owner = Arc::new(crate::sql::tests::RecordingOwner::default());
        let sql = Sql::store(owner, "SELECT 1").unwrap();
        sql.close();

        let mut batch = stream.batch();
        batch.step().query(Stmt::from(&sql)).unwrap();
        let err = batch.execute().await.expect_err("must fail");
        assert!(matches!(err, HranaError::Closed { .. }));
        assert!(stream.sent.lock().is_empty());
    }
}
