use async_trait::async_trait;

use crate::{
    wire, Batch, Cursor, DescribeResult, HranaError, Result, Sql, SqlText, Stmt, StmtResult,
};

/// An ordered sequence of SQL operations on one server-side connection.
///
/// Operations on a stream run in the order they were issued. Every operation
/// fails with [`HranaError::Closed`] once the stream or its client is closed.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Executes a single statement.
    async fn execute(&self, stmt: Stmt) -> Result<StmtResult>;

    /// Starts building a batch on this stream.
    fn batch(&self) -> Batch<'_>;

    /// Describes a statement without executing it. Requires protocol version 2.
    async fn describe(&self, sql: SqlText) -> Result<DescribeResult>;

    /// Executes a sequence of semicolon-separated statements, discarding their results.
    async fn sequence(&self, sql: SqlText) -> Result<()>;

    /// Returns whether the connection is in autocommit mode. Requires protocol version 3.
    async fn get_autocommit(&self) -> Result<bool>;

    /// Stores SQL text on the server for reuse by id.
    fn store_sql(&self, sql: &str) -> Result<Sql>;

    /// Removes stored SQL text from the server. Same as [`Sql::close`].
    fn close_sql(&self, sql: &Sql) {
        sql.close();
    }

    /// Resolves the negotiated protocol version.
    async fn get_version(&self) -> Result<u32>;

    /// Closes the stream immediately, failing operations that have not completed.
    fn close(&self);

    /// Closes the stream after every queued operation has completed.
    async fn close_gracefully(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Sends a batch as one request.
    #[doc(hidden)]
    async fn execute_batch(&self, batch: wire::Batch) -> Result<wire::BatchResult>;

    /// Executes a batch through a cursor. Requires protocol version 3.
    #[doc(hidden)]
    async fn open_cursor(&self, batch: wire::Batch) -> Result<Box<dyn Cursor>>;

    /// Protocol version if it is already known.
    #[doc(hidden)]
    fn version_hint(&self) -> Option<u32>;
}

/// Fails with [`HranaError::ProtocolVersion`] if `version` is below `min_version`.
pub(crate) fn check_version(feature: &'static str, min_version: u32, version: u32) -> Result<()> {
    if version < min_version {
        return Err(HranaError::ProtocolVersion {
            feature,
            min_version,
            actual_version: version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::check_version;
    use crate::HranaError;

    #[test]
    fn version_gate() {
        assert!(check_version("describe", 2, 3).is_ok());
        let err = check_version("cursor", 3, 2).expect_err("must fail");
        assert!(matches!(
            err,
            HranaError::ProtocolVersion {
                min_version: 3,
                actual_version: 2,
                ..
            }
        ));
    }
}
