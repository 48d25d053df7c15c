use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{HranaError, Result};

/// Registers SQL text on the server.
///
/// Implementations queue the request on the connection or stream that owns
/// the id, so that it reaches the server before any statement using the id.
pub(crate) trait SqlOwner: Send + Sync {
    fn store_sql(&self, sql: &str) -> Result<i32>;
    fn close_sql(&self, sql_id: i32);

    /// Identifies the server session that ids are currently allocated in.
    ///
    /// An id stored under an older session is gone from the server.
    fn session(&self) -> u64 {
        0
    }
}

/// Handle to SQL text stored on the server under an integer id.
///
/// Statements built from a handle reference the id instead of carrying the
/// text. After [`Sql::close`] the handle can no longer be used.
#[derive(Clone)]
pub struct Sql {
    inner: Arc<SqlInner>,
}

struct SqlInner {
    id: i32,
    session: u64,
    text: String,
    closed: Mutex<Option<HranaError>>,
    owner: Arc<dyn SqlOwner>,
}

impl Sql {
    pub(crate) fn store(owner: Arc<dyn SqlOwner>, text: &str) -> Result<Self> {
        let id = owner.store_sql(text)?;
        Ok(Self {
            inner: Arc::new(SqlInner {
                id,
                session: owner.session(),
                text: text.to_owned(),
                closed: Mutex::new(None),
                owner,
            }),
        })
    }

    pub fn text(&self) -> &str {
        &self.inner.text
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().is_some() || self.is_stale()
    }

    fn is_stale(&self) -> bool {
        self.inner.owner.session() != self.inner.session
    }

    /// Returns the server-side id, failing if the handle was closed or the
    /// server session it was stored in has ended.
    pub fn id(&self) -> Result<i32> {
        if let Some(err) = &*self.inner.closed.lock() {
            return Err(err.clone());
        }
        if self.is_stale() {
            return Err(HranaError::closed(
                "SQL text belongs to a server session that has ended",
                None,
            ));
        }
        Ok(self.inner.id)
    }

    /// Removes the SQL text from the server. Closing twice is a no-op.
    pub fn close(&self) {
        {
            let mut closed = self.inner.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(HranaError::closed("SQL text is closed", None));
        }
        // The id may already be reused by the session that replaced ours.
        if !self.is_stale() {
            self.inner.owner.close_sql(self.inner.id);
        }
    }
}

impl fmt::Debug for Sql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sql")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{Sql, SqlOwner};
    use crate::id_alloc::IdAlloc;
    use crate::{HranaError, Result};

    /// Owner that records store/close calls instead of talking to a server.
    #[derive(Default)]
    pub(crate) struct RecordingOwner {
        pub ids: Mutex<IdAlloc>,
        pub stored: Mutex<Vec<(i32, String)>>,
        pub closed: Mutex<Vec<i32>>,
        pub session: AtomicU64,
    }

    impl RecordingOwner {
        /// Simulates the server dropping its session.
        pub(crate) fn end_session(&self) {
            *self.ids.lock() = IdAlloc::new();
            self.session.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl SqlOwner for RecordingOwner {
        fn store_sql(&self, sql: &str) -> Result<i32> {
            let id = self.ids.lock().alloc();
            self.stored.lock().push((id, sql.to_owned()));
            Ok(id)
        }

        fn close_sql(&self, sql_id: i32) {
            self.closed.lock().push(sql_id);
            let _ = self.ids.lock().free(sql_id);
        }

        fn session(&self) -> u64 {
            self.session.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn closed_handle_rejects_use() {
        let owner = Arc::new(RecordingOwner::default());
        let sql = Sql::store(owner.clone(), "SELECT 1").unwrap();
        assert_eq!(sql.id().unwrap(), 0);

        sql.close();
        sql.close();
        assert!(matches!(sql.id(), Err(HranaError::Closed { .. })));
        assert_eq!(*owner.closed.lock(), vec![0]);
    }

    #[test]
    fn handle_from_an_ended_session_is_not_closed_on_the_server() {
        let owner = Arc::new(RecordingOwner::default());
        let old = Sql::store(owner.clone(), "SELECT 1").unwrap();
        owner.end_session();

        assert!(old.is_closed());
        assert!(matches!(old.id(), Err(HranaError::Closed { .. })));

        let new = Sql::store(owner.clone(), "SELECT 2").unwrap();
        assert_eq!(new.id().unwrap(), 0);
        old.close();
        assert!(owner.closed.lock().is_empty());
        assert_eq!(new.id().unwrap(), 0);
    }
}
