use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::sql::{Sql, SqlOwner};
use crate::{wire, Result};

/// LRU of SQL texts stored on the server.
///
/// [`SqlCache::apply`] rewrites statements that carry inline text to use the
/// cached id instead. It must be called right before each send: a later call
/// may evict entries and close their ids.
pub(crate) struct SqlCache {
    owner: Arc<dyn SqlOwner>,
    capacity: usize,
    entries: HashMap<String, Entry>,
    tick: u64,
    session: u64,
}

struct Entry {
    sql: Sql,
    last_used: u64,
}

impl SqlCache {
    pub fn new(owner: Arc<dyn SqlOwner>, capacity: usize) -> Self {
        Self {
            session: owner.session(),
            owner,
            capacity,
            entries: HashMap::new(),
            tick: 0,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn apply<'a>(&mut self, stmts: impl IntoIterator<Item = &'a mut wire::Stmt>) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }

        let session = self.owner.session();
        if session != self.session {
            // Ids from an ended server session are gone; nothing to close.
            tracing::debug!(
                cached = self.entries.len(),
                "server session ended, dropping cached SQL"
            );
            self.entries.clear();
            self.session = session;
        }

        let mut used: HashSet<i32> = HashSet::new();
        for stmt in stmts {
            let Some(text) = stmt.sql.as_deref() else {
                continue;
            };

            self.tick += 1;
            let tick = self.tick;
            if let Some(entry) = self.entries.get_mut(text) {
                if let Ok(id) = entry.sql.id() {
                    entry.last_used = tick;
                    used.insert(id);
                    stmt.sql = None;
                    stmt.sql_id = Some(id);
                    continue;
                }
                self.entries.remove(text);
            }

            if !self.make_room(&used) {
                continue;
            }

            let sql = Sql::store(self.owner.clone(), text)?;
            let id = sql.id()?;
            used.insert(id);
            let text = stmt.sql.take().unwrap_or_default();
            stmt.sql_id = Some(id);
            self.entries.insert(
                text,
                Entry {
                    sql,
                    last_used: tick,
                },
            );
        }
        Ok(())
    }

    /// Evicts least recently used entries not in `used` until one slot is free.
    fn make_room(&mut self, used: &HashSet<i32>) -> bool {
        while self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.sql.id().map_or(true, |id| !used.contains(&id)))
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(text, _)| text.clone());

            match victim {
                Some(text) => {
                    if let Some(entry) = self.entries.remove(&text) {
                        tracing::debug!("evicting cached SQL text from cache");
                        entry.sql.close();
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// Closes every cached handle.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.sql.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SqlCache;
    use crate::sql::tests::RecordingOwner;
    use crate::wire::Stmt;

    fn stmt(sql: &str) -> Stmt {
        Stmt {
            sql: Some(sql.to_owned()),
            ..Stmt::default()
        }
    }

    #[test]
    fn repeated_text_is_rewritten_to_id() {
        let owner = Arc::new(RecordingOwner::default());
        let mut cache = SqlCache::new(owner.clone(), 4);

        let mut first = stmt("SELECT 1");
        cache.apply([&mut first]).unwrap();
        let mut second = stmt("SELECT 1");
        cache.apply([&mut second]).unwrap();

        assert_eq!(first.sql_id, Some(0));
        assert_eq!(second.sql, None);
        assert_eq!(second.sql_id, Some(0));
        assert_eq!(owner.stored.lock().len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let owner = Arc::new(RecordingOwner::default());
        let mut cache = SqlCache::new(owner.clone(), 2);

        for text in ["a", "b", "a", "c"] {
            let mut s = stmt(text);
            cache.apply([&mut s]).unwrap();
        }

        // "b" was least recently used when "c" arrived.
        assert_eq!(*owner.closed.lock(), vec![1]);
        let mut again = stmt("a");
        cache.apply([&mut again]).unwrap();
        assert_eq!(again.sql_id, Some(0));
    }

    #[test]
    fn entries_in_use_by_the_same_call_are_not_evicted() {
        let owner = Arc::new(RecordingOwner::default());
        let mut cache = SqlCache::new(owner.clone(), 2);

        let mut stmts = vec![stmt("a"), stmt("b"), stmt("c")];
        cache.apply(stmts.iter_mut()).unwrap();

        assert_eq!(stmts[0].sql_id, Some(0));
        assert_eq!(stmts[1].sql_id, Some(1));
        assert_eq!(stmts[2].sql.as_deref(), Some("c"));
        assert_eq!(stmts[2].sql_id, None);
        assert!(owner.closed.lock().is_empty());
    }

    #[test]
    fn live_ids_never_exceed_capacity() {
        let owner = Arc::new(RecordingOwner::default());
        let capacity = 3;
        let mut cache = SqlCache::new(owner.clone(), capacity);

        let texts = ["a", "b", "c", "d", "a", "e", "b", "b", "f", "g", "a", "c"];
        for window in texts.windows(2) {
            let mut stmts: Vec<Stmt> = window.iter().map(|text| stmt(text)).collect();
            cache.apply(stmts.iter_mut()).unwrap();

            let closed = owner.closed.lock().len();
            let stored = owner.stored.lock().len();
            assert!(cache.len() <= capacity);
            assert!(stored - closed <= capacity);
            assert!(owner.ids.lock().in_use() <= capacity);
        }
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let owner = Arc::new(RecordingOwner::default());
        let mut cache = SqlCache::new(owner.clone(), 0);
        let mut s = stmt("SELECT 1");
        cache.apply([&mut s]).unwrap();
        assert_eq!(s.sql.as_deref(), Some("SELECT 1"));
        assert!(owner.stored.lock().is_empty());
    }

    #[test]
    fn ended_session_drops_entries_without_closing_them() {
        let owner = Arc::new(RecordingOwner::default());
        let mut cache = SqlCache::new(owner.clone(), 4);

        let mut first = stmt("SELECT 1");
        cache.apply([&mut first]).unwrap();
        owner.end_session();

        let mut again = stmt("SELECT 1");
        cache.apply([&mut again]).unwrap();

        assert_eq!(again.sql_id, Some(0));
        assert_eq!(cache.len(), 1);
        assert_eq!(owner.stored.lock().len(), 2);
        assert!(owner.closed.lock().is_empty());
    }
}
