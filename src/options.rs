use std::time::Duration;

/// Tunables shared by the WebSocket and HTTP clients.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-request timeout for HTTP requests and the WebSocket handshake, in milliseconds.
    pub timeout_ms: u64,
    /// Number of SQL texts each stream keeps stored on the server.
    ///
    /// `0` disables the cache.
    pub sql_cache_capacity: usize,
    /// Maximum number of entries requested per WebSocket cursor fetch.
    pub cursor_fetch_chunk: u32,
    /// Age after which the HTTP client opens new streams on a fresh connection, in milliseconds.
    pub conn_max_age_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            sql_cache_capacity: 30,
            cursor_fetch_chunk: 1000,
            conn_max_age_ms: 60_000,
        }
    }
}

impl ClientOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_sql_cache_capacity(mut self, capacity: usize) -> Self {
        self.sql_cache_capacity = capacity;
        self
    }

    pub fn with_cursor_fetch_chunk(mut self, chunk: u32) -> Self {
        self.cursor_fetch_chunk = chunk.max(1);
        self
    }

    pub fn with_conn_max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.conn_max_age_ms = max_age_ms;
        self
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn conn_max_age(&self) -> Duration {
        Duration::from_millis(self.conn_max_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientOptions;

    #[test]
    fn fetch_chunk_is_never_zero() {
        let options = ClientOptions::default().with_cursor_fetch_chunk(0);
        assert_eq!(options.cursor_fetch_chunk, 1);
    }
}
