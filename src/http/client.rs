use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::conn::{normalize_bearer_authorization, HttpConn};
use super::stream::HttpStream;
use crate::{ClientOptions, HranaError, Result};

/// Which connection new streams are opened on.
///
/// Once the active connection is older than `conn_max_age_ms`, a new one is
/// created and probed. Streams keep using the old connection until the probe
/// of the new one resolves.
enum ConnState {
    Active(Arc<HttpConn>),
    Transitioning {
        old: Arc<HttpConn>,
        new: Arc<HttpConn>,
    },
}

pub(crate) struct ClientShared {
    url: String,
    authorization: Option<String>,
    pub options: ClientOptions,
    state: Mutex<ConnState>,
    pub closed_tx: watch::Sender<Option<HranaError>>,
}

impl ClientShared {
    pub fn closed_error(&self) -> Option<HranaError> {
        self.closed_tx
            .borrow()
            .as_ref()
            .map(|reason| HranaError::closed("HTTP client is closed", Some(reason.clone())))
    }

    fn current_conn(self: &Arc<Self>) -> Result<Arc<HttpConn>> {
        let mut state = self.state.lock();
        let active = match &*state {
            ConnState::Transitioning { old, .. } => return Ok(old.clone()),
            ConnState::Active(conn) if conn.age() < self.options.conn_max_age() => {
                return Ok(conn.clone())
            }
            ConnState::Active(conn) => conn.clone(),
        };

        let new = Arc::new(HttpConn::new(
            &self.url,
            self.authorization.clone(),
            self.options.timeout(),
        )?);
        tracing::debug!(url = %self.url, "rotating http connection");
        *state = ConnState::Transitioning {
            old: active.clone(),
            new: new.clone(),
        };
        tokio::spawn(commit_when_probed(Arc::downgrade(self), new));
        Ok(active)
    }

    fn conn_for_version(&self) -> Arc<HttpConn> {
        match &*self.state.lock() {
            ConnState::Active(conn) => conn.clone(),
            ConnState::Transitioning { old, .. } => old.clone(),
        }
    }
}

async fn commit_when_probed(shared: Weak<ClientShared>, new: Arc<HttpConn>) {
    let endpoint = new.endpoint().await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.state.lock();
    let still_pending = matches!(
        &*state,
        ConnState::Transitioning { new: pending, .. } if Arc::ptr_eq(pending, &new)
    );
    if still_pending {
        tracing::debug!(version = endpoint.version, "http connection rotated");
        *state = ConnState::Active(new);
    }
}

/// Hrana client over HTTP.
///
/// Every stream is an independent server-side session continued by batons,
/// so a client can serve many streams concurrently.
#[derive(Clone)]
pub struct HttpClient {
    shared: Arc<ClientShared>,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("url", &self.shared.url)
            .field("authorization", &"<redacted>")
            .field("options", &self.shared.options)
            .finish()
    }
}

impl HttpClient {
    /// Creates a client for the server at `url` (`http://` or `https://`).
    ///
    /// If the token is missing the `Bearer ` prefix, it is added automatically.
    pub fn open(url: &str, jwt: Option<&str>, options: ClientOptions) -> Result<Self> {
        let authorization = jwt.map(normalize_bearer_authorization);
        let conn = HttpConn::new(url, authorization.clone(), options.timeout())?;
        let (closed_tx, _) = watch::channel(None);
        Ok(Self {
            shared: Arc::new(ClientShared {
                url: conn.url.clone(),
                authorization,
                options,
                state: Mutex::new(ConnState::Active(Arc::new(conn))),
                closed_tx,
            }),
        })
    }

    /// Resolves the protocol version, probing the server if needed.
    pub async fn get_version(&self) -> Result<u32> {
        if let Some(err) = self.shared.closed_error() {
            return Err(err);
        }
        Ok(self.shared.conn_for_version().endpoint().await.version)
    }

    /// Opens a new stream. No request is sent until the first operation.
    ///
    /// Must be called within a tokio runtime.
    pub fn open_stream(&self) -> Result<HttpStream> {
        if let Some(err) = self.shared.closed_error() {
            return Err(err);
        }
        let conn = self.shared.current_conn()?;
        Ok(HttpStream::open(self.shared.clone(), conn))
    }

    /// Closes the client and every stream opened from it.
    pub fn close(&self) {
        self.shared.closed_tx.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(HranaError::closed("HTTP client was manually closed", None));
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed_tx.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::HttpClient;
    use crate::{ClientOptions, HranaError};

    #[test]
    fn debug_redacts_authorization_value() {
        let client =
            HttpClient::open("https://db.example", Some("secret-token"), ClientOptions::default())
                .unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn closed_client_refuses_new_streams() {
        let client =
            HttpClient::open("https://db.example/", None, ClientOptions::default()).unwrap();
        client.close();
        assert!(client.is_closed());
        let err = client.open_stream().expect_err("must fail");
        match err {
            HranaError::Closed { cause, .. } => assert!(cause.is_some()),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
