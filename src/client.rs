use std::fmt;

use crate::{ClientOptions, HranaError, HttpClient, Result, Stmt, StmtResult, Stream, WsClient};

/// Transport picked from the scheme of a database URL.
#[derive(Debug, Eq, PartialEq)]
enum Target {
    Ws(String),
    Http(String),
}

/// Maps a database URL to the transport it should be opened with.
///
/// `libsql://` is served over HTTPS.
fn resolve_url(url: &str) -> Result<Target> {
    let url = url.trim();
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(HranaError::Misuse(format!("URL {url:?} has no scheme")));
    };
    if rest.is_empty() {
        return Err(HranaError::Misuse(format!("URL {url:?} has no host")));
    }

    match scheme.to_ascii_lowercase().as_str() {
        "ws" | "wss" => Ok(Target::Ws(url.to_owned())),
        "http" | "https" => Ok(Target::Http(url.to_owned())),
        "libsql" => Ok(Target::Http(format!("https://{rest}"))),
        other => Err(HranaError::Misuse(format!(
            "unsupported URL scheme {other:?}, expected ws, wss, http, https or libsql"
        ))),
    }
}

/// Hrana client over whichever transport the database URL names.
#[derive(Clone)]
pub enum Client {
    Ws(WsClient),
    Http(HttpClient),
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Client::Ws(client) => client.fmt(f),
            Client::Http(client) => client.fmt(f),
        }
    }
}

impl Client {
    /// Opens a client for `url`.
    ///
    /// `ws://` and `wss://` connect over WebSocket, `http://`, `https://` and
    /// `libsql://` use HTTP. Must be called within a tokio runtime.
    pub fn open(url: &str, token: Option<&str>, options: ClientOptions) -> Result<Self> {
        match resolve_url(url)? {
            Target::Ws(url) => Ok(Client::Ws(WsClient::connect_with_options(
                url,
                token.map(str::to_owned),
                options,
            ))),
            Target::Http(url) => Ok(Client::Http(HttpClient::open(&url, token, options)?)),
        }
    }

    /// Opens a client from environment variables.
    ///
    /// Reads:
    /// - `HRANA_URL`: database URL
    /// - `HRANA_AUTH_TOKEN`: access token, optional
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_options(ClientOptions::default())
    }

    pub fn from_env_with_options(options: ClientOptions) -> Result<Self> {
        let url = std::env::var("HRANA_URL")
            .map_err(|_| HranaError::Misuse("missing HRANA_URL environment variable".to_owned()))?;
        if url.trim().is_empty() {
            return Err(HranaError::Misuse("HRANA_URL is set but empty".to_owned()));
        }
        let token = std::env::var("HRANA_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        Self::open(&url, token.as_deref(), options)
    }

    pub async fn get_version(&self) -> Result<u32> {
        match self {
            Client::Ws(client) => client.get_version().await,
            Client::Http(client) => client.get_version().await,
        }
    }

    pub fn open_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(match self {
            Client::Ws(client) => Box::new(client.open_stream()?),
            Client::Http(client) => Box::new(client.open_stream()?),
        })
    }

    /// Executes one statement on a fresh stream, closing it afterwards.
    pub async fn execute(&self, stmt: impl Into<Stmt>) -> Result<StmtResult> {
        let stream = self.open_stream()?;
        let result = stream.execute(stmt.into()).await;
        if let Err(err) = stream.close_gracefully().await {
            tracing::warn!(%err, "failed to close stream");
        }
        result
    }

    pub fn close(&self) {
        match self {
            Client::Ws(client) => client.close(),
            Client::Http(client) => client.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Client::Ws(client) => client.is_closed(),
            Client::Http(client) => client.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve_url, Client, Target};
    use crate::{ClientOptions, HranaError};

    #[test]
    fn websocket_schemes_pick_websocket() {
        assert_eq!(
            resolve_url("wss://db.example").unwrap(),
            Target::Ws("wss://db.example".to_owned())
        );
        assert_eq!(
            resolve_url(" ws://localhost:8080 ").unwrap(),
            Target::Ws("ws://localhost:8080".to_owned())
        );
    }

    #[test]
    fn libsql_scheme_maps_to_https() {
        assert_eq!(
            resolve_url("libsql://db-org.turso.io").unwrap(),
            Target::Http("https://db-org.turso.io".to_owned())
        );
        assert_eq!(
            resolve_url("HTTP://localhost:8080/").unwrap(),
            Target::Http("HTTP://localhost:8080/".to_owned())
        );
    }

    #[test]
    fn rejects_unknown_or_missing_scheme() {
        assert!(matches!(
            resolve_url("ftp://db.example"),
            Err(HranaError::Misuse(_))
        ));
        assert!(matches!(
            resolve_url("db.example"),
            Err(HranaError::Misuse(_))
        ));
        assert!(matches!(resolve_url("https://"), Err(HranaError::Misuse(_))));
    }

    #[test]
    fn debug_redacts_token() {
        let client = Client::open(
            "libsql://db.example",
            Some("secret-token"),
            ClientOptions::default(),
        )
        .unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[tokio::test]
    async fn closed_client_refuses_streams() {
        let client = Client::open("http://127.0.0.1:9", None, ClientOptions::default()).unwrap();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream(),
            Err(HranaError::Closed { .. })
        ));
        assert!(client.execute("SELECT 1").await.is_err());
    }
}
