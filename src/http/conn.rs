use std::time::{Duration, Instant};

use reqwest::header;
use tokio::sync::OnceCell;

use crate::encoding::Encoding;
use crate::{wire, HranaError, Result};

/// Protocol flavour spoken by the server, decided by the version probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Endpoint {
    pub version: u32,
    pub encoding: Encoding,
    pub pipeline_path: &'static str,
    pub cursor_path: Option<&'static str>,
}

pub(crate) const V3_PROTOBUF: Endpoint = Endpoint {
    version: 3,
    encoding: Encoding::Protobuf,
    pipeline_path: "v3-protobuf/pipeline",
    cursor_path: Some("v3-protobuf/cursor"),
};

pub(crate) const V2_JSON: Endpoint = Endpoint {
    version: 2,
    encoding: Encoding::Json,
    pipeline_path: "v2/pipeline",
    cursor_path: None,
};

/// One generation of HTTP connections to the server.
pub(crate) struct HttpConn {
    http: reqwest::Client,
    /// Base URL without a trailing slash.
    pub url: String,
    authorization: Option<String>,
    timeout: Duration,
    endpoint: OnceCell<Endpoint>,
    created_at: Instant,
}

impl HttpConn {
    pub fn new(url: &str, authorization: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            url: url.trim_end_matches('/').to_owned(),
            authorization,
            timeout,
            endpoint: OnceCell::new(),
            created_at: Instant::now(),
        })
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Resolves the endpoint, probing the server on first use.
    pub async fn endpoint(&self) -> Endpoint {
        *self.endpoint.get_or_init(|| self.probe()).await
    }

    pub fn endpoint_hint(&self) -> Option<Endpoint> {
        self.endpoint.get().copied()
    }

    async fn probe(&self) -> Endpoint {
        let url = format!("{}/v3-protobuf", self.url);
        let mut request = self.http.get(&url).timeout(self.timeout);
        if let Some(authorization) = &self.authorization {
            request = request.header(header::AUTHORIZATION, authorization);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %self.url, "server supports hrana 3 over protobuf");
                V3_PROTOBUF
            }
            Ok(response) => {
                tracing::debug!(
                    url = %self.url,
                    status = response.status().as_u16(),
                    "version probe rejected, falling back to hrana 2 over JSON"
                );
                V2_JSON
            }
            Err(err) => {
                tracing::debug!(url = %self.url, %err, "version probe failed, falling back to hrana 2 over JSON");
                V2_JSON
            }
        }
    }

    /// Posts an encoded body and checks the response status.
    ///
    /// Cursor requests pass `timeout: false` since their body streams for as
    /// long as the batch runs.
    pub async fn post(
        &self,
        url: &str,
        encoding: Encoding,
        body: Vec<u8>,
        timeout: bool,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, encoding.content_type())
            .body(body);
        if timeout {
            request = request.timeout(self.timeout);
        }
        if let Some(authorization) = &self.authorization {
            request = request.header(header::AUTHORIZATION, authorization);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            let message = serde_json::from_str::<wire::Error>(&body)
                .map(|error| error.message)
                .unwrap_or(body);
            return Err(HranaError::HttpServer {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

pub(crate) fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bearer_authorization;

    #[test]
    fn normalize_bearer_adds_prefix_when_missing() {
        assert_eq!(normalize_bearer_authorization("abc123"), "Bearer abc123");
    }

    #[test]
    fn normalize_bearer_keeps_existing_prefix() {
        assert_eq!(
            normalize_bearer_authorization(" bEaReR abc123 "),
            "bEaReR abc123"
        );
    }
}
