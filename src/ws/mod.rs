//! Hrana over a persistent WebSocket.
//!
//! One background task owns the socket. Clients, streams and cursors send it
//! [`Command`]s and get responses back on oneshot channels.

mod actor;
mod client;
mod cursor;
mod stream;

use tokio::sync::oneshot;

use crate::encoding::Encoding;
use crate::wire::ws::{Request, Response};
use crate::{HranaError, Result};

pub use client::WsClient;
pub use stream::WsStream;

/// Subprotocols offered during the handshake, most preferred first.
pub(crate) const SUBPROTOCOLS: [(&str, u32, Encoding); 4] = [
    ("hrana3-protobuf", 3, Encoding::Protobuf),
    ("hrana3", 3, Encoding::Json),
    ("hrana2", 2, Encoding::Json),
    ("hrana1", 1, Encoding::Json),
];

/// Value of the `Sec-WebSocket-Protocol` request header.
///
/// The client handshake matches the server's pick against this list split on
/// bare commas, so the names must not be padded with spaces.
pub(crate) fn subprotocol_offer() -> String {
    SUBPROTOCOLS
        .iter()
        .map(|(name, _, _)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

/// Version and encoding selected by the server's subprotocol.
///
/// A server that selects no subprotocol speaks version 1 over JSON.
pub(crate) fn negotiate(selected: Option<&str>) -> Result<(u32, Encoding)> {
    let Some(selected) = selected else {
        return Ok((1, Encoding::Json));
    };
    SUBPROTOCOLS
        .iter()
        .find(|(name, _, _)| *name == selected)
        .map(|(_, version, encoding)| (*version, *encoding))
        .ok_or_else(|| {
            HranaError::WebSocket(format!("server selected unknown subprotocol '{selected}'"))
        })
}

pub(crate) type Reply = oneshot::Sender<Result<Response>>;

/// Id released back to its pool once the server confirms the close.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Release {
    Stream(i32),
    Cursor(i32),
}

pub(crate) enum Command {
    Request {
        request: Request,
        /// Stream the request is scoped to, so that closing the stream can fail it.
        stream_id: Option<i32>,
        reply: Option<Reply>,
        release: Option<Release>,
    },
    /// Fails every request of the stream that has not been answered yet.
    FailStream { stream_id: i32, error: HranaError },
    Close { error: HranaError },
}

#[cfg(test)]
mod tests {
    use super::{negotiate, subprotocol_offer};
    use crate::encoding::Encoding;

    #[test]
    fn subprotocol_selects_version_and_encoding() {
        assert_eq!(negotiate(Some("hrana3-protobuf")).unwrap(), (3, Encoding::Protobuf));
        assert_eq!(negotiate(Some("hrana2")).unwrap(), (2, Encoding::Json));
        assert_eq!(negotiate(None).unwrap(), (1, Encoding::Json));
        assert!(negotiate(Some("graphql-ws")).is_err());
    }

    #[test]
    fn subprotocol_offer_is_comma_separated_without_padding() {
        assert_eq!(subprotocol_offer(), "hrana3-protobuf,hrana3,hrana2,hrana1");
    }
}
