use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{ProtocolError, SubProtocolError};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{negotiate, subprotocol_offer, Command, Release, Reply};
use crate::encoding::Encoding;
use crate::id_alloc::IdAlloc;
use crate::wire::ws::{ClientMsg, Request, ServerMsg};
use crate::{HranaError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State the connection task shares with the client handles.
pub(crate) struct Shared {
    pub closed: Arc<Mutex<Option<HranaError>>>,
    pub stream_ids: Arc<Mutex<IdAlloc>>,
    pub cursor_ids: Arc<Mutex<IdAlloc>>,
    pub version_tx: watch::Sender<Option<u32>>,
}

struct Queued {
    request: Request,
    stream_id: Option<i32>,
    reply: Option<Reply>,
    release: Option<Release>,
}

struct Pending {
    kind: &'static str,
    stream_id: Option<i32>,
    reply: Option<Reply>,
    release: Option<Release>,
}

struct Actor {
    jwt: Option<String>,
    encoding: Encoding,
    hello_ok: bool,
    request_ids: IdAlloc,
    /// Requests waiting for the handshake to complete.
    queued: VecDeque<Queued>,
    /// Requests sent and not answered yet, by request id.
    pending: HashMap<i32, Pending>,
    shared: Shared,
}

/// Runs one WebSocket connection until it closes.
pub(crate) async fn run(
    url: String,
    jwt: Option<String>,
    timeout: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Shared,
) {
    let mut actor = Actor {
        jwt,
        encoding: Encoding::Json,
        hello_ok: false,
        request_ids: IdAlloc::new(),
        queued: VecDeque::new(),
        pending: HashMap::new(),
        shared,
    };

    let connect = connect(&url, timeout);
    tokio::pin!(connect);
    let (mut socket, version, encoding) = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(conn) => break conn,
                Err(err) => return actor.shut_down(err, &mut cmd_rx),
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Request { request, stream_id, reply, release }) => {
                    actor.queued.push_back(Queued { request, stream_id, reply, release });
                }
                Some(Command::FailStream { stream_id, error }) => actor.fail_stream(stream_id, &error),
                Some(Command::Close { error }) => return actor.shut_down(error, &mut cmd_rx),
                None => return actor.shut_down(dropped(), &mut cmd_rx),
            },
        }
    };

    tracing::debug!(version, ?encoding, "websocket connected");
    actor.encoding = encoding;
    actor.shared.version_tx.send_replace(Some(version));

    let hello = ClientMsg::Hello {
        jwt: actor.jwt.clone(),
    };
    let reason = match actor.send_message(&mut socket, &hello).await {
        Ok(()) => actor.serve(&mut socket, &mut cmd_rx).await,
        Err(err) => err,
    };

    if let Err(err) = socket.close(None).await {
        tracing::debug!(%err, "failed to close websocket cleanly");
    }
    actor.shut_down(reason, &mut cmd_rx);
}

fn dropped() -> HranaError {
    HranaError::closed("WebSocket client was dropped", None)
}

async fn connect(url: &str, timeout: Duration) -> Result<(Socket, u32, Encoding)> {
    let (socket, selected) = match handshake(url, true, timeout).await? {
        Ok(conn) => conn,
        Err(tungstenite::Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(
            SubProtocolError::NoSubProtocol,
        ))) => {
            tracing::debug!("server selected no subprotocol, retrying as hrana1");
            handshake(url, false, timeout).await??
        }
        Err(err) => return Err(err.into()),
    };
    let (version, encoding) = negotiate(selected.as_deref())?;
    Ok((socket, version, encoding))
}

async fn handshake(
    url: &str,
    offer_subprotocols: bool,
    timeout: Duration,
) -> Result<std::result::Result<(Socket, Option<String>), tungstenite::Error>> {
    let mut request = url.into_client_request()?;
    if offer_subprotocols {
        let offer = HeaderValue::from_str(&subprotocol_offer())
            .map_err(|err| HranaError::Internal(format!("invalid subprotocol header: {err}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offer);
    }

    let result = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| {
            HranaError::WebSocket(format!(
                "connection timeout after {}ms",
                timeout.as_millis()
            ))
        })?;

    Ok(result.map(|(socket, response)| {
        let selected = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        (socket, selected)
    }))
}

impl Actor {
    /// Serves commands and server messages; returns the reason the connection ended.
    async fn serve(
        &mut self,
        socket: &mut Socket,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> HranaError {
        loop {
            let result = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Request { request, stream_id, reply, release }) => {
                        let queued = Queued { request, stream_id, reply, release };
                        if self.hello_ok {
                            self.send_request(socket, queued).await
                        } else {
                            self.queued.push_back(queued);
                            Ok(())
                        }
                    }
                    Some(Command::FailStream { stream_id, error }) => {
                        self.fail_stream(stream_id, &error);
                        Ok(())
                    }
                    Some(Command::Close { error }) => return error,
                    None => return dropped(),
                },
                msg = socket.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(socket, text.as_bytes(), false).await,
                    Some(Ok(Message::Binary(data))) => self.handle_frame(socket, &data, true).await,
                    Some(Ok(Message::Close(frame))) => Err(HranaError::WebSocket(match frame {
                        Some(frame) => format!("server closed the connection: {} {}", frame.code, frame.reason),
                        None => "server closed the connection".to_owned(),
                    })),
                    Some(Ok(_)) => Ok(()),
                    Some(Err(err)) => Err(err.into()),
                    None => Err(HranaError::WebSocket("connection closed unexpectedly".to_owned())),
                },
            };

            if let Err(err) = result {
                return err;
            }
        }
    }

    async fn handle_frame(&mut self, socket: &mut Socket, data: &[u8], binary: bool) -> Result<()> {
        if binary != (self.encoding == Encoding::Protobuf) {
            return Err(HranaError::proto(format!(
                "received a {} message on a {:?} connection",
                if binary { "binary" } else { "text" },
                self.encoding
            )));
        }

        match self.encoding.decode::<ServerMsg>(data)? {
            ServerMsg::HelloOk => {
                if self.hello_ok {
                    return Err(HranaError::proto("received hello_ok twice"));
                }
                self.hello_ok = true;
                tracing::debug!(queued = self.queued.len(), "websocket hello accepted");
                while let Some(queued) = self.queued.pop_front() {
                    self.send_request(socket, queued).await?;
                }
            }
            ServerMsg::HelloError { error } => return Err(HranaError::response(error)),
            ServerMsg::ResponseOk {
                request_id,
                response,
            } => {
                let pending = self.take_pending(request_id)?;
                if response.kind() != pending.kind {
                    return Err(HranaError::proto(format!(
                        "received a {} response to a {} request",
                        response.kind(),
                        pending.kind
                    )));
                }
                self.release(pending.release);
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Ok(response));
                }
            }
            ServerMsg::ResponseError { request_id, error } => {
                let pending = self.take_pending(request_id)?;
                self.release(pending.release);
                let error = HranaError::response(error);
                match pending.reply {
                    Some(reply) => {
                        let _ = reply.send(Err(error));
                    }
                    None => tracing::warn!(kind = pending.kind, %error, "request failed"),
                }
            }
        }
        Ok(())
    }

    fn take_pending(&mut self, request_id: i32) -> Result<Pending> {
        if !self.hello_ok {
            return Err(HranaError::proto("received a response before hello completed"));
        }
        let pending = self.pending.remove(&request_id).ok_or_else(|| {
            HranaError::proto(format!("received a response to unknown request {request_id}"))
        })?;
        self.request_ids.free(request_id)?;
        Ok(pending)
    }

    async fn send_request(&mut self, socket: &mut Socket, queued: Queued) -> Result<()> {
        let request_id = self.request_ids.alloc();
        let kind = queued.request.kind();
        let msg = ClientMsg::Request {
            request_id,
            request: queued.request,
        };

        let message = match self.encode(&msg) {
            Ok(message) => message,
            Err(err) => {
                self.request_ids.free(request_id)?;
                match queued.reply {
                    Some(reply) => {
                        let _ = reply.send(Err(err));
                    }
                    None => tracing::warn!(kind, %err, "failed to encode request"),
                }
                return Ok(());
            }
        };

        self.pending.insert(
            request_id,
            Pending {
                kind,
                stream_id: queued.stream_id,
                reply: queued.reply,
                release: queued.release,
            },
        );
        socket.send(message).await?;
        Ok(())
    }

    async fn send_message(&self, socket: &mut Socket, msg: &ClientMsg) -> Result<()> {
        let message = self.encode(msg)?;
        socket.send(message).await?;
        Ok(())
    }

    fn encode(&self, msg: &ClientMsg) -> Result<Message> {
        let data = self.encoding.encode(msg)?;
        Ok(match self.encoding {
            Encoding::Json => Message::Text(
                String::from_utf8(data)
                    .map_err(|err| HranaError::Internal(format!("JSON is not UTF-8: {err}")))?,
            ),
            Encoding::Protobuf => Message::Binary(data),
        })
    }

    fn release(&self, release: Option<Release>) {
        let result = match release {
            Some(Release::Stream(id)) => self.shared.stream_ids.lock().free(id),
            Some(Release::Cursor(id)) => self.shared.cursor_ids.lock().free(id),
            None => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!(%err, "failed to release id");
        }
    }

    /// Fails the stream's requests that are still waiting for an answer.
    ///
    /// Requests already sent stay pending so that their responses are consumed.
    fn fail_stream(&mut self, stream_id: i32, error: &HranaError) {
        let queued = std::mem::take(&mut self.queued);
        for queued in queued {
            match queued.reply {
                Some(reply) if queued.stream_id == Some(stream_id) => {
                    let _ = reply.send(Err(error.clone()));
                }
                _ => self.queued.push_back(queued),
            }
        }

        for pending in self.pending.values_mut() {
            if pending.stream_id == Some(stream_id) {
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }
    }

    fn shut_down(&mut self, reason: HranaError, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(%reason, "websocket connection closed");
        {
            let mut closed = self.shared.closed.lock();
            if closed.is_none() {
                *closed = Some(reason.clone());
            }
        }

        let error = HranaError::closed("WebSocket client is closed", Some(reason));
        let fail = |reply: Option<Reply>| {
            if let Some(reply) = reply {
                let _ = reply.send(Err(error.clone()));
            }
        };

        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let Command::Request { reply, .. } = cmd {
                fail(reply);
            }
        }
        for queued in self.queued.drain(..) {
            fail(queued.reply);
        }
        for (_, pending) in self.pending.drain() {
            fail(pending.reply);
        }
    }
}
