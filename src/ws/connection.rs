#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use backoff::backoff::Backoff as _;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::config::Config;
use super::error::WsError;
use super::message::{GOODBYE_AND_OUT, SUBPROTOCOL, WampMessage};
use super::session::{Control, Outgoing, WsSession};
use crate::config::{ConnectionConfig, TransportKind};
use crate::error::Error;
use crate::session::{Component, FatalCheck, Lifecycle, Listeners, SessionHandle, Stopped};
use crate::{Result, error::Kind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Run = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// Session component connecting to a router over a WebSocket.
///
/// Each [`start`](Component::start) spawns a connection loop on the current
/// runtime. The loop reconnects with exponential backoff until a session
/// joined; once joined, losing the transport stops the component if the
/// fatal check says so, otherwise the loop connects again.
pub struct WebSocketComponent {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    realm: String,
    config: Config,
    is_fatal: FatalCheck,
    listeners: Listeners,
    session: RwLock<Option<Arc<WsSession>>>,
    run: Mutex<Option<(Run, Arc<AtomicBool>)>>,
}

impl Component for WebSocketComponent {
    type Options = Config;

    fn create(
        config: &ConnectionConfig,
        options: Self::Options,
        is_fatal: FatalCheck,
    ) -> Result<Self> {
        let transport = config
            .transports
            .iter()
            .find(|transport| transport.kind == TransportKind::WebSocket)
            .ok_or_else(|| {
                Error::validation(format!(
                    "no websocket transport given, {} transports are not supported",
                    TransportKind::RawSocket
                ))
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: transport.url.clone(),
                realm: config.realm.clone(),
                config: options,
                is_fatal,
                listeners: Listeners::default(),
                session: RwLock::new(None),
                run: Mutex::new(None),
            }),
        })
    }

    fn start(&self) -> Stopped {
        let mut run = self.inner.run.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((current, finished)) = run.as_ref()
            && !finished.load(Ordering::Acquire)
        {
            return current.clone().map(|r| r.map_err(Error::shared)).boxed();
        }

        let finished = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&finished);
        tokio::spawn(async move {
            let result = inner.connection_loop().await;
            flag.store(true, Ordering::Release);
            _ = done_tx.send(result.map_err(Arc::new));
        });

        let current: Run = async move {
            done_rx.await.unwrap_or_else(|_dropped| {
                Err(Arc::new(Error::connect("connection task ended unexpectedly")))
            })
        }
        .boxed()
        .shared();

        *run = Some((current.clone(), finished));

        current.map(|r| r.map_err(Error::shared)).boxed()
    }

    fn session(&self) -> Option<SessionHandle> {
        let session = self
            .inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        session.map(|session| session as SessionHandle)
    }

    fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }
}

impl Inner {
    /// Main connection loop with automatic reconnection.
    async fn connection_loop(self: &Arc<Self>) -> Result<()> {
        let mut attempt = 0_u32;
        let mut backoff: backoff::ExponentialBackoff = self.config.reconnect.clone().into();

        loop {
            match self.join().await {
                Ok((ws_stream, session_id)) => {
                    attempt = 0;
                    backoff.reset();

                    match self.handle_session(ws_stream, session_id).await {
                        Ok(()) => return Ok(()),
                        Err(e) if (self.is_fatal)(&e) => return Err(e),
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "session ended, reconnecting");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    }
                }
                Err(e) => {
                    let aborted = matches!(e.downcast_ref::<WsError>(), Some(WsError::Aborted { .. }));
                    let e = Arc::new(e);

                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "unable to join");

                    self.listeners.emit(&Lifecycle::ConnectFailure(Arc::clone(&e)));
                    if aborted || (self.is_fatal)(&e) {
                        return Err(Error::shared(e));
                    }
                    attempt = attempt.saturating_add(1);
                }
            }

            // Check if we should stop reconnecting
            if let Some(max) = self.config.reconnect.max_attempts
                && attempt >= max
            {
                return Err(Error::connect(format!(
                    "giving up after {attempt} failed attempts"
                )));
            }

            if let Some(duration) = backoff.next_backoff() {
                sleep(duration).await;
            }
        }
    }

    /// Open the WebSocket and join the realm.
    async fn join(&self) -> Result<(WsStream, u64)> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (mut ws_stream, _) = timeout(self.config.handshake_timeout, connect_async(request))
            .await
            .map_err(|_elapsed| WsError::Timeout)??;

        self.listeners.emit(&Lifecycle::Connect);

        ws_stream
            .send(Message::Text(WampMessage::hello(&self.realm).encode()?.into()))
            .await?;

        let welcome = timeout(self.config.handshake_timeout, Self::next_message(&mut ws_stream))
            .await
            .map_err(|_elapsed| WsError::Timeout)??;

        match welcome {
            WampMessage::Welcome { session, .. } => Ok((ws_stream, session)),
            WampMessage::Abort { details, reason } => {
                let message = details
                    .get("message")
                    .and_then(|message| message.as_str())
                    .map(str::to_owned);
                Err(WsError::Aborted { reason, message }.into())
            }
            other => Err(WsError::InvalidMessage(format!("expected WELCOME, got {other:?}")).into()),
        }
    }

    async fn next_message(ws_stream: &mut WsStream) -> Result<WampMessage> {
        while let Some(frame) = ws_stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(WampMessage::decode(text.as_str())?),
                Message::Close(_) => break,
                _ => {
                    // Ignore binary frames and control frames.
                }
            }
        }

        Err(WsError::ConnectionClosed.into())
    }

    /// Run a joined session until it ends.
    async fn handle_session(&self, ws_stream: WsStream, session_id: u64) -> Result<()> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let session = Arc::new(WsSession::new(
            session_id,
            outgoing_tx,
            self.config.handshake_timeout,
        ));

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));

        #[cfg(feature = "tracing")]
        tracing::debug!(session_id, realm = %self.realm, "joined");

        self.listeners
            .emit(&Lifecycle::Join(Arc::clone(&session) as SessionHandle));

        let result = self.handle_connection(ws_stream, outgoing_rx, &session).await;

        session.close();
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;

        self.listeners.emit(&Lifecycle::Leave);
        self.listeners.emit(&Lifecycle::Disconnect {
            was_clean: result.is_ok(),
        });

        result
    }

    /// Handle an active WebSocket connection.
    ///
    /// Returns `Ok` once the session said GOODBYE, and a lost transport error
    /// for everything else that ends the connection.
    async fn handle_connection(
        &self,
        ws_stream: WsStream,
        mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
        session: &WsSession,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        let heartbeat_interval = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(
            tokio::time::Instant::now() + heartbeat_interval,
            heartbeat_interval,
        );
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                // Handle incoming messages
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");

                            let message = match WampMessage::decode(text.as_str()) {
                                Ok(message) => message,
                                Err(e) => {
                                    #[cfg(feature = "tracing")]
                                    tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                                    #[cfg(not(feature = "tracing"))]
                                    let _ = (&text, &e);
                                    continue;
                                }
                            };

                            match session.dispatch(message) {
                                Control::Continue => {}
                                Control::Goodbye { requested } => {
                                    if !requested {
                                        let reply = WampMessage::Goodbye {
                                            details: serde_json::Map::new(),
                                            reason: GOODBYE_AND_OUT.to_owned(),
                                        };
                                        _ = write.send(Message::Text(reply.encode()?.into())).await;
                                    }
                                    _ = write.close().await;
                                    return Ok(());
                                }
                                Control::Abort(reason) => {
                                    return Err(Error::transport_lost(format!("session aborted: {reason}")));
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::transport_lost("connection closed by router"));
                        }
                        Some(Err(e)) => {
                            return Err(Error::with_source(Kind::FatalTransport, WsError::Connection(e)));
                        }
                        Some(Ok(_)) => {
                            // Ignore binary frames; pings are answered by tungstenite.
                        }
                    }
                }

                // Handle outgoing messages of the session
                outgoing = outgoing_rx.recv() => {
                    match outgoing {
                        Some(Outgoing::Message(message)) => {
                            if let Err(e) = write.send(Message::Text(message.encode()?.into())).await {
                                return Err(Error::with_source(Kind::FatalTransport, WsError::Connection(e)));
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            _ = write.close().await;
                            return Ok(());
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > heartbeat_interval + self.config.heartbeat_timeout {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Heartbeat timeout: no PONG received within {:?}",
                            self.config.heartbeat_timeout
                        );
                        return Err(Error::transport_lost("heartbeat timeout"));
                    }
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        return Err(Error::with_source(Kind::FatalTransport, WsError::Connection(e)));
                    }
                }
            }
        }
    }
}
