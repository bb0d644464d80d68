//! WebSocket event channel.
//!
//! One actor per socket: a writer task drains the connection's outbound
//! queue into the sink and keeps the socket alive with pings, while the
//! reader loop feeds client frames through a [`Session`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use huddle_shared::protocol::{ClientFrame, ServerFrame};
use huddle_shared::{ChatError, ChatResult, ConnectionId, IdentityId};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::hub::Hub;
use crate::media::MediaStore;
use crate::rate_limit::RateLimiter;
use crate::router::ConnectionSender;

/// Server pings this often; a healthy client answers with a pong.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// No frame at all (pongs included) for this long closes the socket.
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);

/// Protocol state of one connection.
pub struct Session {
    hub: Arc<Hub>,
    media: Arc<MediaStore>,
    limiter: RateLimiter<ConnectionId>,
    connection: ConnectionId,
    identity: Option<IdentityId>,
    tx: ConnectionSender,
}

impl Session {
    pub fn new(
        hub: Arc<Hub>,
        media: Arc<MediaStore>,
        limiter: RateLimiter<ConnectionId>,
        tx: ConnectionSender,
    ) -> Self {
        Self {
            hub,
            media,
            limiter,
            connection: ConnectionId::new(),
            identity: None,
            tx,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Parse and handle one text frame, queueing the reply or error.
    pub async fn handle_text(&mut self, text: &str) {
        let result = match ClientFrame::from_json(text) {
            Ok(frame) => self.handle(frame).await,
            Err(e) => Err(ChatError::InvalidRequest(format!("malformed frame: {e}"))),
        };
        self.reply(result);
    }

    pub fn reply(&self, result: ChatResult<Option<ServerFrame>>) {
        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!(connection = %self.connection, code = e.code(), "Frame rejected");
                ServerFrame::error(&e)
            }
        };
        // The writer may already be gone; nothing left to tell.
        let _ = self.tx.send(frame);
    }

    pub async fn handle(&mut self, frame: ClientFrame) -> ChatResult<Option<ServerFrame>> {
        if let ClientFrame::Identify { token } = frame {
            return self.identify(&token).await.map(Some);
        }
        let identity = self.identity.clone().ok_or(ChatError::InvalidToken)?;

        let reply = match frame {
            ClientFrame::Identify { .. } => None,
            ClientFrame::Subscribe { channel } => {
                self.hub.subscribe(&self.connection, &channel).await?;
                Some(ServerFrame::Subscribed { channel })
            }
            ClientFrame::Unsubscribe { channel } => {
                self.hub.unsubscribe(&self.connection, &channel)?;
                Some(ServerFrame::Unsubscribed { channel })
            }
            ClientFrame::SendMessage {
                channel,
                content,
                client_ref,
            } => {
                if !self.limiter.check(self.connection).await {
                    return Err(ChatError::RateLimited);
                }
                if let Some(reference) = content.media.as_deref().map(str::trim) {
                    if !reference.is_empty() && !self.media.contains(reference).await {
                        return Err(ChatError::MediaNotFound);
                    }
                }
                let message = self.hub.send_message(&identity, &channel, content).await?;
                Some(ServerFrame::MessageSent {
                    message,
                    client_ref,
                })
            }
            ClientFrame::FetchHistory {
                channel,
                before,
                limit,
            } => {
                let messages = self.hub.history(&identity, &channel, before, limit).await?;
                Some(ServerFrame::History { channel, messages })
            }
            ClientFrame::GetOnlineUsers => Some(ServerFrame::OnlineUsers {
                users: self.hub.list_online(),
            }),
            ClientFrame::InviteToRoom {
                room_name,
                username,
            } => {
                self.hub.invite_to_room(&identity, &room_name, &username).await?;
                None
            }
            ClientFrame::Ack {
                channel,
                message_id,
            } => {
                self.hub.ack(&identity, &channel, message_id).await?;
                None
            }
        };
        Ok(reply)
    }

    async fn identify(&mut self, token: &str) -> ChatResult<ServerFrame> {
        let identity = self.hub.verify_token(token).await?;
        match &self.identity {
            Some(current) if current == &identity => {}
            Some(_) => {
                return Err(ChatError::InvalidRequest(
                    "connection already identified".into(),
                ))
            }
            None => {
                self.hub.connect(&identity, self.connection, self.tx.clone());
                info!(identity = %identity, connection = %self.connection, "Connection identified");
                self.identity = Some(identity.clone());
            }
        }
        Ok(ServerFrame::Identified { identity })
    }

    /// Release presence, subscriptions and the rate-limit bucket.
    pub async fn close(self) {
        self.hub.disconnect(&self.connection);
        self.limiter.forget(&self.connection).await;
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Optional shortcut for the first `identify` frame.
    pub token: Option<String>,
}

/// GET /ws
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state, query.token))
}

pub async fn run_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let mut session = Session::new(
        Arc::clone(&state.hub),
        Arc::clone(&state.media),
        state.message_limiter.clone(),
        tx,
    );
    let connection = session.connection();
    debug!(connection = %connection, "WebSocket actor started");

    let writer = tokio::spawn(async move {
        let mut ping = interval(PING_INTERVAL);
        // The first tick fires immediately.
        ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match frame.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    if let Some(token) = token {
        let result = session.handle(ClientFrame::Identify { token }).await;
        session.reply(result);
    }

    loop {
        match timeout(IDLE_TIMEOUT, stream.next()).await {
            Err(_) => {
                info!(connection = %connection, "WebSocket idle, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(connection = %connection, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => session.handle_text(&text).await,
                Message::Binary(_) => session.reply(Err(ChatError::InvalidRequest(
                    "binary frames are not supported".into(),
                ))),
                Message::Close(frame) => {
                    debug!(connection = %connection, reason = ?frame, "Client initiated close");
                    break;
                }
                // axum answers pings itself; any traffic resets the idle timer.
                Message::Ping(_) | Message::Pong(_) => {}
            },
        }
    }

    session.close().await;
    writer.abort();
    debug!(connection = %connection, "WebSocket actor stopped");
}
