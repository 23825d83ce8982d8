//! Push channel over WebSocket.
//!
//! Frames are JSON text. The client sends `{"type":"init"}` to subscribe or
//! `{"type":"all_timers"}` for a one-off refresh; both are answered with an
//! `all_timers` message. Subscribed connections then receive `active_timers`
//! on every tick until they close or their session ends.

use axum::{
    Extension, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::domain::{SessionToken, UserId};
use crate::services::{AuthError, Subscription, SyncMessage};

/// Client-to-server messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init {
        #[serde(rename = "userId", default)]
        user_id: Option<UserId>,
    },
    AllTimers {
        #[serde(rename = "userId", default)]
        user_id: Option<UserId>,
    },
}

impl ClientMessage {
    const fn claimed_user(&self) -> Option<UserId> {
        match self {
            Self::Init { user_id } | Self::AllTimers { user_id } => *user_id,
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Extension(session): Extension<SessionToken>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, session))
}

/// What the socket loop does after handling one event.
enum Step {
    Continue,
    Reply(SyncMessage),
    SessionEnded,
    Close,
}

/// One push connection. The session is re-checked before anything is sent,
/// so logout, revocation and expiry all end the connection.
struct PushClient {
    user_id: UserId,
    session: SessionToken,
    /// Handed to the registry on `init`. Once it is there, the registry
    /// holds the only sender and dropping it closes our receiver.
    outbound: Option<mpsc::Sender<SyncMessage>>,
    subscription: Option<Subscription>,
}

impl PushClient {
    async fn session_is_live(&self, state: &AppState) -> bool {
        match state.auth.authenticate(Some(&self.session)).await {
            Ok(user_id) => user_id == self.user_id,
            Err(e) => {
                debug!(user_id = self.user_id.value(), error = %e, "Push session no longer valid");
                false
            }
        }
    }

    /// Malformed frames are ignored. A `userId` naming someone other than
    /// the session owner gets an error reply and no data.
    async fn on_frame(&mut self, state: &AppState, text: &str) -> Step {
        if !self.session_is_live(state).await {
            return Step::SessionEnded;
        }

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(user_id = self.user_id.value(), error = %e, "Ignoring malformed frame");
                return Step::Continue;
            }
        };

        if let Some(claimed) = message.claimed_user()
            && claimed != self.user_id
        {
            warn!(
                user_id = self.user_id.value(),
                claimed = claimed.value(),
                "Push client claimed another user's id"
            );
            return Step::Reply(SyncMessage::Error {
                message: "userId does not match the session".to_string(),
            });
        }

        if matches!(message, ClientMessage::Init { .. })
            && let Some(outbound) = self.outbound.take()
        {
            let subscription = state
                .sync
                .subscribe(self.user_id, self.session.clone(), outbound)
                .await;
            self.subscription = Some(subscription);
            info!(user_id = self.user_id.value(), "Push client subscribed");
        }

        match state.sync.all_timers_message(self.user_id).await {
            Ok(reply) => Step::Reply(reply),
            Err(e) => {
                warn!(user_id = self.user_id.value(), error = %e, "Failed to load timers for push client");
                Step::Reply(SyncMessage::Error {
                    message: "Could not load timers, try again".to_string(),
                })
            }
        }
    }

    async fn on_push(&self, state: &AppState, message: Option<SyncMessage>) -> Step {
        // `None` means the registry dropped our sender: the session was ended.
        let Some(message) = message else {
            return Step::SessionEnded;
        };

        if self.session_is_live(state).await {
            Step::Reply(message)
        } else {
            Step::SessionEnded
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    session: SessionToken,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = state.sync.channel();
    let mut client = PushClient {
        user_id,
        session,
        outbound: Some(tx),
        subscription: None,
    };

    debug!(user_id = user_id.value(), "Push channel opened");

    loop {
        let step = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => client.on_frame(&state, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => Step::Close,
                Some(Ok(_)) => Step::Continue,
                Some(Err(e)) => {
                    debug!(user_id = user_id.value(), error = %e, "Push channel read error");
                    Step::Close
                }
            },
            pushed = rx.recv(), if client.subscription.is_some() => {
                client.on_push(&state, pushed).await
            }
        };

        match step {
            Step::Continue => {}
            Step::Reply(message) => {
                if send(&mut sender, &message).await.is_err() {
                    break;
                }
            }
            Step::SessionEnded => {
                info!(user_id = user_id.value(), "Closing push channel, session ended");
                let ended = SyncMessage::Error {
                    message: AuthError::Unauthenticated.to_string(),
                };
                if send(&mut sender, &ended).await.is_ok() {
                    sender.send(Message::Close(None)).await.ok();
                }
                break;
            }
            Step::Close => break,
        }
    }

    if let Some(subscription) = client.subscription {
        state.sync.unsubscribe(subscription).await;
    }
    debug!(user_id = user_id.value(), "Push channel closed");
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &SyncMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode push message");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
