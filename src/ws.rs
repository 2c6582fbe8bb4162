//! Component H: the websocket session core (spec §4.H), built on
//! `axum::extract::ws`. A session runs an open-handler, then a message
//! loop of decode -> resolve action -> per-action auth -> parameter
//! binding -> invoke -> optional encode+send, then a close-handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use serde_json::Value;

use crate::auth::AuthChecker;
use meshgate_core::prelude::*;

/// One inbound websocket frame, decoded to the `{action, payload}` envelope
/// every session speaks.
#[derive(Debug, serde::Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub token: Option<String>,
}

/// Runs once when a connection is accepted, before the message loop starts
/// (spec §3 lifecycle, §4.H step 1). Its return value is the session: it is
/// passed by value into every action invocation for the life of the
/// connection and handed to the close handler on exit.
#[async_trait]
pub trait WsOpenHandler: Send + Sync {
    async fn open(&self) -> Value;
}

/// Runs once the message loop exits, consuming the final session value
/// (spec §3 lifecycle, §4.H step 3).
#[async_trait]
pub trait WsCloseHandler: Send + Sync {
    async fn close(&self, session: Value);
}

#[async_trait]
pub trait WsAction: Send + Sync {
    /// Auth level required to invoke this action. 0 means unrestricted.
    fn required_level(&self) -> u32 {
        0
    }

    async fn invoke(&self, session: &Value, payload: Value) -> Result<Option<Value>, WsError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("forbidden: action requires level {required}")]
    Forbidden { required: u32 },
    #[error("handler error: {0}")]
    Handler(String),
}

/// Rejection payload sent back to the client when an action's auth check
/// fails, instead of the session being dropped silently.
#[derive(Debug, Serialize)]
struct Rejection {
    error: String,
}

pub struct WsSessionRegistry {
    actions: HashMap<String, Arc<dyn WsAction>>,
    auth: Arc<dyn AuthChecker>,
    open_handler: Option<Arc<dyn WsOpenHandler>>,
    close_handler: Option<Arc<dyn WsCloseHandler>>,
}

impl WsSessionRegistry {
    pub fn new(auth: Arc<dyn AuthChecker>) -> Self {
        Self {
            actions: HashMap::new(),
            auth,
            open_handler: None,
            close_handler: None,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn WsAction>) {
        self.actions.insert(name.into(), action);
    }

    pub fn with_open_handler(mut self, handler: Arc<dyn WsOpenHandler>) -> Self {
        self.open_handler = Some(handler);
        self
    }

    pub fn with_close_handler(mut self, handler: Arc<dyn WsCloseHandler>) -> Self {
        self.close_handler = Some(handler);
        self
    }

    /// Drive one websocket connection to completion: open, message loop,
    /// close (spec §4.H). The open handler's return value is the session,
    /// threaded by value into every action invocation and finally consumed
    /// by the close handler. `session_id` is used by the dispatcher's
    /// live-session tracking for graceful shutdown.
    pub async fn run(&self, mut socket: WebSocket, session_id: String) {
        let session = match &self.open_handler {
            Some(handler) => handler.open().await,
            None => Value::Null,
        };
        debug!(session_id, "websocket session opened");

        while let Some(Ok(message)) = socket.recv().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
            };
            match self.handle_frame(&text, &session).await {
                Ok(Some(reply)) => {
                    let _ = socket.send(Message::Text(reply.to_string().into())).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(session_id, error = %err, "WSREJECT");
                    let rejection = serde_json::to_string(&Rejection {
                        error: err.to_string(),
                    })
                    .unwrap();
                    let _ = socket.send(Message::Text(rejection.into())).await;
                }
            }
        }

        if let Some(handler) = &self.close_handler {
            handler.close(session).await;
        }
        debug!(session_id, "websocket session closed");
    }

    /// Resolve `action_name`, falling back to the default action registered
    /// under `""` when no exact match exists (spec §4.H step c).
    fn resolve_action(&self, action_name: &str) -> Option<&Arc<dyn WsAction>> {
        self.actions
            .get(action_name)
            .or_else(|| self.actions.get(""))
    }

    async fn handle_frame(&self, text: &str, session: &Value) -> Result<Option<Value>, WsError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| WsError::Malformed(e.to_string()))?;
        let action = self
            .resolve_action(&envelope.action)
            .ok_or_else(|| WsError::UnknownAction(envelope.action.clone()))?;
        if !self.auth.allows(envelope.token.as_deref(), action.required_level()) {
            return Err(WsError::Forbidden {
                required: action.required_level(),
            });
        }
        action
            .invoke(session, envelope.payload)
            .await
            .map_err(|e| WsError::Handler(e.to_string()))
    }
}
