//! Client for the remote natural language understanding service.

use crate::config_loader::{self, Settings};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use uuid::Uuid;

pub const NOT_CONFIGURED: &str = "NLU server not configured.";
pub const CONNECT_FAILED: &str = "Failed to connect. Check server status and settings.";
pub const DEFAULT_ACTION: &str = "chat";
pub const DEFAULT_SPOKEN: &str = "I'm not sure.";

/// Body of `POST <base>/chat`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NluRequest {
    #[serde(rename = "message")]
    pub text: String,
    #[serde(rename = "user_id")]
    pub session_id: Uuid,
}

/// What the service wants done
#[derive(Debug, Clone, PartialEq)]
pub struct NluResponse {
    pub action: String,
    pub parameters: Map<String, Value>,
    pub spoken_response: String,
}

impl NluResponse {
    /// A plain chat reply with no parameters
    pub fn chat(spoken: impl Into<String>) -> Self {
        Self {
            action: DEFAULT_ACTION.to_string(),
            parameters: Map::new(),
            spoken_response: spoken.into(),
        }
    }

    /// Parameter as text. Numbers are formatted, blanks count as missing.
    pub fn param(&self, key: &str) -> Option<String> {
        let value = match self.parameters.get(key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!value.is_empty()).then_some(value)
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    action: Option<String>,
    parameters: Option<Value>,
    spoken_response: Option<String>,
}

impl From<WireResponse> for NluResponse {
    fn from(wire: WireResponse) -> Self {
        Self {
            action: wire.action.unwrap_or_else(|| DEFAULT_ACTION.to_string()),
            parameters: match wire.parameters {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            },
            spoken_response: wire
                .spoken_response
                .unwrap_or_else(|| DEFAULT_SPOKEN.to_string()),
        }
    }
}

impl NluResponse {
    /// Decode a `/chat` response body, filling in defaults for missing fields
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str::<WireResponse>(body)?.into())
    }
}

/// The network hop to the NLU service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NluTransport: Send + Sync {
    async fn chat(
        &self,
        endpoint: &str,
        request: &NluRequest,
        timeout: Duration,
    ) -> Result<NluResponse>;

    async fn reset(&self, endpoint: &str, session_id: Uuid, timeout: Duration) -> Result<()>;
}

/// JSON over HTTP with reqwest
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl NluTransport for HttpTransport {
    async fn chat(
        &self,
        endpoint: &str,
        request: &NluRequest,
        timeout: Duration,
    ) -> Result<NluResponse> {
        let wire: WireResponse = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(wire.into())
    }

    async fn reset(&self, endpoint: &str, session_id: Uuid, timeout: Duration) -> Result<()> {
        self.client
            .post(endpoint)
            .timeout(timeout)
            .json(&json!({ "user_id": session_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Where the base URL comes from; read on every request
pub type UrlSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct Cortex {
    transport: Arc<dyn NluTransport>,
    url: UrlSource,
    session_id: Uuid,
    chat_timeout: Duration,
    reset_timeout: Duration,
}

impl Cortex {
    pub fn new(
        transport: Arc<dyn NluTransport>,
        url: UrlSource,
        chat_timeout: Duration,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            url,
            session_id: Uuid::new_v4(),
            chat_timeout,
            reset_timeout,
        }
    }

    /// HTTP client following the global settings' active backend
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(HttpTransport::new()),
            Arc::new(config_loader::current_nlu_url),
            Duration::from_secs(settings.nlu_timeout_secs),
            Duration::from_secs(settings.reset_timeout_secs),
        )
    }

    /// Fixed base URL, mostly for tests and one-shot commands
    pub fn with_url(url: impl Into<String>, chat_timeout: Duration) -> Self {
        let url = url.into();
        Self::new(
            Arc::new(HttpTransport::new()),
            Arc::new(move || Some(url.clone())),
            chat_timeout,
            Duration::from_secs(10),
        )
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// `(chat, reset)` endpoints, or `None` without a usable `http(s)` base.
    pub fn endpoints(&self) -> Option<(String, String)> {
        let base = (self.url)()?;
        let base = base.trim().trim_end_matches('/');
        if !base.starts_with("http") {
            return None;
        }
        Some((format!("{}/chat", base), format!("{}/reset", base)))
    }

    /// Send `text` and hand the reply to `callback` from a spawned task.
    ///
    /// `callback` runs exactly once. Failures are folded into a chat reply.
    pub fn send<F>(&self, text: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(NluResponse) + Send + 'static,
    {
        let endpoints = self.endpoints();
        let transport = self.transport.clone();
        let timeout = self.chat_timeout;
        let request = NluRequest {
            text: text.to_string(),
            session_id: self.session_id,
        };

        task::spawn(async move {
            let response = match endpoints {
                None => {
                    tracing::warn!("no NLU server configured");
                    NluResponse::chat(NOT_CONFIGURED)
                }
                Some((chat, _)) => {
                    tracing::debug!(endpoint = %chat, "querying NLU");
                    match transport.chat(&chat, &request, timeout).await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::error!(error = %e, "NLU request failed");
                            NluResponse::chat(CONNECT_FAILED)
                        }
                    }
                }
            };
            callback(response);
        })
    }

    /// [`send`](Self::send), awaited
    pub async fn ask(&self, text: &str) -> NluResponse {
        let (tx, rx) = oneshot::channel();
        self.send(text, move |response| {
            let _ = tx.send(response);
        });
        rx.await.unwrap_or_else(|_| NluResponse::chat(CONNECT_FAILED))
    }

    /// Clear the server-side conversation in the background
    pub fn reset_history(&self) {
        let cortex = self.clone();
        task::spawn(async move {
            if let Err(e) = cortex.reset_now().await {
                tracing::warn!(error = %e, "failed to reset NLU history");
            }
        });
    }

    pub async fn reset_now(&self) -> Result<()> {
        let (_, reset) = self
            .endpoints()
            .ok_or_else(|| Error::NetworkFailure(NOT_CONFIGURED.to_string()))?;
        self.transport
            .reset(&reset, self.session_id, self.reset_timeout)
            .await?;
        tracing::info!(session = %self.session_id, "NLU history reset");
        Ok(())
    }
}
