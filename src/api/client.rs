use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::models::ChatMessage;
use crate::signaling::{SignalData, SignalingTransport};

use super::{ChatBackend, SessionType, StreamingBackend};

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    model_id: &'a str,
    session_type: SessionType,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct SignalRequest<'a> {
    session_id: &'a str,
    signal_type: &'static str,
    signal_data: &'a SignalData,
    target_user_id: &'a str,
}

#[derive(Deserialize)]
struct SignalsResponse {
    #[serde(default)]
    signals: Vec<StoredSignal>,
}

#[derive(Deserialize)]
struct StoredSignal {
    signal_data: serde_json::Value,
    #[serde(default)]
    from_user_id: Option<String>,
}

/// REST client for the streaming, signaling and chat endpoints.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base: String,
    token: String,
}

impl BackendClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base: config.api_base(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl StreamingBackend for BackendClient {
    async fn create_session(&self, model_id: &str, session_type: SessionType) -> Result<String, ApiError> {
        let req = self
            .http
            .post(self.url("/streaming/session"))
            .json(&CreateSessionRequest { model_id, session_type });
        let created: CreateSessionResponse = self.execute(req).await?.json().await?;
        debug!("Backend issued session {} for model {}", created.session_id, model_id);
        Ok(created.session_id)
    }

    async fn end_session(&self, session_id: &str) -> Result<(), ApiError> {
        let req = self.http.delete(self.url(&format!("/streaming/session/{}", session_id)));
        self.execute(req).await?;
        Ok(())
    }

    async fn update_model_status(&self, is_live: bool, is_available: bool) -> Result<(), ApiError> {
        let req = self
            .http
            .patch(self.url("/streaming/models/status"))
            .query(&[("is_live", is_live), ("is_available", is_available)]);
        self.execute(req).await?;
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for BackendClient {
    async fn send(&self, session_id: &str, target_id: &str, message: &SignalData) -> Result<(), ApiError> {
        let req = self.http.post(self.url("/streaming/webrtc/signal")).json(&SignalRequest {
            session_id,
            signal_type: message.payload.kind(),
            signal_data: message,
            target_user_id: target_id,
        });
        self.execute(req).await?;
        Ok(())
    }

    async fn receive(&self, session_id: &str) -> Result<Vec<SignalData>, ApiError> {
        let req = self
            .http
            .get(self.url(&format!("/streaming/webrtc/signals/{}", session_id)));
        let body: SignalsResponse = self.execute(req).await?.json().await?;

        let mut signals = Vec::with_capacity(body.signals.len());
        for stored in body.signals {
            match serde_json::from_value::<SignalData>(stored.signal_data) {
                Ok(mut signal) => {
                    if signal.session_id.is_empty() {
                        signal.session_id = session_id.to_string();
                    }
                    if signal.sender_id.is_empty() {
                        if let Some(from) = stored.from_user_id {
                            signal.sender_id = from;
                        }
                    }
                    signals.push(signal);
                }
                Err(e) => warn!("Dropping malformed signal in session {}: {}", session_id, e),
            }
        }
        Ok(signals)
    }
}

#[async_trait]
impl ChatBackend for BackendClient {
    async fn chat_history(
        &self,
        room_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let mut req = self
            .http
            .get(self.url(&format!("/chat/rooms/{}/messages", room_id)))
            .query(&[("limit", limit)]);
        if let Some(before) = before {
            req = req.query(&[("before", before.to_rfc3339())]);
        }
        let messages: Vec<ChatMessage> = self.execute(req).await?.json().await?;
        Ok(messages.into_iter().filter(|m| !m.is_deleted).collect())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        let req = self.http.delete(self.url(&format!("/chat/messages/{}", message_id)));
        self.execute(req).await?;
        Ok(())
    }
}
