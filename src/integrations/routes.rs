//! HTTP 接口（axum）
//!
//! - GET  /health                健康检查：渠道连通性、生成后端、活跃会话数
//! - GET  /connection            连接状态与配对凭据
//! - POST /connection/restart    放弃重连后手动重启
//! - POST /send                  运维单发消息
//! - GET  /sessions              会话摘要列表
//! - GET  /sessions/:identity    导出单个会话（不存在返回 404，不会创建）
//! - DELETE /sessions/:identity  清除会话
//! - GET/POST /webhook           WhatsApp Webhook 验证与消息接收

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::channel::{ChannelConnector, ChannelError};
use super::whatsapp::{format_phone_number, WebhookPayload, WebhookVerifyQuery};
use crate::dialogue::DialogueController;

/// 路由共享状态
pub struct AppState {
    pub controller: Arc<DialogueController>,
    pub channel: Arc<dyn ChannelConnector>,
    pub verify_token: String,
    pub default_country_code: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        controller: Arc<DialogueController>,
        channel: Arc<dyn ChannelConnector>,
        verify_token: impl Into<String>,
        default_country_code: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            channel,
            verify_token: verify_token.into(),
            default_country_code: default_country_code.into(),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub phone: Option<String>,
    pub message: Option<String>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/connection", get(connection))
        .route("/connection/restart", post(restart_connection))
        .route("/send", post(send_message))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:identity", get(dump_session).delete(clear_session))
        .route("/webhook", get(webhook_verify).post(webhook_receive))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = state.controller.store();
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "provider": state.controller.router().info(),
        "channel": {
            "name": state.channel.name(),
            "state": state.channel.state(),
            "connected": state.channel.is_connected(),
        },
        "activeSessions": store.active_count().await,
    }))
}

async fn connection(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.channel.state(),
        "connected": state.channel.is_connected(),
        "pairing": state.channel.pairing_artifact(),
    }))
}

async fn restart_connection(State(state): State<Arc<AppState>>) -> Response {
    if state.channel.restart() {
        (StatusCode::ACCEPTED, Json(json!({ "restarting": true }))).into_response()
    } else {
        error_response(StatusCode::CONFLICT, "Channel does not support restart")
    }
}

async fn send_message(State(state): State<Arc<AppState>>, Json(req): Json<SendRequest>) -> Response {
    let phone = req.phone.filter(|p| !p.trim().is_empty());
    let message = req.message.filter(|m| !m.trim().is_empty());
    let (Some(phone), Some(message)) = (phone, message) else {
        return error_response(StatusCode::BAD_REQUEST, "Phone and message are required");
    };
    let Some(to) = format_phone_number(&phone, &state.default_country_code) else {
        return error_response(StatusCode::BAD_REQUEST, format!("Invalid phone number: {}", phone));
    };

    match state.channel.send(&to, &message).await {
        Ok(()) => Json(json!({ "success": true, "to": to })).into_response(),
        Err(e) => {
            tracing::error!(to = %to, error = %e, "Manual send failed");
            let status = match e {
                ChannelError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
                ChannelError::InvalidRecipient(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(status, e.to_string())
        }
    }
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    Json(state.controller.store().list().await).into_response()
}

async fn dump_session(State(state): State<Arc<AppState>>, Path(identity): Path<String>) -> Response {
    match state.controller.store().peek(&identity).await {
        Some(session) => Json(session).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

async fn clear_session(State(state): State<Arc<AppState>>, Path(identity): Path<String>) -> Response {
    if state.controller.store().remove(&identity).await {
        Json(json!({ "removed": true })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "Session not found")
    }
}

/// GET /webhook - Meta 验证 Webhook
async fn webhook_verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, StatusCode> {
    query.verify(&state.verify_token).ok_or(StatusCode::FORBIDDEN)
}

/// POST /webhook - 立即确认，同一 payload 内的消息在后台按顺序处理
async fn webhook_receive(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    let turns = payload.into_turns();
    if turns.is_empty() {
        return StatusCode::OK;
    }

    tokio::spawn(async move {
        for turn in turns {
            let identity = turn.identity.clone();
            tracing::info!(identity = %identity, "Message received");
            let reply = state.controller.handle_turn(turn).await;
            if let Err(e) = state.channel.send(&identity, &reply.text).await {
                tracing::error!(identity = %identity, error = %e, "Failed to send WhatsApp message");
            }
        }
    });

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::config::ClinicSection;
    use crate::dialogue::{InboundTurn, PromptTemplates};
    use crate::integrations::connection::ConnectionState;
    use crate::llm::GenerationRouter;
    use crate::session::SessionStore;

    struct RecordingChannel {
        sent: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl ChannelConnector for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn send(&self, identity: &str, text: &str) -> Result<(), ChannelError> {
            let _ = self.sent.send((identity.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn app() -> (Router, Arc<AppState>, mpsc::UnboundedReceiver<(String, String)>) {
        let clinic = ClinicSection::default();
        let llm = crate::config::LlmSection {
            provider: "mock".into(),
            ..Default::default()
        };
        let controller = Arc::new(DialogueController::new(
            Arc::new(SessionStore::new(20, Duration::from_secs(3600))),
            Arc::new(GenerationRouter::from_config(&llm).unwrap()),
            Arc::new(PromptTemplates::builtin(&clinic)),
            &clinic,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AppState::new(
            controller,
            Arc::new(RecordingChannel { sent: tx }),
            "clinic",
            "55",
        ));
        (create_router(state.clone()), state, rx)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_channel_and_sessions() {
        let (app, state, _rx) = app();
        state.controller.store().get("5511").await;

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["channel"]["connected"], true);
        assert_eq!(body["provider"]["provider"], "mock");
        assert_eq!(body["activeSessions"], 1);
    }

    #[tokio::test]
    async fn test_send_requires_phone_and_message() {
        let (app, _state, mut rx) = app();

        let resp = app
            .clone()
            .oneshot(post_json("/send", json!({ "phone": "11999998888" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(post_json("/send", json!({ "phone": "(11) 99999-8888", "message": "Lembrete" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            rx.recv().await,
            Some(("5511999998888".to_string(), "Lembrete".to_string()))
        );
    }

    #[tokio::test]
    async fn test_session_dump_and_clear() {
        let (app, state, _rx) = app();

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/sessions/5511").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        // 导出接口不会顺带创建会话
        assert_eq!(state.controller.store().active_count().await, 0);

        state
            .controller
            .handle_turn(InboundTurn::new("5511", "Olá"))
            .await;

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/sessions/5511").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["identity"], "5511");
        assert_eq!(body["stage"], "greeting");
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body[0]["messagesCount"], 2);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/sessions/5511")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.controller.store().peek("5511").await.is_none());
    }

    #[tokio::test]
    async fn test_webhook_verify() {
        let (app, _state, _rx) = app();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=clinic&hub.challenge=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"42");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_webhook_message_gets_reply() {
        let (app, state, mut rx) = app();
        let payload = json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": {
                "contacts": [{ "profile": { "name": "Ana" }, "wa_id": "5511988887777" }],
                "messages": [{ "from": "5511988887777", "type": "text", "text": { "body": "quero agendar" } }]
            }}]}]
        });

        let resp = app.oneshot(post_json("/webhook", payload)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let (to, text) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(to, "5511988887777");
        assert!(text.contains("quero agendar"));

        let session = state.controller.store().peek("5511988887777").await.unwrap();
        assert_eq!(session.profile().name.as_deref(), Some("Ana"));
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_unsupported_channel() {
        let (app, _state, _rx) = app();
        let resp = app
            .oneshot(post_json("/connection/restart", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
