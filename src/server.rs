use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::cache::{digest_key, TtlCache};
use crate::config::AppConfig;
use crate::error::AskError;
use crate::models::{AskRequest, AskResponse, HealthResponse};
use crate::prompt::{validate_context, validate_question};
use crate::providers::{configured_providers, AnswerClient, AnswerProvider};

#[derive(Clone)]
pub struct AppState {
    answers: AnswerClient,
    provider: AnswerProvider,
    config: Arc<AppConfig>,
    cache: Arc<TtlCache<String, AskResponse>>,
}

impl AppState {
    pub fn new(config: AppConfig, answers: AnswerClient) -> Self {
        let provider = AnswerProvider::from_config(&config);
        let cache = TtlCache::new(
            config.answer.cache_capacity,
            chrono::Duration::seconds(config.answer.cache_ttl_secs),
        );
        Self {
            answers,
            provider,
            config: Arc::new(config),
            cache: Arc::new(cache),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ask", post(ask_handler))
        .route("/api/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: AppConfig) -> Result<()> {
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let state = AppState::new(config, AnswerClient::new()?);
    tracing::info!(provider = state.provider.name(), "answering provider selected");
    let app = router(state);

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ask_handler(
    State(state): State<AppState>,
    request: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, ApiError> {
    let Json(request) =
        request.map_err(|rejection| AskError::Validation(rejection.body_text()))?;

    let (Some(context), Some(question)) = (request.context, request.question) else {
        let missing = "`context` and `question` are required".to_string();
        return Err(AskError::Validation(missing).into());
    };
    validate_context(&context)?;
    let question = validate_question(&question)?;

    let key = digest_key(&context, question);
    if let Some(cached) = state.cache.get(&key) {
        tracing::debug!("answer served from cache");
        return Ok(Json(cached));
    }

    let response = state
        .answers
        .answer(&state.provider, &context, question, request.model.as_deref())
        .await?;
    state.cache.insert(key, response.clone());
    Ok(Json(response))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_provider: state.provider.name().to_string(),
        providers: configured_providers(&state.config),
    })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<AskError> for ApiError {
    fn from(value: AskError) -> Self {
        let status = StatusCode::from_u16(value.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!("ask failed: {value}");
        }
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::prompt::{MAX_QUESTION_CHARS, REFUSAL_SENTENCE};
    use crate::providers::LOCAL_LABEL;

    fn app() -> Router {
        router(AppState::new(
            AppConfig::default(),
            AnswerClient::new().expect("client"),
        ))
    }

    async fn post_ask(app: Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::post("/api/ask")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn ask_answers_with_local_responder() {
        let (status, body) = post_ask(
            app(),
            serde_json::json!({
                "context": "Primary excerpt (highlighted):\nOsmosis moves water across membranes.",
                "question": "What does osmosis move?"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "local");
        assert!(body["answer"].as_str().is_some_and(|a| a.starts_with(LOCAL_LABEL)));
    }

    #[tokio::test]
    async fn empty_context_is_allowed() {
        let (status, body) = post_ask(
            app(),
            serde_json::json!({ "context": "", "question": "Anything?" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], REFUSAL_SENTENCE);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let (status, body) = post_ask(app(), serde_json::json!({ "context": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = post_ask(
            app(),
            serde_json::json!({ "context": "x", "question": "q".repeat(MAX_QUESTION_CHARS + 1) }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::post("/api/ask")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_providers() {
        let request = Request::get("/api/health").body(Body::empty()).expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let health: HealthResponse = serde_json::from_slice(&bytes).expect("health");
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_provider, "local");
        assert_eq!(health.providers.len(), 5);
    }

    #[tokio::test]
    async fn repeated_request_hits_cache() {
        let state = AppState::new(AppConfig::default(), AnswerClient::new().expect("client"));
        let app = router(state.clone());
        let body = serde_json::json!({
            "context": "Ions carry charge.",
            "question": "What carries charge?"
        });

        let (_, first) = post_ask(app.clone(), body.clone()).await;
        assert_eq!(state.cache.len(), 1);
        let (_, second) = post_ask(app, body).await;
        assert_eq!(first, second);
        assert_eq!(state.cache.len(), 1);
    }
}
