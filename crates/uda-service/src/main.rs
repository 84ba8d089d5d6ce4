#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uda_domain::AnswerPayload;
use uda_runtime::{init_logging, Assistant, Settings};

#[derive(Clone)]
struct ServiceState {
    assistant: Arc<Assistant>,
    operation_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "uda-service")]
#[command(about = "HTTP service for the Universal Data Assistant")]
struct Args {
    /// Listen address; defaults to `API_HOST:API_PORT`.
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    /// Point after which a run started now must not commit side effects.
    fn deadline(&self) -> Instant {
        Instant::now() + self.operation_timeout
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    /// Runs `op` on the blocking pool, bounded by the operation timeout.
    ///
    /// A timeout only stops the wait: the blocking task keeps running to
    /// completion. Operations with side effects must check
    /// [`ServiceState::deadline`] themselves.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Assistant>) -> anyhow::Result<T> + Send + 'static,
    {
        let assistant = Arc::clone(&self.assistant);
        let handle = tokio::task::spawn_blocking(move || op(assistant));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        op_result.map_err(|err| {
            let diagnostic = format!("{err:#}");
            error!(operation = operation_label, error = %diagnostic, "operation failed");
            Self::failure(default_status, default_code, err.to_string(), None)
        })
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env()?;
    init_logging(&settings.log_filter, settings.log_format);

    let assistant = Assistant::from_settings(&settings)?;
    let state = ServiceState {
        assistant: Arc::new(assistant),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
    };
    let bind = match args.bind {
        Some(bind) => bind.to_string(),
        None => settings.bind_address(),
    };
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "uda service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<ServiceState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<AnswerPayload>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| ServiceState::invalid_json(&rejection))?;
    let deadline = state.deadline();
    let answer = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pipeline_failed",
            "chat",
            move |assistant| assistant.ask_until(&request.message, Some(deadline)),
        )
        .await?;
    Ok(Json(answer))
}
