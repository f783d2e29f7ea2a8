use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use varnika_core::{image_to_base64_png, GenerationRequest, ModelLike};

pub const STATUS_MESSAGE: &str = "Varnika AI Backend Running with Stable Diffusion";

#[derive(Serialize, Deserialize, Debug)]
pub struct GenerationResponse {
    pub image_base64: String,
}

// Application state containing the preloaded model.
pub struct AppState {
    model: Arc<dyn ModelLike>,
    // One generation at a time on the compute device. The guard travels into
    // the blocking task so a dropped request cannot release it early.
    generation_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(model: Arc<dyn ModelLike>) -> Self {
        Self {
            model,
            generation_lock: Arc::new(Mutex::new(())),
        }
    }
}

async fn status_handler() -> impl IntoResponse {
    Json(json!({ "message": STATUS_MESSAGE }))
}

// The CORS layer answers OPTIONS itself; this keeps the route explicit.
async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    match generate_image(req, &state).await {
        Ok(image_base64) => Json(GenerationResponse { image_base64 }).into_response(),
        Err(e) => {
            tracing::error!("Error generating image: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// Runs the preloaded model on the blocking pool and returns the image as base64 PNG.
async fn generate_image(params: GenerationRequest, state: &AppState) -> Result<String> {
    let guard = Arc::clone(&state.generation_lock).lock_owned().await;
    let model = Arc::clone(&state.model);
    tracing::info!(model = model.name(), prompt = %params.prompt, "Generating image");

    let start = Instant::now();
    let image = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        model.run(params)
    })
    .await??;
    let encoded = image_to_base64_png(&image)?;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Image generated"
    );
    Ok(encoded)
}

/// Builds the router with permissive CORS: any origin, method and header, with credentials.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route(
            "/generate",
            post(generate_image_handler).options(preflight_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}
