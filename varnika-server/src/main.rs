use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use std::sync::Arc;
use tokio::{self, net::TcpListener, signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use varnika_core::{load_model, DeviceMap, LoadOptions, ModelLike};
use varnika_server::{build_router, AppState};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Varnika image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "VARNIKA_CPU")]
    cpu: bool,

    /// Hugging Face repository of the diffusion pipeline
    #[arg(
        long,
        env = "VARNIKA_MODEL",
        default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5"
    )]
    model: String,

    /// Host address to bind the server to
    #[arg(long, env = "VARNIKA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "VARNIKA_PORT", default_value_t = 8000)]
    port: u16,

    /// Use flash attention in the UNet (requires the `flash-attn` feature)
    #[arg(long)]
    use_flash_attn: bool,

    /// Attention slice size, trades speed for memory
    #[arg(long)]
    sliced_attention_size: Option<usize>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "VARNIKA_LOG", default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    // --- Load the model once at startup ---
    let options = LoadOptions {
        use_flash_attn: args.use_flash_attn,
        sliced_attention_size: args.sliced_attention_size,
    };
    let model = load_model(
        &args.model,
        Api::new()?,
        DeviceMap::from_cpu_flag(args.cpu),
        options,
    )
    .await
    .with_context(|| format!("failed to load model {}", args.model))?;
    tracing::info!(model = model.name(), "Model loaded successfully");

    let app = build_router(Arc::new(AppState::new(model)));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
