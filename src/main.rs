//! qwen-gate - HTTP server entry point.

use qwen_gate::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_filter = if std::env::var("DEBUG_LOG")
        .map(|v| matches!(v.trim(), "1" | "true" | "on"))
        .unwrap_or(false)
    {
        "qwen_gate=debug,tower_http=debug"
    } else {
        "qwen_gate=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        default_model = %config.default_model,
        "Configuration loaded"
    );

    api::serve(config).await?;

    Ok(())
}
