use anyhow::Context as _;

use jobgate_infra::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;
    jobgate_observability::init(config.log_format);
    config.warn_insecure();

    let app = jobgate_api::app::build_app(&config).context("failed to start job workers")?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
