use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    claimflow_observability::init();

    let app = claimflow_api::app::build_app().await?;

    let bind_addr = std::env::var("CLAIMFLOW_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
