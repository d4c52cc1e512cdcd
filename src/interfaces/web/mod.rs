mod handlers;
mod router;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::core::diagnostics::Diagnostics;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) diagnostics: Arc<Diagnostics>,
}

/// Serve the report API until the process is stopped.
pub async fn serve(diagnostics: Diagnostics, host: &str, port: u16) -> Result<()> {
    let state = AppState {
        diagnostics: Arc::new(diagnostics),
    };
    let app = router::build_api_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let local = listener.local_addr().context("reading bound address")?;
    info!("API Server running at http://{local}");
    axum::serve(listener, app).await.context("API server crashed")?;
    Ok(())
}
