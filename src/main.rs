//! `tool-relay` binary: serves the streaming tool-call relay over HTTP.
//!
//! Configuration comes from the `TOOL_RELAY_*` environment variables, log
//! verbosity from `RUST_LOG`.

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tool_relay::{RelayOptions, ToolCallProtocol, ToolRegistry, build_router, tool};

fn builtin_tools() -> ToolRegistry {
    ToolRegistry::new().register(
        tool(
            "current_time",
            "Current time as seconds since the Unix epoch (UTC)",
        )
        .build(|_| async {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| tool_relay::Error::tool(e.to_string()))?;
            Ok(json!({ "unix_seconds": now.as_secs() }))
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let options = RelayOptions::from_env().context("loading configuration")?;
    let registry = Arc::new(builtin_tools());
    let protocol = ToolCallProtocol::from_options(&options, registry.clone())
        .context("building upstream client")?;

    let listener = tokio::net::TcpListener::bind(options.listen_addr())
        .await
        .with_context(|| format!("binding {}", options.listen_addr()))?;

    log::info!(
        "tool-relay listening on {} -> {} (tools: {:?}, max {} rounds)",
        options.listen_addr(),
        options.endpoint(),
        registry.names(),
        options.max_rounds()
    );

    axum::serve(listener, build_router(protocol))
        .await
        .context("server error")?;

    Ok(())
}
