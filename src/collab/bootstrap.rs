//! Gateway bootstrap source
//!
//! Fetches the recommended shard count and session start limit from
//! `GET /gateway/bot`.

use crate::error::ClusterError;
use crate::protocol::{GatewayBootstrap, SessionStartLimit};
use tracing::info;
use twilight_http::Client;

/// Query the bootstrap endpoint with the bot token
pub async fn fetch_bootstrap(token: &str) -> Result<GatewayBootstrap, ClusterError> {
    let client = Client::new(token.to_string());

    let info = client
        .gateway()
        .authed()
        .await
        .map_err(|e| ClusterError::Bootstrap(Box::new(e)))?
        .model()
        .await
        .map_err(|e| ClusterError::Bootstrap(Box::new(e)))?;

    let limit = info.session_start_limit;
    let bootstrap = GatewayBootstrap {
        url: info.url,
        shards: info.shards as u32,
        session_start_limit: SessionStartLimit {
            total: limit.total as u32,
            remaining: limit.remaining as u32,
            reset_after: limit.reset_after as u64,
            max_concurrency: limit.max_concurrency as u32,
        },
    };

    info!(
        shards = bootstrap.shards,
        remaining = bootstrap.session_start_limit.remaining,
        max_concurrency = bootstrap.session_start_limit.max_concurrency,
        "Fetched gateway bootstrap"
    );

    Ok(bootstrap)
}

/// Bootstrap for a fixed shard count, when the endpoint is not consulted
pub fn static_bootstrap(shards: u32, max_concurrency: u32) -> GatewayBootstrap {
    GatewayBootstrap {
        url: "wss://gateway.discord.gg".to_string(),
        shards,
        session_start_limit: SessionStartLimit {
            total: 1000,
            remaining: 1000,
            reset_after: 0,
            max_concurrency: max_concurrency.max(1),
        },
    }
}
