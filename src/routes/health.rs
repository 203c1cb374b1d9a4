//! Health check endpoint
//!
//! `/health` and `/healthz` always answer 200 while the process runs. The body
//! reports `degraded` when the escrow has no master key, since such a node
//! cannot help its peers unlock.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::custodial_keys::KeyRingStatsSnapshot;
use crate::server::AppState;
use crate::types::Result;

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// `online` or `degraded`
    pub status: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub uptime: u64,
    pub timestamp: String,
    pub node_id: String,
    pub escrow: EscrowHealth,
    pub keys: KeyHealth,
}

#[derive(Serialize)]
pub struct EscrowHealth {
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_fingerprint: Option<String>,
    pub entries: usize,
}

#[derive(Serialize)]
pub struct KeyHealth {
    pub private_keys: usize,
    pub unlocked: usize,
    pub cached: usize,
    pub keyring: KeyRingStatsSnapshot,
}

async fn build_health_response(state: &AppState) -> HealthResponse {
    let private_keys = state.custodian.get_loaded_private_keys().await;
    let unlocked = private_keys
        .iter()
        .filter(|k| k.private_key_is_decrypted)
        .count();
    let keyring = state.custodian.keyring();

    let degraded = state.escrow.is_degraded();
    HealthResponse {
        healthy: true,
        status: if degraded { "degraded" } else { "online" },
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        node_id: state.args.node_id.to_string(),
        escrow: EscrowHealth {
            degraded,
            master_fingerprint: state.escrow.master_fingerprint().map(str::to_string),
            entries: state.escrow.len().await,
        },
        keys: KeyHealth {
            private_keys: private_keys.len(),
            unlocked,
            cached: keyring.len().await,
            keyring: keyring.stats(),
        },
    }
}

/// Handle liveness probe (/health, /healthz)
pub async fn health_check(state: &AppState) -> Result<Response<Full<Bytes>>> {
    let response = build_health_response(state).await;
    json_response(StatusCode::OK, &response)
}
