use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cluster::ManagerRegistry;
use crate::settings::{APP_NAME, APP_VERSION};

pub async fn root() -> &'static str {
    "Welcome to Skein"
}

/// Liveness plus a quorum summary. Losing quorum is advisory, so this
/// always answers 200.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub managers: usize,
    /// Managers that currently lack quorum
    pub without_quorum: Vec<String>,
}

#[instrument(skip(registry), level = "debug")]
pub async fn health(State(registry): State<ManagerRegistry>) -> Json<HealthResponse> {
    let names = registry.names();
    let without_quorum: Vec<String> = names
        .iter()
        .filter(|name| registry.get(name).map_or(false, |manager| !manager.quorum()))
        .cloned()
        .collect();
    let status = if without_quorum.is_empty() { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        managers: names.len(),
        without_quorum,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AboutResponse {
    pub name: String,
    pub version: String,
}

#[instrument]
pub async fn about() -> Json<AboutResponse> {
    Json(AboutResponse {
        name: APP_NAME.to_string(),
        version: APP_VERSION.to_string(),
    })
}
