//! Cluster status and administration endpoints
use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::auth_error;
use crate::cluster::{AdminAction, AdminRequest, Manager, ManagerRegistry, NodeReport};
use crate::error::{Result, SkeinError};

/// Envelope of every successful response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiMessage<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiMessage<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManagerList {
    pub managers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeList {
    pub manager: String,
    pub quorum: bool,
    pub nodes: Vec<NodeReport>,
}

fn find_manager(registry: &ManagerRegistry, name: &str) -> Result<Manager> {
    registry
        .get(name)
        .ok_or_else(|| SkeinError::NodeNotFound(format!("no cluster manager named {}", name)))
}

/// Names of every registered cluster manager
#[instrument(skip(registry), level = "debug")]
pub async fn list_managers(State(registry): State<ManagerRegistry>) -> Json<ApiMessage<ManagerList>> {
    ApiMessage::ok(ManagerList {
        managers: registry.names(),
    })
}

/// Every configured peer of one manager, overlaid with live connection data
#[instrument(skip(registry), level = "debug")]
pub async fn list_nodes(
    State(registry): State<ManagerRegistry>,
    Path(manager): Path<String>,
) -> Result<Json<ApiMessage<NodeList>>> {
    let manager = find_manager(&registry, &manager)?;
    Ok(ApiMessage::ok(NodeList {
        manager: manager.name().to_string(),
        quorum: manager.quorum(),
        nodes: manager.node_reports(),
    }))
}

/// Ask a manager to act on one of its connections. Requires the manager's
/// shared secret as a bearer token.
#[instrument(skip(registry, headers), level = "info")]
pub async fn admin(
    State(registry): State<ManagerRegistry>,
    Path((manager, action, node)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage<AdminRequest>>> {
    let manager = find_manager(&registry, &manager)?;

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| auth_error!("missing bearer token"))?;
    if !manager.verify_secret(token) {
        return Err(auth_error!("invalid bearer token"));
    }

    let action: AdminAction = action.parse()?;
    let request = AdminRequest {
        action,
        node: node.into(),
    };
    manager.admin_request(request.clone())?;
    Ok(ApiMessage::ok(request))
}
