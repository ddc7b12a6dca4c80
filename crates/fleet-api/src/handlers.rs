use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use fleet_auth::OperatorClaims;
use fleet_control::RegistryError;
use fleet_proto::{TunnelSpec, TunnelState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use utoipa::OpenApi;

use crate::middleware::AuthUser;
use crate::models::*;
use crate::{ApiDoc, AppState};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn registry_error(e: RegistryError) -> ApiError {
    let (status, code) = match &e {
        RegistryError::NodeNotFound(_) => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
        RegistryError::TunnelNotFound { .. } => (StatusCode::NOT_FOUND, "TUNNEL_NOT_FOUND"),
        RegistryError::InvalidSpec(_) => (StatusCode::BAD_REQUEST, "INVALID_SPEC"),
        RegistryError::PortConflict { .. } => (StatusCode::CONFLICT, "PORT_CONFLICT"),
        RegistryError::IdentityMismatch { .. }
        | RegistryError::Persist { .. }
        | RegistryError::Corrupt { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    (status, Json(ErrorResponse::new(e.to_string(), code)))
}

/// Log in with the operator account
#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    debug!("Login attempt for user: {}", req.username);

    let credentials = state.credentials.clone();
    let username = req.username.clone();
    let verified = tokio::task::spawn_blocking(move || {
        credentials.verify(&username, &req.password)
    })
    .await
    .map_err(|e| {
        error!("Password verification task failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Login failed", "INTERNAL_ERROR")),
        )
    })?
    .map_err(|e| {
        error!("Password verification failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Login failed", "INTERNAL_ERROR")),
        )
    })?;

    if !verified {
        warn!("Failed login for user: {}", req.username);
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                "Invalid username or password",
                "INVALID_CREDENTIALS",
            )),
        ));
    }

    let claims = OperatorClaims::new(req.username.clone(), state.token_ttl);
    let token = state.jwt.encode(&claims).map_err(|e| {
        error!("Failed to sign session token: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Login failed", "INTERNAL_ERROR")),
        )
    })?;

    info!("Operator {} logged in", req.username);

    Ok(Json(LoginResponse {
        token,
        token_type: "Bearer".to_string(),
        expires_at: claims.expires_at(),
    }))
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let nodes = state.registry.list_nodes().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        nodes_total: nodes.len(),
        nodes_connected: nodes.iter().filter(|n| n.connected).count(),
    })
}

/// Fleet CA certificate, for provisioning nodes
#[utoipa::path(
    get,
    path = "/api/ca",
    params(
        ("download" = Option<bool>, Query, description = "Serve as a file attachment")
    ),
    responses(
        (status = 200, description = "PEM-encoded CA certificate", content_type = "application/x-pem-file", body = String)
    ),
    tag = "system"
)]
pub async fn get_ca(State(state): State<Arc<AppState>>, Query(query): Query<CaQuery>) -> Response {
    let mut response = (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        state.ca_pem.clone(),
    )
        .into_response();

    if query.download {
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_static("attachment; filename=\"fleet-ca.pem\""),
        );
    }
    response
}

/// OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// List all known nodes
#[utoipa::path(
    get,
    path = "/api/nodes",
    responses(
        (status = 200, description = "List of nodes", body = NodeList),
        (status = 401, description = "Not authenticated", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "nodes"
)]
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<NodeList> {
    debug!(operator = %user.username, "Listing nodes");

    let nodes = state.registry.list_nodes().await;
    let total = nodes.len();
    Json(NodeList { nodes, total })
}

/// Get a node with its desired configuration
#[utoipa::path(
    get,
    path = "/api/nodes/{node_id}",
    params(
        ("node_id" = String, Path, description = "Node ID (certificate common name)")
    ),
    responses(
        (status = 200, description = "Node information", body = NodeDetail),
        (status = 404, description = "Node not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "nodes"
)]
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeDetail>, ApiError> {
    let node = state.registry.get_node(&node_id).await.map_err(registry_error)?;
    let (_, desired) = state.registry.desired(&node_id).await.map_err(registry_error)?;
    Ok(Json(NodeDetail { node, desired }))
}

/// Forget a node; its open session is closed
#[utoipa::path(
    delete,
    path = "/api/nodes/{node_id}",
    params(
        ("node_id" = String, Path, description = "Node ID (certificate common name)")
    ),
    responses(
        (status = 204, description = "Node removed"),
        (status = 404, description = "Node not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "nodes"
)]
pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove_node(&node_id).await.map_err(registry_error)?;
    info!(operator = %user.username, node_id = %node_id, "Node removed");
    Ok(StatusCode::NO_CONTENT)
}

fn merge_tunnels(desired: Vec<TunnelSpec>, observed: Vec<TunnelState>) -> Vec<TunnelView> {
    let mut views: BTreeMap<String, TunnelView> = desired
        .into_iter()
        .map(|spec| {
            (
                spec.tunnel_id.clone(),
                TunnelView {
                    tunnel_id: spec.tunnel_id.clone(),
                    spec: Some(spec),
                    state: None,
                    in_sync: false,
                },
            )
        })
        .collect();

    for state in observed {
        let tunnel_id = state.tunnel_id.clone();
        views
            .entry(tunnel_id.clone())
            .or_insert_with(|| TunnelView {
                tunnel_id,
                spec: None,
                state: None,
                in_sync: false,
            })
            .state = Some(state);
    }

    views
        .into_values()
        .map(|mut view| {
            view.in_sync = match (&view.spec, &view.state) {
                (Some(spec), Some(state)) => state.applied_version >= spec.version,
                _ => false,
            };
            view
        })
        .collect()
}

/// Desired and observed tunnels of a node
#[utoipa::path(
    get,
    path = "/api/nodes/{node_id}/tunnels",
    params(
        ("node_id" = String, Path, description = "Node ID (certificate common name)")
    ),
    responses(
        (status = 200, description = "Tunnels of the node", body = TunnelList),
        (status = 404, description = "Node not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "tunnels"
)]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Result<Json<TunnelList>, ApiError> {
    let node = state.registry.get_node(&node_id).await.map_err(registry_error)?;
    let (generation, desired) = state.registry.desired(&node_id).await.map_err(registry_error)?;

    let tunnels = merge_tunnels(desired, node.tunnels);
    let total = tunnels.len();
    Ok(Json(TunnelList {
        node_id,
        generation,
        reported_generation: node.reported_generation,
        tunnels,
        total,
    }))
}

/// Create or replace a tunnel spec
#[utoipa::path(
    put,
    path = "/api/nodes/{node_id}/tunnels/{tunnel_id}",
    params(
        ("node_id" = String, Path, description = "Node ID (certificate common name)"),
        ("tunnel_id" = String, Path, description = "Tunnel ID")
    ),
    request_body = SetTunnelRequest,
    responses(
        (status = 200, description = "Spec stored and pushed to the node", body = TunnelSpec),
        (status = 400, description = "Invalid spec", body = ErrorResponse),
        (status = 404, description = "Node not found", body = ErrorResponse),
        (status = 409, description = "Port already used by another tunnel", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "tunnels"
)]
pub async fn put_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((node_id, tunnel_id)): Path<(String, String)>,
    Json(req): Json<SetTunnelRequest>,
) -> Result<Json<TunnelSpec>, ApiError> {
    let spec = TunnelSpec {
        tunnel_id,
        node_id: node_id.clone(),
        local_port: req.local_port,
        remote_target: req.remote_target,
        mode: req.mode,
        enabled: req.enabled,
        version: 0,
    };

    let stored = state
        .registry
        .set_spec(&node_id, spec)
        .await
        .map_err(registry_error)?;

    debug!(
        operator = %user.username,
        node_id = %node_id,
        tunnel_id = %stored.tunnel_id,
        "Tunnel spec saved"
    );
    Ok(Json(stored))
}

/// Delete a tunnel spec; the node tears the tunnel down
#[utoipa::path(
    delete,
    path = "/api/nodes/{node_id}/tunnels/{tunnel_id}",
    params(
        ("node_id" = String, Path, description = "Node ID (certificate common name)"),
        ("tunnel_id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 204, description = "Spec deleted"),
        (status = 404, description = "Node or tunnel not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "tunnels"
)]
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path((node_id, tunnel_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .remove_spec(&node_id, &tunnel_id)
        .await
        .map_err(registry_error)?;
    Ok(StatusCode::NO_CONTENT)
}
