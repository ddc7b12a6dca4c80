//! Operator dashboard API of the panel
//!
//! Login with the single operator account, then manage nodes and their
//! tunnel specs. Every edit lands in the [`FleetRegistry`], which pushes it to
//! the node over its control session.

pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use fleet_auth::{AdminCredentials, JwtValidator};
use fleet_control::FleetRegistry;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<FleetRegistry>,
    pub credentials: AdminCredentials,
    pub jwt: Arc<JwtValidator>,
    pub token_ttl: chrono::Duration,
    /// PEM of the fleet CA, handed out for node provisioning
    pub ca_pem: String,
}

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleet Panel API",
        version = "0.1.0",
        description = "REST API for managing nodes and their tunnels"
    ),
    paths(
        handlers::login,
        handlers::health_check,
        handlers::get_ca,
        handlers::list_nodes,
        handlers::get_node,
        handlers::delete_node,
        handlers::list_tunnels,
        handlers::put_tunnel,
        handlers::delete_tunnel,
    ),
    components(
        schemas(
            fleet_proto::ProtocolMode,
            fleet_proto::TunnelSpec,
            fleet_proto::TunnelStatus,
            fleet_proto::TunnelHandle,
            fleet_proto::TunnelState,
            fleet_proto::NodeHealth,
            fleet_proto::NodeRecord,
            models::LoginRequest,
            models::LoginResponse,
            models::HealthResponse,
            models::ErrorResponse,
            models::NodeList,
            models::NodeDetail,
            models::TunnelView,
            models::TunnelList,
            models::SetTunnelRequest,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Operator login"),
        (name = "nodes", description = "Node inventory"),
        (name = "tunnels", description = "Desired tunnel configuration per node"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Allow browser origins on localhost (dashboard development)
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let jwt_state = Arc::new(middleware::JwtState::new(self.state.jwt.clone()));

        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/ca", get(handlers::get_ca))
            .route("/api/openapi.json", get(handlers::openapi_json))
            .route("/api/auth/login", post(handlers::login))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route("/api/nodes", get(handlers::list_nodes))
            .route(
                "/api/nodes/{node_id}",
                get(handlers::get_node).delete(handlers::delete_node),
            )
            .route("/api/nodes/{node_id}/tunnels", get(handlers::list_tunnels))
            .route(
                "/api/nodes/{node_id}/tunnels/{tunnel_id}",
                put(handlers::put_tunnel).delete(handlers::delete_tunnel),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                jwt_state,
                middleware::require_auth,
            ));

        let mut router = public_router
            .merge(protected_router)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            use tower_http::cors::AllowOrigin;

            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }));
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Starting API server on {}", listener.local_addr()?);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
