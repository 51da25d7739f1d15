use crate::{
    api::{
        handlers::{actuator, health, login, logout, oidc, saml, validate},
        state::AppState,
    },
    config::ServerConfig,
    tickets::reaper::spawn_reaper,
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request},
    routing::{delete, options, post},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

pub mod handlers;
pub mod session;
pub mod state;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    api_router()
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
/// Routes added in [`app`] (POST variants of GET endpoints, `DELETE` actuator
/// endpoints, `OPTIONS /health`) are not documented.
fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(login::login_page, login::login))
        .routes(routes!(logout::logout))
        .routes(routes!(validate::service_validate))
        .routes(routes!(validate::p3_service_validate))
        .routes(routes!(validate::proxy_validate))
        .routes(routes!(validate::p3_proxy_validate))
        .routes(routes!(validate::validate))
        .routes(routes!(validate::proxy))
        .routes(routes!(oidc::authorize))
        .routes(routes!(oidc::token))
        .routes(routes!(oidc::profile))
        .routes(routes!(oidc::discovery))
        .routes(routes!(oidc::jwks))
        .routes(routes!(saml::sso_redirect))
        .routes(routes!(saml::sso_post))
        .routes(routes!(saml::callback))
        .routes(routes!(saml::metadata))
        .routes(routes!(actuator::ticket_registry))
        .routes(routes!(actuator::ticket_stats))
        .routes(routes!(actuator::sso_sessions))
        .routes(routes!(actuator::expiration_policies))
        .routes(routes!(actuator::registered_services))
        .routes(routes!(actuator::gauth_credentials))
        .routes(routes!(actuator::trusted_devices));

    let tags = [
        ("health", "Liveness and build information"),
        ("cas", "CAS protocol: login, logout and ticket validation"),
        ("oidc", "OAuth2 and OpenID Connect provider"),
        ("saml", "SAML2 identity provider front-channel"),
        ("actuator", "Operational queries over tickets, sessions and MFA records"),
    ]
    .into_iter()
    .map(|(name, description)| {
        let mut tag = Tag::new(name);
        tag.description = Some(description.to_string());
        tag
    })
    .collect();
    router.get_openapi_mut().tags = Some(tags);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    if let Some(start) = author.find('<') {
        let name = author[..start].trim();
        let email = author[start + 1..].trim_end_matches('>').trim();
        let name = if name.is_empty() { None } else { Some(name) };
        let email = if email.is_empty() { None } else { Some(email) };
        (name, email)
    } else {
        let name = author.trim();
        (if name.is_empty() { None } else { Some(name) }, None)
    }
}

/// The complete application: documented routes, their undocumented siblings and the
/// request-id, tracing and CORS layers.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(Any);

    let (router, _openapi) = router().split_for_parts();
    router
        .route("/health", options(health::health))
        .route("/serviceValidate", post(validate::service_validate))
        .route("/p3/serviceValidate", post(validate::p3_service_validate))
        .route("/proxyValidate", post(validate::proxy_validate))
        .route("/p3/proxyValidate", post(validate::p3_proxy_validate))
        .route("/validate", post(validate::validate))
        .route("/logout", post(logout::logout))
        .route("/oidc/profile", post(oidc::profile))
        .route(
            "/actuator/ssoSessions",
            delete(actuator::revoke_sso_sessions),
        )
        .route(
            "/actuator/gauthCredentials",
            delete(actuator::remove_gauth_credentials),
        )
        .route(
            "/actuator/multifactorTrustedDevices",
            delete(actuator::revoke_trusted_devices),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(state)),
        )
}

/// Start the server
/// # Errors
/// Returns an error if the state cannot be built or the server fails to start
pub async fn new(config: ServerConfig) -> Result<()> {
    let port = config.port();
    let reaper_interval = config.reaper_interval();
    if config.actuator_token().is_none() {
        warn!("No actuator token configured, /actuator endpoints are open");
    }

    let state = Arc::new(AppState::from_config(config).await?);
    let reaper = spawn_reaper(state.engine().store().clone(), reaper_interval);

    let app = app(state);

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let method = request.method().as_str();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    info_span!("http.request", method, path, request_id)
}
