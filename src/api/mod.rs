use crate::{
    api::handlers::health,
    biometric::{
        BiometricConfig, BiometricService, custody::KeyCustody, store::CredentialStore,
    },
    email::LogEmailSender,
    notify::LogPushNotifier,
    otp::{OtpService, crypto::OtpHasher, models::OtpConfig},
    sweep,
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::options,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer,
    timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Server tunables assembled from CLI flags.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    biometric: BiometricConfig,
    otp: OtpConfig,
    request_timeout: Duration,
    sweep_interval: Duration,
}

impl ApiConfig {
    #[must_use]
    pub fn new(biometric: BiometricConfig, otp: OtpConfig) -> Self {
        Self {
            biometric,
            otp,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn biometric(&self) -> &BiometricConfig {
        &self.biometric
    }

    #[must_use]
    pub fn otp(&self) -> &OtpConfig {
        &self.otp
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// Assemble the full application: documented routes, Swagger UI and the
/// middleware stack. Dropping a timed-out handler rolls back its transaction.
#[must_use]
pub fn app(
    pool: PgPool,
    biometric: BiometricService,
    otp: OtpService,
    request_timeout: Duration,
) -> Router {
    let (router, openapi) = router().split_for_parts();
    router
        .route("/health", options(health::health))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi))
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
                .layer(TimeoutLayer::new(request_timeout))
                .layer(Extension(biometric))
                .layer(Extension(otp))
                .layer(Extension(pool)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to connect to the database or to start the server
pub async fn new(
    port: u16,
    dsn: &str,
    config: ApiConfig,
    custody: Arc<dyn KeyCustody>,
    otp_hasher: OtpHasher,
    mut shutdown: mpsc::UnboundedReceiver<()>,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;

    let biometric = BiometricService::new(
        pool.clone(),
        CredentialStore::new(custody),
        config.biometric(),
        Arc::new(LogPushNotifier),
    );
    let otp = OtpService::new(
        pool.clone(),
        otp_hasher,
        *config.otp(),
        biometric.ledger(),
        Arc::new(LogEmailSender),
    );

    // Expired OTP challenges and audit rows past retention are purged in the background.
    let sweeper = sweep::spawn_reconciliation(pool.clone(), config.sweep_interval());

    let app = app(pool, biometric, otp, config.request_timeout());

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                Some(()) = shutdown.recv() => info!("Vault token renewal stopped"),
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            }
            info!("Gracefully shutdown");
        })
        .await?;

    sweeper.abort();

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
