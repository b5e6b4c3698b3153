mod basicauth;

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Basic;
use router_core::prelude::*;
use serde::Serialize;

use crate::config::StatusConfig;
use crate::metrics::PrometheusReporter;
use crate::registry::Registry;
use basicauth::{AuthResult, Credentials, Unauthorized};

/// Flips to "failing" at the start of a drain so upstream load balancers divert new traffic
/// before the proxy listener stops accepting connections, per spec.md §4.5 and §9's
/// "health-degrade before shutdown" design note.
#[derive(Clone, Default)]
pub struct HealthState(Arc<AtomicBool>);

impl HealthState {
	pub fn new() -> Self {
		Self(Arc::new(AtomicBool::new(true)))
	}

	pub fn mark_draining(&self) {
		self.0.store(false, Ordering::SeqCst);
	}

	pub fn is_healthy(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[derive(Clone)]
struct ControlState {
	registry: Arc<Registry>,
	reporter: Arc<PrometheusReporter>,
	health: HealthState,
	routes_creds: Option<Credentials>,
	varz_creds: Option<Credentials>,
}

pub fn router(registry: Arc<Registry>, reporter: Arc<PrometheusReporter>, health: HealthState, status: &StatusConfig) -> Router {
	let status_creds = match (&status.user, &status.pass) {
		(Some(u), Some(p)) => Some(Credentials { user: u.clone(), pass: p.clone() }),
		_ => None,
	};
	let routes_creds = match (&status.user, &status.routes_password) {
		(Some(u), Some(p)) => Some(Credentials { user: u.clone(), pass: p.clone() }),
		_ => status_creds,
	};
	let varz_creds = match (&status.user, &status.pass) {
		(Some(u), Some(p)) => Some(Credentials { user: u.clone(), pass: p.clone() }),
		_ => None,
	};

	let state = ControlState { registry, reporter, health, routes_creds, varz_creds };

	Router::new()
		.route("/health", get(health_handler))
		.route("/healthz", get(health_handler))
		.route("/routes", get(routes_handler))
		.route("/varz", get(varz_handler))
		.with_state(state)
}

async fn health_handler(State(state): State<ControlState>) -> impl IntoResponse {
	if state.health.is_healthy() {
		(axum::http::StatusCode::OK, "ok")
	} else {
		(axum::http::StatusCode::SERVICE_UNAVAILABLE, "draining")
	}
}

async fn routes_handler(
	State(state): State<ControlState>,
	auth: Option<TypedHeader<Authorization<Basic>>>,
) -> axum::response::Response {
	let Some(creds) = &state.routes_creds else {
		return Unauthorized.into_response();
	};
	if matches!(creds.check(auth), AuthResult::Unauthorized) {
		return Unauthorized.into_response();
	}
	Json(state.registry.dump_routes()).into_response()
}

#[derive(Serialize)]
struct Varz {
	num_routes: usize,
	num_endpoints: u64,
	ms_since_last_registry_update: u128,
	metrics_text: String,
}

async fn varz_handler(
	State(state): State<ControlState>,
	auth: Option<TypedHeader<Authorization<Basic>>>,
) -> axum::response::Response {
	let Some(creds) = &state.varz_creds else {
		return Unauthorized.into_response();
	};
	if matches!(creds.check(auth), AuthResult::Unauthorized) {
		return Unauthorized.into_response();
	}
	Json(Varz {
		num_routes: state.registry.num_uris(),
		num_endpoints: state.registry.num_endpoints(),
		ms_since_last_registry_update: state.registry.ms_since_last_update(),
		metrics_text: state.reporter.encode_text(),
	})
	.into_response()
}

#[cfg(test)]
mod tests {
	use axum::body::Body;
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	use super::*;
	use crate::registry::RegistryConfig;

	fn app(status: StatusConfig) -> Router {
		let registry = Arc::new(Registry::new(RegistryConfig::default(), Arc::new(PrometheusReporter::new())));
		router(registry, Arc::new(PrometheusReporter::new()), HealthState::new(), &status)
	}

	fn basic_auth_header(user: &str, pass: &str) -> String {
		format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
	}

	async fn status_of(router: Router, uri: &str, auth: Option<&str>) -> axum::http::StatusCode {
		let mut req = axum::http::Request::builder().uri(uri);
		if let Some(a) = auth {
			req = req.header(axum::http::header::AUTHORIZATION, a);
		}
		let response = router.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
		response.status()
	}

	#[tokio::test]
	async fn health_is_ok_until_marked_draining() {
		let registry = Arc::new(Registry::new(RegistryConfig::default(), Arc::new(PrometheusReporter::new())));
		let health = HealthState::new();
		let router = router(registry, Arc::new(PrometheusReporter::new()), health.clone(), &StatusConfig::default());
		assert_eq!(status_of(router.clone(), "/health", None).await, axum::http::StatusCode::OK);
		health.mark_draining();
		assert_eq!(status_of(router, "/health", None).await, axum::http::StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn routes_requires_auth_when_credentials_are_configured() {
		let status = StatusConfig { user: Some("admin".into()), pass: Some("s3cr3t".into()), ..StatusConfig::default() };
		assert_eq!(status_of(app(status.clone()), "/routes", None).await, axum::http::StatusCode::UNAUTHORIZED);
		assert_eq!(status_of(app(status), "/routes", Some(&basic_auth_header("admin", "s3cr3t"))).await, axum::http::StatusCode::OK);
	}

	#[tokio::test]
	async fn routes_is_open_when_no_credentials_configured() {
		assert_eq!(status_of(app(StatusConfig::default()), "/routes", None).await, axum::http::StatusCode::OK);
	}

	#[tokio::test]
	async fn routes_falls_back_to_status_password_without_a_dedicated_one() {
		let status = StatusConfig { user: Some("admin".into()), pass: Some("s3cr3t".into()), routes_password: None, ..StatusConfig::default() };
		assert_eq!(status_of(app(status), "/routes", Some(&basic_auth_header("admin", "s3cr3t"))).await, axum::http::StatusCode::OK);
	}

	#[tokio::test]
	async fn varz_requires_auth_and_reports_registry_counts() {
		let status = StatusConfig { user: Some("admin".into()), pass: Some("s3cr3t".into()), ..StatusConfig::default() };
		let registry = Arc::new(Registry::new(RegistryConfig::default(), Arc::new(PrometheusReporter::new())));
		let router = router(registry, Arc::new(PrometheusReporter::new()), HealthState::new(), &status);

		assert_eq!(status_of(router.clone(), "/varz", None).await, axum::http::StatusCode::UNAUTHORIZED);

		let req = axum::http::Request::builder()
			.uri("/varz")
			.header(axum::http::header::AUTHORIZATION, basic_auth_header("admin", "s3cr3t"))
			.body(Body::empty())
			.unwrap();
		let response = router.oneshot(req).await.unwrap();
		assert_eq!(response.status(), axum::http::StatusCode::OK);
		let body = response.into_body().collect().await.unwrap().to_bytes();
		let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(parsed["num_routes"], 0);
	}
}
