use http::StatusCode;

/// Error kinds a client can observe, matching the `X-Cf-RouterError` header value 1:1. Internal
/// causes (connection resets, decode failures) are never leaked beyond this category plus a
/// short plaintext body; the cause itself only goes to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
	#[error("unknown_route")]
	UnknownRoute,
	#[error("no_endpoints")]
	NoEndpoints,
	#[error("endpoint_failure")]
	EndpointFailure { response_started: bool },
	#[error("backend_invalid_tls_cert")]
	BackendInvalidTlsCert { retries_exhausted: bool },
	#[error("Connection Limit Reached")]
	ConnectionLimitReached,
	#[error("invalid_cf_app_instance_header")]
	InvalidCfAppInstanceHeader,
	#[error("route_service_unsupported")]
	RouteServiceUnsupported,
	#[error("route_service_request_expired")]
	RouteServiceRequestExpired,
	#[error("route_service_forwarded_url_mismatch")]
	RouteServiceForwardedUrlMismatch,
	#[error("empty_host")]
	EmptyHost,
}

impl RouterError {
	pub fn status_code(&self) -> StatusCode {
		match self {
			RouterError::UnknownRoute => StatusCode::NOT_FOUND,
			RouterError::NoEndpoints => StatusCode::SERVICE_UNAVAILABLE,
			RouterError::EndpointFailure { response_started: true } => StatusCode::BAD_GATEWAY,
			RouterError::EndpointFailure { response_started: false } => StatusCode::SERVICE_UNAVAILABLE,
			RouterError::BackendInvalidTlsCert { retries_exhausted: true } => StatusCode::SERVICE_UNAVAILABLE,
			RouterError::BackendInvalidTlsCert { retries_exhausted: false } => StatusCode::from_u16(526).unwrap(),
			RouterError::ConnectionLimitReached => StatusCode::SERVICE_UNAVAILABLE,
			RouterError::InvalidCfAppInstanceHeader => StatusCode::BAD_REQUEST,
			RouterError::RouteServiceUnsupported => StatusCode::BAD_GATEWAY,
			RouterError::RouteServiceRequestExpired => StatusCode::BAD_GATEWAY,
			RouterError::RouteServiceForwardedUrlMismatch => StatusCode::BAD_REQUEST,
			RouterError::EmptyHost => StatusCode::BAD_REQUEST,
		}
	}

	/// The value placed in the `X-Cf-RouterError` response header.
	pub fn router_error_header(&self) -> &'static str {
		match self {
			RouterError::UnknownRoute => "unknown_route",
			RouterError::NoEndpoints => "no_endpoints",
			RouterError::EndpointFailure { .. } => "endpoint_failure",
			RouterError::BackendInvalidTlsCert { .. } => "backend_invalid_tls_cert",
			RouterError::ConnectionLimitReached => "Connection Limit Reached",
			RouterError::InvalidCfAppInstanceHeader => "invalid_cf_app_instance_header",
			RouterError::RouteServiceUnsupported => "route_service_unsupported",
			RouterError::RouteServiceRequestExpired => "route_service_request_expired",
			RouterError::RouteServiceForwardedUrlMismatch => "route_service_forwarded_url_mismatch",
			RouterError::EmptyHost => "empty_host",
		}
	}
}
