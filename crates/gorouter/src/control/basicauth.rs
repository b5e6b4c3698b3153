use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Basic;

/// Minimal HTTP basic auth check for the control surface, per spec.md §4.5: `/routes` and
/// `/varz` require a username/password configured via `status.user`/`status.pass` (or, for
/// `/routes`, the separate `status.routes_password`).
#[derive(Clone)]
pub struct Credentials {
	pub user: String,
	pub pass: String,
}

pub enum AuthResult {
	Ok,
	Unauthorized,
}

impl Credentials {
	pub fn check(&self, header: Option<TypedHeader<Authorization<Basic>>>) -> AuthResult {
		match header {
			Some(TypedHeader(Authorization(basic))) if basic.username() == self.user && basic.password() == self.pass => AuthResult::Ok,
			_ => AuthResult::Unauthorized,
		}
	}
}

pub struct Unauthorized;

impl IntoResponse for Unauthorized {
	fn into_response(self) -> Response {
		(
			StatusCode::UNAUTHORIZED,
			[("WWW-Authenticate", "Basic realm=\"gorouter\"")],
			"authentication required",
		)
			.into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn basic(user: &str, pass: &str) -> TypedHeader<Authorization<Basic>> {
		TypedHeader(Authorization::basic(user, pass))
	}

	#[test]
	fn accepts_matching_credentials() {
		let creds = Credentials { user: "admin".to_string(), pass: "s3cr3t".to_string() };
		assert!(matches!(creds.check(Some(basic("admin", "s3cr3t"))), AuthResult::Ok));
	}

	#[test]
	fn rejects_wrong_password() {
		let creds = Credentials { user: "admin".to_string(), pass: "s3cr3t".to_string() };
		assert!(matches!(creds.check(Some(basic("admin", "wrong"))), AuthResult::Unauthorized));
	}

	#[test]
	fn rejects_missing_header() {
		let creds = Credentials { user: "admin".to_string(), pass: "s3cr3t".to_string() };
		assert!(matches!(creds.check(None), AuthResult::Unauthorized));
	}
}
