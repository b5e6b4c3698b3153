use cookie::{Cookie, SameSite};
use http::HeaderMap;
use router_core::prelude::*;

pub const JSESSIONID: &str = "JSESSIONID";
pub const VCAP_ID_COOKIE: &str = "__VCAP_ID__";

/// Parses the inbound `Cookie` header into individual cookies, tolerating a missing header.
fn parse_request_cookies(headers: &HeaderMap) -> Vec<Cookie<'static>> {
	let Some(raw) = headers.get(http::header::COOKIE).and_then(|v| v.to_str().ok()) else {
		return Vec::new();
	};
	raw.split(';').filter_map(|part| Cookie::parse(part.trim().to_string()).ok()).collect()
}

/// Whether the request carries `JSESSIONID` at all, and if so which `private_instance_id`
/// `__VCAP_ID__` names (a stale or absent cookie still counts as "sticky, but unresolved").
pub struct StickyContext {
	pub has_session: bool,
	pub preferred_instance_id: Option<Strng>,
}

pub fn sticky_context(headers: &HeaderMap) -> StickyContext {
	let cookies = parse_request_cookies(headers);
	let has_session = cookies.iter().any(|c| c.name() == JSESSIONID);
	let preferred_instance_id = cookies.iter().find(|c| c.name() == VCAP_ID_COOKIE).map(|c| c.value().to_string().into());
	StickyContext { has_session, preferred_instance_id }
}

/// Attributes copied from the inbound `__VCAP_ID__` cookie (if any) onto the one the router sets
/// on the response, per spec.md §4.3: "matching attributes (Path, Secure when the inbound is TLS,
/// HttpOnly, SameSite from the original cookie)".
#[derive(Debug, Clone, Default)]
pub struct StickyAttrs {
	pub path: Option<String>,
	pub http_only: bool,
	pub same_site: Option<SameSite>,
}

pub fn inbound_sticky_attrs(headers: &HeaderMap) -> StickyAttrs {
	let cookies = parse_request_cookies(headers);
	match cookies.iter().find(|c| c.name() == VCAP_ID_COOKIE) {
		Some(c) => StickyAttrs { path: c.path().map(str::to_string), http_only: c.http_only().unwrap_or(false), same_site: c.same_site() },
		None => StickyAttrs::default(),
	}
}

/// Builds the `Set-Cookie` value for `__VCAP_ID__`, setting `Secure` whenever the inbound
/// connection was TLS regardless of what the original cookie carried.
pub fn build_vcap_id_cookie(instance_id: &str, attrs: &StickyAttrs, inbound_is_tls: bool) -> String {
	let mut cookie = Cookie::new(VCAP_ID_COOKIE, instance_id.to_string());
	cookie.set_path(attrs.path.clone().unwrap_or_else(|| "/".to_string()));
	cookie.set_http_only(attrs.http_only);
	cookie.set_secure(inbound_is_tls);
	if let Some(same_site) = attrs.same_site {
		cookie.set_same_site(same_site);
	}
	cookie.to_string()
}

/// A `Set-Cookie` value that immediately expires `__VCAP_ID__` in the client: there is no
/// endpoint to stick to when a pool is empty, and carrying the stale cookie forward would
/// point at an instance that no longer exists.
pub fn expiring_vcap_id_cookie() -> String {
	let mut cookie = Cookie::new(VCAP_ID_COOKIE, "");
	cookie.set_path("/");
	cookie.set_max_age(cookie::time::Duration::ZERO);
	cookie.to_string()
}
