use http::{HeaderMap, HeaderName, HeaderValue};
use router_core::prelude::*;
use uuid::Uuid;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_VCAP_REQUEST_ID: HeaderName = HeaderName::from_static("x-vcap-request-id");
pub const X_B3_TRACE_ID: HeaderName = HeaderName::from_static("x-b3-traceid");
pub const X_B3_SPAN_ID: HeaderName = HeaderName::from_static("x-b3-spanid");
pub const X_CF_APPLICATION_ID: HeaderName = HeaderName::from_static("x-cf-applicationid");
pub const X_CF_INSTANCE_ID: HeaderName = HeaderName::from_static("x-cf-instanceid");
pub const X_CF_APP_INSTANCE: HeaderName = HeaderName::from_static("x-cf-app-instance");
pub const X_CF_ROUTER_ERROR: HeaderName = HeaderName::from_static("x-cf-routererror");
pub const X_VCAP_TRACE: HeaderName = HeaderName::from_static("x-vcap-trace");
pub const X_VCAP_ROUTER: HeaderName = HeaderName::from_static("x-vcap-router");
pub const X_VCAP_BACKEND: HeaderName = HeaderName::from_static("x-vcap-backend");
pub const X_CF_ROUTE_ENDPOINT: HeaderName = HeaderName::from_static("x-cf-routeendpoint");
pub const VIA_PRODUCT: &str = "gorouter";

/// Hop-by-hop headers stripped in both directions; `Upgrade` is kept separately when the
/// request is actually being upgraded, per spec.md §4.4 step 3.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "te", "trailer", "transfer-encoding", "upgrade"];

pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
	for name in HOP_BY_HOP {
		if keep_upgrade && *name == "upgrade" {
			continue;
		}
		headers.remove(*name);
	}
	let proxy_headers: Vec<HeaderName> = headers
		.keys()
		.filter(|h| h.as_str().starts_with("proxy-"))
		.cloned()
		.collect();
	for h in proxy_headers {
		headers.remove(h);
	}
}

/// Appends `peer_ip` to any existing `X-Forwarded-For` chain.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer_ip: std::net::IpAddr) {
	let appended = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) if !existing.is_empty() => format!("{existing}, {peer_ip}"),
		_ => peer_ip.to_string(),
	};
	if let Ok(v) = HeaderValue::from_str(&appended) {
		headers.insert(X_FORWARDED_FOR.clone(), v);
	}
}

/// Scheme precedence per spec.md §4.4 step 3: forced HTTPS, then sanitized-to-inbound-scheme,
/// then trust-client-if-present, then fall back to the inbound connection's scheme.
pub fn set_forwarded_proto(headers: &mut HeaderMap, inbound_is_tls: bool, force_https: bool, sanitize: bool) {
	let scheme = if force_https {
		"https"
	} else if sanitize {
		if inbound_is_tls { "https" } else { "http" }
	} else if headers.contains_key(&X_FORWARDED_PROTO) {
		return;
	} else if inbound_is_tls {
		"https"
	} else {
		"http"
	};
	headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static(scheme));
}

pub fn set_forwarded_host(headers: &mut HeaderMap, inbound_host: &str) {
	if let Ok(v) = HeaderValue::from_str(inbound_host) {
		headers.insert(X_FORWARDED_HOST.clone(), v);
	}
}

/// Ensures `X-Vcap-Request-Id` is present and a well-formed UUID, generating one otherwise.
pub fn ensure_request_id(headers: &mut HeaderMap) -> Uuid {
	if let Some(existing) = headers.get(&X_VCAP_REQUEST_ID).and_then(|v| v.to_str().ok())
		&& let Ok(id) = Uuid::parse_str(existing)
	{
		return id;
	}
	let id = Uuid::new_v4();
	headers.insert(X_VCAP_REQUEST_ID.clone(), HeaderValue::from_str(&id.to_string()).expect("uuid is valid header value"));
	id
}

/// Generates a 16-byte B3 trace id if missing, and a fresh 8-byte span id unconditionally,
/// per spec.md §4.4 step 3 (gorouter does not implement full B3 span-parent chaining).
pub fn ensure_b3_trace(headers: &mut HeaderMap) {
	if !headers.contains_key(&X_B3_TRACE_ID) {
		let trace_id: [u8; 16] = rand::random();
		headers.insert(X_B3_TRACE_ID.clone(), HeaderValue::from_str(&hex::encode(trace_id)).expect("hex is valid header value"));
	}
	let span_id: [u8; 8] = rand::random();
	headers.insert(X_B3_SPAN_ID.clone(), HeaderValue::from_str(&hex::encode(span_id)).expect("hex is valid header value"));
}

pub fn set_cf_identity(headers: &mut HeaderMap, app_id: &Strng, instance_id: &Strng) {
	if let Ok(v) = HeaderValue::from_str(app_id) {
		headers.insert(X_CF_APPLICATION_ID.clone(), v);
	}
	if let Ok(v) = HeaderValue::from_str(instance_id) {
		headers.insert(X_CF_INSTANCE_ID.clone(), v);
	}
}

pub fn append_via(headers: &mut HeaderMap) {
	let value = match headers.get(http::header::VIA).and_then(|v| v.to_str().ok()) {
		Some(existing) if !existing.is_empty() => format!("{existing}, 1.1 {VIA_PRODUCT}"),
		_ => format!("1.1 {VIA_PRODUCT}"),
	};
	if let Ok(v) = HeaderValue::from_str(&value) {
		headers.insert(http::header::VIA, v);
	}
}

/// Sets the trace-exposure headers gated on `X-Vcap-Trace` matching the configured secret.
pub fn set_trace_headers(headers: &mut HeaderMap, router_id: &str, backend_addr: &str) {
	if let Ok(v) = HeaderValue::from_str(router_id) {
		headers.insert(X_VCAP_ROUTER.clone(), v);
	}
	if let Ok(v) = HeaderValue::from_str(backend_addr) {
		headers.insert(X_VCAP_BACKEND.clone(), v.clone());
		headers.insert(X_CF_ROUTE_ENDPOINT.clone(), v);
	}
}

pub fn trace_requested(headers: &HeaderMap, trace_key: Option<&str>) -> bool {
	match trace_key {
		Some(key) => headers.get(&X_VCAP_TRACE).and_then(|v| v.to_str().ok()) == Some(key),
		None => false,
	}
}

/// An `Upgrade` request iff `Connection` contains the token "upgrade" (case-insensitive) and
/// `Upgrade` names a known protocol.
pub fn requested_upgrade(headers: &HeaderMap) -> Option<String> {
	let connection_has_upgrade = headers
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
		.unwrap_or(false);
	if !connection_has_upgrade {
		return None;
	}
	let upgrade = headers.get(http::header::UPGRADE).and_then(|v| v.to_str().ok())?;
	let lower = upgrade.to_ascii_lowercase();
	if lower == "websocket" || lower == "tcp" { Some(lower) } else { None }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn header_map(pairs: &[(HeaderName, &str)]) -> HeaderMap {
		let mut h = HeaderMap::new();
		for (k, v) in pairs {
			h.insert(k.clone(), HeaderValue::from_str(v).unwrap());
		}
		h
	}

	#[test]
	fn strip_hop_by_hop_removes_connection_and_proxy_headers() {
		let mut h = header_map(&[
			(http::header::CONNECTION, "keep-alive"),
			(HeaderName::from_static("keep-alive"), "timeout=5"),
			(HeaderName::from_static("proxy-authorization"), "secret"),
			(http::header::HOST, "api.example.com"),
		]);
		strip_hop_by_hop(&mut h, false);
		assert!(!h.contains_key(http::header::CONNECTION));
		assert!(!h.contains_key("keep-alive"));
		assert!(!h.contains_key("proxy-authorization"));
		assert!(h.contains_key(http::header::HOST));
	}

	#[test]
	fn strip_hop_by_hop_preserves_upgrade_when_requested() {
		let mut h = header_map(&[(http::header::UPGRADE, "websocket")]);
		strip_hop_by_hop(&mut h, true);
		assert!(h.contains_key(http::header::UPGRADE));
		let mut h2 = header_map(&[(http::header::UPGRADE, "websocket")]);
		strip_hop_by_hop(&mut h2, false);
		assert!(!h2.contains_key(http::header::UPGRADE));
	}

	#[test]
	fn append_forwarded_for_chains_existing_value() {
		let mut h = header_map(&[(X_FORWARDED_FOR, "1.2.3.4")]);
		append_forwarded_for(&mut h, "5.6.7.8".parse().unwrap());
		assert_eq!(h.get(&X_FORWARDED_FOR).unwrap(), "1.2.3.4, 5.6.7.8");
	}

	#[test]
	fn append_forwarded_for_starts_chain_when_absent() {
		let mut h = HeaderMap::new();
		append_forwarded_for(&mut h, "5.6.7.8".parse().unwrap());
		assert_eq!(h.get(&X_FORWARDED_FOR).unwrap(), "5.6.7.8");
	}

	#[test]
	fn set_forwarded_proto_precedence() {
		let mut forced = HeaderMap::new();
		set_forwarded_proto(&mut forced, false, true, false);
		assert_eq!(forced.get(&X_FORWARDED_PROTO).unwrap(), "https");

		let mut sanitized = header_map(&[(X_FORWARDED_PROTO, "https")]);
		set_forwarded_proto(&mut sanitized, false, false, true);
		assert_eq!(sanitized.get(&X_FORWARDED_PROTO).unwrap(), "http");

		let mut trusted = header_map(&[(X_FORWARDED_PROTO, "https")]);
		set_forwarded_proto(&mut trusted, false, false, false);
		assert_eq!(trusted.get(&X_FORWARDED_PROTO).unwrap(), "https", "client-supplied value is trusted when not sanitizing");

		let mut fallback = HeaderMap::new();
		set_forwarded_proto(&mut fallback, true, false, false);
		assert_eq!(fallback.get(&X_FORWARDED_PROTO).unwrap(), "https");
	}

	#[test]
	fn ensure_request_id_preserves_valid_uuid() {
		let id = Uuid::new_v4();
		let mut h = header_map(&[(X_VCAP_REQUEST_ID, &id.to_string())]);
		let got = ensure_request_id(&mut h);
		assert_eq!(got, id);
	}

	#[test]
	fn ensure_request_id_replaces_malformed_value() {
		let mut h = header_map(&[(X_VCAP_REQUEST_ID, "not-a-uuid")]);
		let got = ensure_request_id(&mut h);
		assert_eq!(h.get(&X_VCAP_REQUEST_ID).unwrap(), got.to_string().as_str());
	}

	#[test]
	fn ensure_b3_trace_preserves_existing_trace_id_but_refreshes_span() {
		let mut h = header_map(&[(X_B3_TRACE_ID, "abcdef0123456789abcdef0123456789"), (X_B3_SPAN_ID, "0000000000000000")]);
		ensure_b3_trace(&mut h);
		assert_eq!(h.get(&X_B3_TRACE_ID).unwrap(), "abcdef0123456789abcdef0123456789");
		assert_ne!(h.get(&X_B3_SPAN_ID).unwrap(), "0000000000000000");
	}

	#[test]
	fn append_via_chains_existing_value() {
		let mut h = header_map(&[(http::header::VIA, "1.1 upstream")]);
		append_via(&mut h);
		assert_eq!(h.get(http::header::VIA).unwrap(), "1.1 upstream, 1.1 gorouter");
	}

	#[test]
	fn trace_requested_matches_configured_key() {
		let h = header_map(&[(X_VCAP_TRACE, "secret")]);
		assert!(trace_requested(&h, Some("secret")));
		assert!(!trace_requested(&h, Some("other")));
		assert!(!trace_requested(&h, None));
	}

	#[test]
	fn requested_upgrade_requires_both_headers() {
		let h = header_map(&[(http::header::CONNECTION, "Upgrade"), (http::header::UPGRADE, "websocket")]);
		assert_eq!(requested_upgrade(&h), Some("websocket".to_string()));

		let missing_connection = header_map(&[(http::header::UPGRADE, "websocket")]);
		assert_eq!(requested_upgrade(&missing_connection), None);

		let unknown_protocol = header_map(&[(http::header::CONNECTION, "upgrade"), (http::header::UPGRADE, "h2c")]);
		assert_eq!(requested_upgrade(&unknown_protocol), None);
	}
}
