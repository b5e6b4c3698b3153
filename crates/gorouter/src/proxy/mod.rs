pub mod balance;
pub mod body;
pub mod headers;
pub mod instance;
pub mod routeservice;
pub mod sticky;
pub mod upgrade;

use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use router_core::prelude::*;

use self::body::{BoxBody, empty_body, from_incoming, full_body, plain_text};
use crate::errors::RouterError;
use crate::metrics::{Reporter, RouterEvent};
use crate::registry::Registry;
use crate::transport::Transport;
use crate::types::Endpoint;

/// Total endpoints tried for one client request, including the first attempt, per spec.md
/// §4.4 step 5.
const MAX_ENDPOINT_ATTEMPTS: usize = 3;

pub struct ProxyConfig {
	pub router_id: Strng,
	pub healthcheck_user_agent: String,
	pub force_forwarded_proto_https: bool,
	pub sanitize_forwarded_proto: bool,
	pub trace_key: Option<String>,
	pub availability_zone: Option<Strng>,
	pub balancing_algorithm_az_preference: bool,
	pub endpoint_timeout: Duration,
	pub route_service_timeout: Duration,
	pub route_service_recommend_https: bool,
}

/// One endpoint pick. `retryable` is false for a request pinned by `X-CF-App-Instance` or an
/// existing sticky session: those target exactly one instance, and there is nothing else
/// correct to fail over to.
struct Selected {
	endpoint: Arc<Endpoint>,
	route_service_url: Option<Strng>,
	retryable: bool,
}

enum RouteServiceDecision {
	None,
	RedirectToRouteService { url: Strng, headers_for_rs: HeaderMap },
	VerifiedReplay,
}

enum ConnectOutcome {
	Retryable(RouterError, Incoming),
	Terminal(RouterError),
}

/// `send_once` always reports a TLS SAN mismatch as non-final (`retries_exhausted: false`); this
/// flips it to final once `proxy_to_backend` has decided there is no endpoint left to retry
/// against, per spec.md §4.4 step 5 and the §7 error table's 526-then-503 escalation.
fn exhaust(reason: RouterError) -> RouterError {
	match reason {
		RouterError::BackendInvalidTlsCert { .. } => RouterError::BackendInvalidTlsCert { retries_exhausted: true },
		other => other,
	}
}

/// Connects lookup, transport, header rewriting, retry and upgrade handling, per spec.md §4.4.
pub struct ProxyHandler {
	registry: Arc<Registry>,
	transport: Arc<Transport>,
	reporter: Arc<dyn Reporter>,
	in_flight: balance::InFlightTracker,
	route_service_crypto: Option<Arc<routeservice::RouteServiceCrypto>>,
	cfg: ProxyConfig,
}

impl ProxyHandler {
	pub fn new(
		registry: Arc<Registry>,
		transport: Arc<Transport>,
		reporter: Arc<dyn Reporter>,
		route_service_crypto: Option<Arc<routeservice::RouteServiceCrypto>>,
		cfg: ProxyConfig,
	) -> Self {
		Self { registry, transport, reporter, in_flight: balance::InFlightTracker::new(), route_service_crypto, cfg }
	}

	/// Entry point for one inbound request. Never panics on a bad request: every failure mode
	/// is turned into a response so the connection can keep serving the next request.
	pub async fn handle(&self, req: Request<Incoming>, peer_addr: SocketAddr, inbound_is_tls: bool) -> Response<BoxBody> {
		let start = Instant::now();
		let outcome = self.handle_inner(req, peer_addr.ip(), inbound_is_tls).await;
		let (response, component) = match outcome {
			Ok(pair) => pair,
			Err(err) => (self.error_response(err), None),
		};
		self
			.reporter
			.observe(RouterEvent::RequestCompleted { status: response.status().as_u16(), component, latency: start.elapsed() });
		response
	}

	fn error_response(&self, err: RouterError) -> Response<BoxBody> {
		Response::builder()
			.status(err.status_code())
			.header(headers::X_CF_ROUTER_ERROR, HeaderValue::from_static(err.router_error_header()))
			.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(full_body(Bytes::from(err.to_string())))
			.unwrap_or_else(|_| plain_text(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
	}

	async fn handle_inner(&self, mut req: Request<Incoming>, peer_ip: IpAddr, inbound_is_tls: bool) -> Result<(Response<BoxBody>, Option<Strng>), RouterError> {
		if req.version() != Version::HTTP_10 && req.version() != Version::HTTP_11 {
			return Ok((plain_text(StatusCode::BAD_REQUEST, "HTTP/2 is not accepted on the inbound listener"), None));
		}
		if is_health_probe(req.headers(), &self.cfg.healthcheck_user_agent) {
			return Ok((plain_text(StatusCode::OK, "ok"), None));
		}

		let host = extract_host(req.headers(), req.uri())?;
		let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());
		let host_and_path = format!("{host}{path_and_query}");

		let app_instance_header = req.headers().get(&headers::X_CF_APP_INSTANCE).and_then(|v| v.to_str().ok()).map(str::to_string);
		let sticky_ctx = sticky::sticky_context(req.headers());
		let upgrade_requested = headers::requested_upgrade(req.headers());
		let original_url = reconstruct_original_url(req.uri(), &host, inbound_is_tls, self.cfg.route_service_recommend_https);

		let selected = match self.select_endpoint(&host_and_path, app_instance_header.as_deref(), sticky_ctx.preferred_instance_id.as_deref(), &[]) {
			Ok(selected) => selected,
			Err(RouterError::NoEndpoints) if sticky_ctx.has_session => {
				let mut response = self.error_response(RouterError::NoEndpoints);
				if let Ok(v) = HeaderValue::from_str(&sticky::expiring_vcap_id_cookie()) {
					response.headers_mut().append(http::header::SET_COOKIE, v);
				}
				return Ok((response, None));
			},
			Err(e) => return Err(e),
		};
		let component = selected.endpoint.component().map(Strng::from);

		let client_upgrade = upgrade_requested.as_ref().map(|_| hyper::upgrade::on(&mut req));

		let (parts, body) = req.into_parts();
		let mut out_headers = parts.headers;
		rewrite_request_headers(
			&mut out_headers,
			peer_ip,
			inbound_is_tls,
			self.cfg.force_forwarded_proto_https,
			self.cfg.sanitize_forwarded_proto,
			&host,
			&selected.endpoint,
			upgrade_requested.is_some(),
		);
		let want_trace = headers::trace_requested(&out_headers, self.cfg.trace_key.as_deref());

		let route_decision = self.resolve_route_service(&out_headers, &selected, &original_url)?;

		let (mut response, served_by) = match route_decision {
			RouteServiceDecision::None | RouteServiceDecision::VerifiedReplay => {
				self.proxy_to_backend(&host_and_path, selected, parts.method, parts.uri, out_headers.clone(), body, client_upgrade).await?
			},
			RouteServiceDecision::RedirectToRouteService { url, headers_for_rs } => {
				let endpoint = selected.endpoint.clone();
				let resp = self.proxy_to_route_service(&url, parts.method, headers_for_rs, body).await?;
				(resp, endpoint)
			},
		};

		if response.status() != StatusCode::SWITCHING_PROTOCOLS {
			rewrite_response_headers(response.headers_mut(), want_trace, &self.cfg.router_id, &served_by);
			if sticky_ctx.has_session {
				let attrs = sticky::inbound_sticky_attrs(&out_headers);
				if let Ok(v) = HeaderValue::from_str(&sticky::build_vcap_id_cookie(&served_by.private_instance_id, &attrs, inbound_is_tls)) {
					response.headers_mut().append(http::header::SET_COOKIE, v);
				}
			}
		}

		Ok((response, component))
	}

	/// Picks one endpoint for the request, honoring `X-CF-App-Instance` pinning and sticky
	/// sessions before falling back to the load-balancing algorithm, per spec.md §4.3.
	fn select_endpoint(&self, host_and_path: &str, app_instance_header: Option<&str>, sticky_preferred: Option<&str>, exclude: &[Arc<Endpoint>]) -> Result<Selected, RouterError> {
		if let Some(raw) = app_instance_header {
			let parsed = instance::parse(raw).ok_or(RouterError::InvalidCfAppInstanceHeader)?;
			let endpoint = self
				.registry
				.lookup_with_app_instance(host_and_path, &parsed.app_id, parsed.index)
				.ok_or(RouterError::UnknownRoute)?;
			let route_service_url = endpoint.route_service_url.clone();
			return Ok(Selected { endpoint, route_service_url, retryable: false });
		}

		if let Some(id) = sticky_preferred {
			let pinned = self.registry.lookup(host_and_path, |pool| pool.find_by_private_instance_id(id).cloned());
			if let Some(endpoint) = pinned {
				let route_service_url = endpoint.route_service_url.clone();
				return Ok(Selected { endpoint, route_service_url, retryable: false });
			}
		}

		enum PoolOutcome {
			Empty,
			Found { endpoint: Arc<Endpoint>, route_service_url: Option<Strng> },
		}

		let az = self.cfg.availability_zone.clone();
		let az_pref = self.cfg.balancing_algorithm_az_preference;
		let in_flight = &self.in_flight;

		let outcome = self.registry.lookup(host_and_path, |pool| {
			if pool.is_empty() {
				return Some(PoolOutcome::Empty);
			}
			match balance::pick_endpoint(pool, exclude, az.as_deref(), az_pref, in_flight) {
				Some(endpoint) => Some(PoolOutcome::Found { route_service_url: pool.route_service_url.clone(), endpoint }),
				None => Some(PoolOutcome::Empty),
			}
		});

		match outcome {
			None => Err(RouterError::UnknownRoute),
			Some(PoolOutcome::Empty) => Err(RouterError::NoEndpoints),
			Some(PoolOutcome::Found { endpoint, route_service_url }) => Ok(Selected { endpoint, route_service_url, retryable: true }),
		}
	}

	/// Decides whether this request should be redirected to a route service, is itself a
	/// verified replay from one, or proceeds straight to the backend, per spec.md §4.4 step 4.
	fn resolve_route_service(&self, headers: &HeaderMap, selected: &Selected, original_url: &str) -> Result<RouteServiceDecision, RouterError> {
		let Some(route_service_url) = &selected.route_service_url else {
			return Ok(RouteServiceDecision::None);
		};

		let forwarded_url_header = HeaderName::from_static(routeservice::X_CF_FORWARDED_URL);
		let signature_header = HeaderName::from_static(routeservice::X_CF_PROXY_SIGNATURE);
		let metadata_header = HeaderName::from_static(routeservice::X_CF_PROXY_METADATA);

		let carries_signature = headers.contains_key(&forwarded_url_header) && headers.contains_key(&signature_header) && headers.contains_key(&metadata_header);

		if carries_signature {
			let crypto = self.route_service_crypto.as_ref().ok_or(RouterError::RouteServiceUnsupported)?;
			let signature = headers.get(&signature_header).and_then(|v| v.to_str().ok()).unwrap_or_default();
			let metadata = headers.get(&metadata_header).and_then(|v| v.to_str().ok()).unwrap_or_default();
			let forwarded_url = headers.get(&forwarded_url_header).and_then(|v| v.to_str().ok()).unwrap_or_default();

			let payload = crypto.verify(signature, metadata).map_err(|_| RouterError::RouteServiceForwardedUrlMismatch)?;
			if routeservice::is_expired(payload.timestamp, self.cfg.route_service_timeout) {
				return Err(RouterError::RouteServiceRequestExpired);
			}
			if payload.forwarded_url != forwarded_url || forwarded_url != original_url {
				return Err(RouterError::RouteServiceForwardedUrlMismatch);
			}
			return Ok(RouteServiceDecision::VerifiedReplay);
		}

		let crypto = self.route_service_crypto.as_ref().ok_or(RouterError::RouteServiceUnsupported)?;
		let (signature, metadata) = crypto.sign(original_url).map_err(|_| RouterError::RouteServiceUnsupported)?;

		let mut headers_for_rs = headers.clone();
		if let Ok(v) = HeaderValue::from_str(original_url) {
			headers_for_rs.insert(forwarded_url_header, v);
		}
		if let Ok(v) = HeaderValue::from_str(&signature) {
			headers_for_rs.insert(signature_header, v);
		}
		if let Ok(v) = HeaderValue::from_str(&metadata) {
			headers_for_rs.insert(metadata_header, v);
		}
		headers::strip_hop_by_hop(&mut headers_for_rs, false);

		Ok(RouteServiceDecision::RedirectToRouteService { url: route_service_url.clone(), headers_for_rs })
	}

	/// Sends the request to the selected endpoint, retrying against up to
	/// `MAX_ENDPOINT_ATTEMPTS` distinct endpoints in the same pool when the pick allows it.
	async fn proxy_to_backend(
		&self,
		host_and_path: &str,
		mut selected: Selected,
		method: Method,
		uri: Uri,
		headers: HeaderMap,
		body: Incoming,
		client_upgrade: Option<hyper::upgrade::OnUpgrade>,
	) -> Result<(Response<BoxBody>, Arc<Endpoint>), RouterError> {
		let mut failed: Vec<Arc<Endpoint>> = Vec::new();
		let mut attempts = 0usize;
		let mut last_reason = RouterError::EndpointFailure { response_started: false };
		let mut body = Some(body);
		let mut client_upgrade = client_upgrade;

		loop {
			attempts += 1;
			let endpoint = selected.endpoint.clone();

			let Some(lease) = self.transport.try_acquire(&endpoint) else {
				last_reason = RouterError::ConnectionLimitReached;
				failed.push(endpoint);
				if !selected.retryable || attempts >= MAX_ENDPOINT_ATTEMPTS {
					return Err(last_reason);
				}
				match self.reselect(host_and_path, &failed)? {
					Some(endpoint) => {
						selected.endpoint = endpoint;
						continue;
					},
					None => return Err(last_reason),
				}
			};

			match self.send_once(&endpoint, &method, &uri, headers.clone(), body.take().expect("body consumed once"), client_upgrade.take(), lease).await {
				Ok(response) => return Ok((response, endpoint)),
				Err(ConnectOutcome::Retryable(reason, returned_body)) => {
					last_reason = reason;
					failed.push(endpoint);
					body = Some(returned_body);
					if !selected.retryable || attempts >= MAX_ENDPOINT_ATTEMPTS {
						return Err(exhaust(last_reason));
					}
					match self.reselect(host_and_path, &failed)? {
						Some(endpoint) => selected.endpoint = endpoint,
						None => return Err(exhaust(last_reason)),
					}
				},
				Err(ConnectOutcome::Terminal(reason)) => return Err(reason),
			}
		}
	}

	fn reselect(&self, host_and_path: &str, failed: &[Arc<Endpoint>]) -> Result<Option<Arc<Endpoint>>, RouterError> {
		let az = self.cfg.availability_zone.clone();
		let az_pref = self.cfg.balancing_algorithm_az_preference;
		let in_flight = &self.in_flight;
		Ok(self.registry.lookup(host_and_path, |pool| balance::pick_endpoint(pool, failed, az.as_deref(), az_pref, in_flight)))
	}

	/// One connection attempt against `endpoint`. A failure to connect or complete the HTTP/1.1
	/// handshake hands the untouched request body back so the caller can retry it against the
	/// next endpoint; a failure after the request has been handed to the wire is terminal, since
	/// the body has already been partially or fully consumed.
	async fn send_once(
		&self,
		endpoint: &Endpoint,
		method: &Method,
		uri: &Uri,
		headers: HeaderMap,
		body: Incoming,
		client_upgrade: Option<hyper::upgrade::OnUpgrade>,
		lease: crate::transport::ConnectionLease,
	) -> Result<Response<BoxBody>, ConnectOutcome> {
		let stream = match tokio::time::timeout(self.cfg.endpoint_timeout, self.transport.open(endpoint)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) if crate::transport::is_backend_tls_cert_mismatch(&e) => {
				return Err(ConnectOutcome::Retryable(RouterError::BackendInvalidTlsCert { retries_exhausted: false }, body));
			},
			_ => return Err(ConnectOutcome::Retryable(RouterError::EndpointFailure { response_started: false }, body)),
		};

		let io = TokioIo::new(stream);
		let handshake = hyper::client::conn::http1::handshake(io).await;
		let (mut sender, conn) = match handshake {
			Ok(pair) => pair,
			Err(_) => return Err(ConnectOutcome::Retryable(RouterError::EndpointFailure { response_started: false }, body)),
		};
		tokio::spawn(async move {
			let _lease = lease;
			if let Err(e) = conn.with_upgrades().await {
				debug!(error = %e, "backend connection closed");
			}
		});

		let request = match build_request(method, uri, headers, body) {
			Ok(r) => r,
			Err(e) => return Err(ConnectOutcome::Terminal(e)),
		};

		let sent = tokio::time::timeout(self.cfg.endpoint_timeout, sender.send_request(request)).await;
		let mut backend_response = match sent {
			Ok(Ok(r)) => r,
			_ => return Err(ConnectOutcome::Terminal(RouterError::EndpointFailure { response_started: false })),
		};

		if backend_response.status() == StatusCode::SWITCHING_PROTOCOLS {
			let backend_upgrade = hyper::upgrade::on(&mut backend_response);
			if let Some(client_upgrade) = client_upgrade {
				let reporter = self.reporter.clone();
				tokio::spawn(async move {
					let ok = match (client_upgrade.await, backend_upgrade.await) {
						(Ok(client), Ok(backend)) => upgrade::splice(client, backend).await.is_ok(),
						_ => false,
					};
					reporter.observe(RouterEvent::WebsocketUpgrade { ok });
				});
			}
			let (parts, _) = backend_response.into_parts();
			return Ok(Response::from_parts(parts, empty_body()));
		}

		let (parts, incoming) = backend_response.into_parts();
		Ok(Response::from_parts(parts, from_incoming(incoming)))
	}

	async fn proxy_to_route_service(&self, route_service_url: &str, method: Method, mut headers: HeaderMap, body: Incoming) -> Result<Response<BoxBody>, RouterError> {
		let uri: Uri = route_service_url.parse().map_err(|_| RouterError::RouteServiceUnsupported)?;
		let host = uri.host().ok_or(RouterError::RouteServiceUnsupported)?.to_string();
		let use_tls = uri.scheme_str() == Some("https");
		let port = uri.port_u16().unwrap_or(if use_tls { 443 } else { 80 });

		if let Ok(v) = HeaderValue::from_str(&host) {
			headers.insert(http::header::HOST, v);
		}

		let stream = tokio::time::timeout(self.cfg.endpoint_timeout, self.transport.open_route_service(&host, port, use_tls))
			.await
			.map_err(|_| RouterError::RouteServiceUnsupported)?
			.map_err(|_| RouterError::RouteServiceUnsupported)?;
		let io = TokioIo::new(stream);
		let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(|_| RouterError::RouteServiceUnsupported)?;
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!(error = %e, "route service connection closed");
			}
		});

		let request_uri: Uri = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").parse().map_err(|_| RouterError::RouteServiceUnsupported)?;
		let request = build_request(&method, &request_uri, headers, body).map_err(|_| RouterError::RouteServiceUnsupported)?;
		let response = tokio::time::timeout(self.cfg.route_service_timeout, sender.send_request(request))
			.await
			.map_err(|_| RouterError::RouteServiceRequestExpired)?
			.map_err(|_| RouterError::RouteServiceUnsupported)?;
		let (parts, incoming) = response.into_parts();
		Ok(Response::from_parts(parts, from_incoming(incoming)))
	}
}

fn build_request(method: &Method, uri: &Uri, headers: HeaderMap, body: Incoming) -> Result<Request<Incoming>, RouterError> {
	let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
	let relative: Uri = path_and_query.parse().map_err(|_| RouterError::EndpointFailure { response_started: false })?;
	let mut builder = Request::builder().method(method.clone()).uri(relative);
	if let Some(h) = builder.headers_mut() {
		*h = headers;
	}
	builder.body(body).map_err(|_| RouterError::EndpointFailure { response_started: false })
}

fn is_health_probe(headers: &HeaderMap, healthcheck_user_agent: &str) -> bool {
	headers.get(http::header::USER_AGENT).and_then(|v| v.to_str().ok()) == Some(healthcheck_user_agent)
}

/// Extracts and validates the routing host: rejects a blank `Host` or an IP-literal host, per
/// spec.md §4.4 step 2 and §7's `empty_host` error.
fn extract_host(headers: &HeaderMap, uri: &Uri) -> Result<String, RouterError> {
	let raw = headers
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.or_else(|| uri.host())
		.unwrap_or("")
		.to_string();
	let host_only = raw.rsplit_once(':').map(|(h, _)| h).unwrap_or(&raw).trim().to_string();
	if host_only.is_empty() || host_only.parse::<IpAddr>().is_ok() {
		return Err(RouterError::EmptyHost);
	}
	Ok(host_only)
}

fn reconstruct_original_url(uri: &Uri, host: &str, inbound_is_tls: bool, recommend_https: bool) -> String {
	let scheme = if inbound_is_tls || recommend_https { "https" } else { "http" };
	let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
	format!("{scheme}://{host}{path}")
}

fn rewrite_request_headers(
	headers: &mut HeaderMap,
	peer_ip: IpAddr,
	inbound_is_tls: bool,
	force_https: bool,
	sanitize: bool,
	inbound_host: &str,
	endpoint: &Endpoint,
	keep_upgrade: bool,
) {
	headers::strip_hop_by_hop(headers, keep_upgrade);
	headers::append_forwarded_for(headers, peer_ip);
	headers::set_forwarded_proto(headers, inbound_is_tls, force_https, sanitize);
	headers::set_forwarded_host(headers, inbound_host);
	headers::ensure_request_id(headers);
	headers::ensure_b3_trace(headers);
	headers::set_cf_identity(headers, &endpoint.app_id, &endpoint.private_instance_id);
	headers::append_via(headers);
}

fn rewrite_response_headers(headers: &mut HeaderMap, want_trace: bool, router_id: &str, endpoint: &Endpoint) {
	headers::strip_hop_by_hop(headers, false);
	headers::append_via(headers);
	if want_trace {
		headers::set_trace_headers(headers, router_id, &endpoint.to_string());
	}
}
