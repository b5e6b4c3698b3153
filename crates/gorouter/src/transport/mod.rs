pub mod tls;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use router_core::prelude::*;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsConnector;

use crate::types::Endpoint;

/// Either a plaintext TCP stream to a backend, or a TLS stream to one. Boxed trait objects would
/// work too, but this avoids an allocation on the hot path of every proxied request.
pub enum BackendStream {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for BackendStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

/// Backend connection pools are keyed by `(canonical_addr, use_tls, server_cert_domain_san)` per
/// spec.md §5 — two endpoints sharing an address but different SAN expectations get distinct
/// pools rather than racing each other's TLS identity check.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
	host: Strng,
	port: u16,
	use_tls: bool,
	server_cert_domain_san: Option<Strng>,
}

impl PoolKey {
	fn for_endpoint(e: &Endpoint) -> Self {
		let (host, port) = e.canonical_addr();
		Self { host, port, use_tls: e.use_tls, server_cert_domain_san: e.server_cert_domain_san.clone() }
	}
}

struct Pool {
	limiter: Option<Arc<Semaphore>>,
}

/// Per-backend concurrent connection accounting. Does not pool idle connections itself (the
/// upstream is HTTP/1.1, opened fresh per proxied request per spec.md §9); its job is purely to
/// enforce `backends.max_conns` and build the TLS client config used for a given endpoint.
pub struct Transport {
	pools: Mutex<HashMap<PoolKey, Pool>>,
	max_conns: u32,
	connect_timeout: Duration,
	request_timeout: Duration,
	skip_ssl_validation: bool,
	root_store: Arc<rustls::RootCertStore>,
}

pub struct ConnectionLease {
	_permit: Option<OwnedSemaphorePermit>,
}

impl Transport {
	pub fn new(max_conns: u32, connect_timeout: Duration, request_timeout: Duration, skip_ssl_validation: bool) -> anyhow::Result<Self> {
		let native = rustls_native_certs::load_native_certs();
		let mut root_store = rustls::RootCertStore::empty();
		root_store.add_parsable_certificates(native.certs);
		Ok(Self {
			pools: Mutex::new(HashMap::new()),
			max_conns,
			connect_timeout,
			request_timeout,
			skip_ssl_validation,
			root_store: Arc::new(root_store),
		})
	}

	/// Acquires a connection slot for `endpoint`, enforcing `max_conns`. Returns `None` when the
	/// backend's pool is already at capacity (the caller surfaces `ConnectionLimitReached`).
	pub fn try_acquire(&self, endpoint: &Endpoint) -> Option<ConnectionLease> {
		if self.max_conns == 0 {
			return Some(ConnectionLease { _permit: None });
		}
		let key = PoolKey::for_endpoint(endpoint);
		let sem = {
			let mut pools = self.pools.lock();
			pools
				.entry(key)
				.or_insert_with(|| Pool { limiter: Some(Arc::new(Semaphore::new(self.max_conns as usize))) })
				.limiter
				.clone()
				.expect("limiter set when max_conns > 0")
		};
		sem.try_acquire_owned().ok().map(|permit| ConnectionLease { _permit: Some(permit) })
	}

	pub async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<TcpStream> {
		let addr = format!("{}:{}", endpoint.host, endpoint.port);
		Ok(tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await??)
	}

	pub fn request_timeout(&self) -> Duration {
		self.request_timeout
	}

	/// Builds the `ClientConfig` for this endpoint's TLS verification policy: SAN match against
	/// `server_cert_domain_san`, or an insecure no-op verifier under `skip_ssl_validation`.
	pub fn tls_config_for(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<ClientConfig>> {
		let builder = ClientConfig::builder_with_provider(tls::provider())
			.with_protocol_versions(tls::ALL_TLS_VERSIONS)
			.expect("protocol versions are valid")
			.with_root_certificates((*self.root_store).clone())
			.with_no_client_auth();
		let mut cc = builder;
		if self.skip_ssl_validation {
			cc.dangerous().set_certificate_verifier(Arc::new(tls::NoVerifier));
		} else if let Some(san) = &endpoint.server_cert_domain_san {
			let verifier = tls::SanVerifier::new(self.root_store.clone(), san.clone())?;
			cc.dangerous().set_certificate_verifier(Arc::new(verifier));
		} else {
			anyhow::bail!("TLS backend without server_cert_domain_san");
		}
		Ok(Arc::new(cc))
	}

	pub async fn tls_handshake(&self, tcp: TcpStream, endpoint: &Endpoint) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
		let cfg = self.tls_config_for(endpoint)?;
		let name = ServerName::try_from(endpoint.host.to_string())?;
		Ok(TlsConnector::from(cfg).connect(name, tcp).await?)
	}

	/// Connects and, for TLS backends, completes the handshake with SAN verification in one call.
	pub async fn open(&self, endpoint: &Endpoint) -> anyhow::Result<BackendStream> {
		let tcp = self.connect(endpoint).await?;
		if endpoint.use_tls {
			Ok(BackendStream::Tls(Box::new(self.tls_handshake(tcp, endpoint).await?)))
		} else {
			Ok(BackendStream::Plain(tcp))
		}
	}

	/// Connects directly to a route-service gateway by host/port, outside the registry's
	/// endpoint/pool model — route services are not registered backends. Ordinary WebPKI
	/// certificate validation applies; there is no per-route SAN to pin.
	pub async fn open_route_service(&self, host: &str, port: u16, use_tls: bool) -> anyhow::Result<BackendStream> {
		let addr = format!("{host}:{port}");
		let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await??;
		if !use_tls {
			return Ok(BackendStream::Plain(tcp));
		}
		let cfg = ClientConfig::builder_with_provider(tls::provider())
			.with_protocol_versions(tls::ALL_TLS_VERSIONS)
			.expect("protocol versions are valid")
			.with_root_certificates((*self.root_store).clone())
			.with_no_client_auth();
		let name = ServerName::try_from(host.to_string())?;
		let tls = TlsConnector::from(Arc::new(cfg)).connect(name, tcp).await?;
		Ok(BackendStream::Tls(Box::new(tls)))
	}
}

/// Distinguishes a `SanVerifier` SAN mismatch from any other `open()` failure (refused connection,
/// timeout, chain validation failure). `SanVerifier` signals a mismatch via
/// `rustls::CertificateError::ApplicationVerificationFailure`, which `tokio_rustls` wraps in an
/// `io::Error` on its way through `TlsConnector::connect`'s `anyhow`-propagated `?`.
pub fn is_backend_tls_cert_mismatch(err: &anyhow::Error) -> bool {
	err
		.downcast_ref::<std::io::Error>()
		.and_then(|io_err| io_err.get_ref())
		.and_then(|e| e.downcast_ref::<rustls::Error>())
		.is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)))
}

#[cfg(test)]
mod tests {
	use std::time::SystemTime;

	use super::*;
	use crate::types::{ModificationTag, Protocol};

	fn endpoint(port: u16, use_tls: bool, san: Option<&str>) -> Endpoint {
		Endpoint {
			host: "127.0.0.1".into(),
			port,
			app_id: "app".into(),
			private_instance_id: "inst".into(),
			private_instance_index: None,
			tags: Default::default(),
			use_tls,
			server_cert_domain_san: san.map(Into::into),
			isolation_segment: "".into(),
			protocol: Protocol::Http1,
			stale_threshold: None,
			modification_tag: ModificationTag::new("g1", 1),
			route_service_url: None,
			load_balancing_algorithm: None,
			updated_at: SystemTime::now(),
		}
	}

	#[test]
	fn try_acquire_unlimited_when_max_conns_zero() {
		let t = Transport::new(0, Duration::from_secs(1), Duration::from_secs(1), false).unwrap();
		let e = endpoint(80, false, None);
		assert!(t.try_acquire(&e).is_some());
		assert!(t.try_acquire(&e).is_some());
	}

	#[test]
	fn try_acquire_enforces_max_conns_per_endpoint() {
		let t = Transport::new(1, Duration::from_secs(1), Duration::from_secs(1), false).unwrap();
		let e = endpoint(80, false, None);
		let lease = t.try_acquire(&e);
		assert!(lease.is_some());
		assert!(t.try_acquire(&e).is_none(), "second lease should be denied while the first is held");
		drop(lease);
		assert!(t.try_acquire(&e).is_some(), "releasing the first lease frees the slot");
	}

	#[test]
	fn try_acquire_pools_are_independent_per_endpoint() {
		let t = Transport::new(1, Duration::from_secs(1), Duration::from_secs(1), false).unwrap();
		let a = endpoint(80, false, None);
		let b = endpoint(81, false, None);
		let _lease_a = t.try_acquire(&a).unwrap();
		assert!(t.try_acquire(&b).is_some(), "a different endpoint has its own limiter");
	}

	#[test]
	fn tls_config_requires_san_unless_skipping_validation() {
		let t = Transport::new(0, Duration::from_secs(1), Duration::from_secs(1), false).unwrap();
		let no_san = endpoint(443, true, None);
		assert!(t.tls_config_for(&no_san).is_err());

		let with_san = endpoint(443, true, Some("backend.example.com"));
		assert!(t.tls_config_for(&with_san).is_ok());
	}

	#[test]
	fn tls_config_skip_validation_ignores_missing_san() {
		let t = Transport::new(0, Duration::from_secs(1), Duration::from_secs(1), true).unwrap();
		let no_san = endpoint(443, true, None);
		assert!(t.tls_config_for(&no_san).is_ok());
	}

	#[test]
	fn is_backend_tls_cert_mismatch_detects_san_verification_failure() {
		let rustls_err = rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure);
		let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, rustls_err);
		let err: anyhow::Error = io_err.into();
		assert!(is_backend_tls_cert_mismatch(&err));
	}

	#[test]
	fn is_backend_tls_cert_mismatch_false_for_unrelated_errors() {
		let refused: anyhow::Error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
		assert!(!is_backend_tls_cert_mismatch(&refused));

		let other_cert_err = rustls::Error::InvalidCertificate(rustls::CertificateError::Expired);
		let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, other_cert_err);
		let wrong_variant: anyhow::Error = io_err.into();
		assert!(!is_backend_tls_cert_mismatch(&wrong_variant));
	}
}
