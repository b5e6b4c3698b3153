use std::sync::Arc;

use router_core::prelude::*;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

pub const ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Verifies the backend's certificate carries `expected_san` in its SAN list, per spec.md §4.4's
/// `server_cert_domain_san` contract and §9's "full SAN list, RFC 6125 wildcard matching, no
/// chain-less self-signed unless `skip_ssl_validation`" design note. Chain validation itself is
/// delegated to `rustls`'s default webpki verifier; this verifier only adds the SAN check on top.
#[derive(Debug)]
pub struct SanVerifier {
	inner: Arc<dyn ServerCertVerifier>,
	expected_san: Strng,
}

impl SanVerifier {
	pub fn new(roots: Arc<rustls::RootCertStore>, expected_san: Strng) -> anyhow::Result<Self> {
		let inner: Arc<dyn ServerCertVerifier> =
			rustls::client::WebPkiServerVerifier::builder_with_provider(roots, provider()).build()?;
		Ok(Self { inner, expected_san })
	}
}

impl ServerCertVerifier for SanVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		server_name: &ServerName<'_>,
		ocsp_response: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
		if sans_match(end_entity, &self.expected_san) {
			Ok(ServerCertVerified::assertion())
		} else {
			error!(expected_san = %self.expected_san, "backend certificate SAN list does not contain expected value");
			Err(rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure))
		}
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Accepts any server certificate without verifying the chain, used only under
/// `skip_ssl_validation`.
#[derive(Debug, Default)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		vec![
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::ED25519,
		]
	}
}

fn sans_match(cert: &CertificateDer<'_>, expected: &str) -> bool {
	let Ok((_, parsed)) = X509Certificate::from_der(cert) else {
		return false;
	};
	let names = match dns_and_uri_sans(&parsed) {
		Some(n) => n,
		None => return false,
	};
	names.iter().any(|name| san_matches(name, expected))
}

fn dns_and_uri_sans(cert: &X509Certificate<'_>) -> Option<Vec<String>> {
	let mut out = Vec::new();
	for ext in cert.extensions() {
		if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
			for name in &san.general_names {
				match name {
					GeneralName::DNSName(d) => out.push(d.to_string()),
					GeneralName::URI(u) => out.push(u.to_string()),
					_ => {},
				}
			}
		}
	}
	Some(out)
}

/// RFC 6125 wildcard matching: `*.` matches exactly one leftmost label, case-insensitively, and
/// never matches across additional dots.
fn san_matches(pattern: &str, host: &str) -> bool {
	if let Some(suffix) = pattern.strip_prefix("*.") {
		let Some((_, host_suffix)) = host.split_once('.') else {
			return false;
		};
		return suffix.eq_ignore_ascii_case(host_suffix);
	}
	pattern.eq_ignore_ascii_case(host)
}
