use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: Bytes) -> BoxBody {
	Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxBody {
	Empty::new().map_err(|never| match never {}).boxed()
}

pub fn from_incoming(incoming: Incoming) -> BoxBody {
	incoming.boxed()
}

pub fn plain_text(status: http::StatusCode, text: &'static str) -> hyper::Response<BoxBody> {
	hyper::Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full_body(Bytes::from_static(text.as_bytes())))
		.expect("static response is well-formed")
}
