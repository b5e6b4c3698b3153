use router_core::prelude::*;

/// The parsed `X-CF-App-Instance: APP_GUID:INDEX` header.
pub struct AppInstance {
	pub app_id: Strng,
	pub index: u32,
}

/// Parses the header value, returning `None` for any malformed value (missing colon, empty
/// `app_id`, non-numeric or negative index) — the caller maps that to `invalid_cf_app_instance_header`.
pub fn parse(value: &str) -> Option<AppInstance> {
	let (app_id, index) = value.split_once(':')?;
	if app_id.is_empty() {
		return None;
	}
	let index: u32 = index.parse().ok()?;
	Some(AppInstance { app_id: app_id.into(), index })
}
