use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use router_core::prelude::*;

/// Splices two already-upgraded connections until either side closes, per spec.md §4.4 step 6:
/// after the backend answers `101 Switching Protocols`, raw bytes flow bidirectionally with no
/// further HTTP framing.
pub async fn splice(client: Upgraded, backend: Upgraded) -> anyhow::Result<()> {
	let mut client = TokioIo::new(client);
	let mut backend = TokioIo::new(backend);
	match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
		Ok((to_backend, to_client)) => {
			debug!(to_backend, to_client, "upgrade splice closed");
			Ok(())
		},
		Err(e) => Err(e.into()),
	}
}
