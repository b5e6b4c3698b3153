use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use router_core::prelude::*;
use router_core::signal::{Shutdown, ShutdownKind};
use tokio::net::TcpListener;

use gorouter::bus::{Subscriber, SubscriberConfig};
use gorouter::config::Config;
use gorouter::control::{self, HealthState};
use gorouter::metrics::PrometheusReporter;
use gorouter::proxy::routeservice::RouteServiceCrypto;
use gorouter::proxy::{ProxyConfig, ProxyHandler};
use gorouter::registry::Registry;
use gorouter::transport::Transport;

#[derive(Parser, Debug)]
#[command(name = "gorouter", about = "CF-style layer-7 reverse proxy")]
struct Args {
	#[arg(short = 'c', long = "config", value_name = "FILE")]
	config: String,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let raw = std::fs::read_to_string(&args.config)?;
	let config = Config::from_yaml(&raw)?;

	router_core::telemetry::init(&config.logging);

	let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
	let handle = runtime.handle().clone();
	runtime.block_on(run(config, handle))
}

async fn run(config: Config, rt_handle: tokio::runtime::Handle) -> anyhow::Result<()> {
	let router_id: Strng = uuid::Uuid::new_v4().to_string().into();
	let ready = router_core::readiness::Ready::new();
	let health = HealthState::new();

	let reporter = Arc::new(PrometheusReporter::new());
	reporter.register_runtime_metrics(&rt_handle);
	let registry = Arc::new(Registry::new(config.registry_config(), reporter.clone()));
	let transport = Arc::new(Transport::new(
		config.backends.max_conns,
		config.endpoint_dial_timeout,
		config.endpoint_timeout,
		config.backends.skip_ssl_validation,
	)?);

	let route_service_crypto = config
		.route_services_secret
		.as_deref()
		.map(|secret| RouteServiceCrypto::new(secret, config.route_services_secret_decrypt_only.as_deref()))
		.transpose()
		.map_err(|e| anyhow::anyhow!("route_services_secret: {e}"))?
		.map(Arc::new);

	let proxy_cfg = ProxyConfig {
		router_id: router_id.clone(),
		healthcheck_user_agent: config.healthcheck_user_agent.clone(),
		force_forwarded_proto_https: config.force_forwarded_proto_https,
		sanitize_forwarded_proto: config.sanitize_forwarded_proto,
		trace_key: config.trace_key.clone(),
		availability_zone: config.availability_zone.clone(),
		balancing_algorithm_az_preference: config.balancing_algorithm_az_preference,
		endpoint_timeout: config.endpoint_timeout,
		route_service_timeout: config.route_service_timeout,
		route_service_recommend_https: config.route_service_recommend_https,
	};
	let proxy = Arc::new(ProxyHandler::new(registry.clone(), transport.clone(), reporter.clone(), route_service_crypto, proxy_cfg));

	let (drain_trigger, drain_watcher) = router_core::drain::new();
	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());

	let listener_block = ready.register_task("proxy-listener");
	let listener_addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
	let listener = TcpListener::bind(listener_addr).await?;
	info!(%listener_addr, "proxy listener bound");
	drop(listener_block);
	if config.ssl_port.is_some() {
		warn!("sslPort is configured but inbound TLS termination is not implemented; gorouter expects a TLS-terminating load balancer in front of it");
	}

	let enable_proxy_protocol = config.enable_proxy;
	let listener_watcher = drain_watcher.clone();
	drop(drain_watcher);
	let listener_proxy = proxy.clone();
	let listener_task = tokio::spawn(async move {
		loop {
			let (tcp, peer_addr) = tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "accept failed");
						continue;
					},
				},
				_ = listener_watcher.clone().wait_for_drain() => break,
			};
			let proxy = listener_proxy.clone();
			// Held for the connection's lifetime so the drain signal doesn't complete until every
			// in-flight connection has finished.
			let _conn_guard = listener_watcher.clone();
			tokio::spawn(async move {
				let _conn_guard = _conn_guard;
				if let Err(e) = serve_connection(tcp, peer_addr, proxy, false, enable_proxy_protocol).await {
					debug!(error = %e, "connection error");
				}
			});
		}
	});

	let mut subscriber_handle = None;
	if !config.nats.is_empty() {
		let bus_block = ready.register_task("bus-subscriber");
		let servers = config
			.nats
			.iter()
			.map(|s| match (&s.user, &s.pass) {
				(Some(u), Some(p)) => format!("nats://{u}:{p}@{}:{}", s.host, s.port),
				_ => format!("nats://{}:{}", s.host, s.port),
			})
			.collect::<Vec<_>>()
			.join(",");
		let subscriber = Subscriber::connect(
			&servers,
			registry.clone(),
			reporter.clone(),
			SubscriberConfig {
				router_id: router_id.clone(),
				backend_tls_enabled: config.backends.enable_tls,
				minimum_register_interval: config.prune_stale_droplets_interval,
				prune_threshold: config.droplet_stale_threshold,
				suspend_pruning_if_unavailable: config.suspend_pruning_if_nats_unavailable,
			},
		)
		.await?;
		subscriber.announce_start().await?;
		drop(bus_block);
		let bus_shutdown = shutdown_rx.clone();
		subscriber_handle = Some(tokio::spawn(async move {
			if let Err(e) = subscriber.run(bus_shutdown).await {
				error!(error = %e, "bus subscriber stopped");
			}
		}));
	}

	let pruner_registry = registry.clone();
	let pruner_shutdown = shutdown_rx.clone();
	let pruner_task = tokio::spawn(async move { pruner_registry.run_pruning_cycle(pruner_shutdown).await });

	let control_addr: SocketAddr = format!("0.0.0.0:{}", config.status.port).parse()?;
	let control_listener = TcpListener::bind(control_addr).await?;
	info!(%control_addr, "control surface bound");
	let control_router = control::router(registry.clone(), reporter.clone(), health.clone(), &config.status);
	let control_shutdown = shutdown_rx.clone();
	let control_task = tokio::spawn(async move {
		let _ = axum::serve(control_listener, control_router)
			.with_graceful_shutdown(async move {
				let _ = control_shutdown.clone().changed().await;
			})
			.await;
	});

	let shutdown = Shutdown::new();
	let kind = shutdown.wait().await;
	health.mark_draining();
	let _ = shutdown_tx.send(());
	match kind {
		ShutdownKind::Immediate => {
			info!("shutdown: immediate");
			drain_trigger.start_drain_and_wait(router_core::drain::DrainMode::Immediate).await;
		},
		ShutdownKind::Drain => {
			info!(timeout = ?config.drain_timeout, "shutdown: draining in-flight connections");
			if tokio::time::timeout(config.drain_timeout, drain_trigger.start_drain_and_wait(router_core::drain::DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!("drain timeout elapsed with connections still open, forcing shutdown");
			}
		},
	}

	listener_task.abort();
	control_task.abort();
	pruner_task.abort();
	if let Some(h) = subscriber_handle {
		h.abort();
	}
	Ok(())
}

async fn serve_connection(
	tcp: tokio::net::TcpStream,
	peer_addr: SocketAddr,
	proxy: Arc<ProxyHandler>,
	inbound_is_tls: bool,
	expect_proxy_protocol: bool,
) -> anyhow::Result<()> {
	let (tcp, real_peer) = if expect_proxy_protocol {
		match read_proxy_header(tcp).await {
			Ok((tcp, Some(source))) => (tcp, source),
			Ok((tcp, None)) => (tcp, peer_addr),
			Err(_) => return Ok(()),
		}
	} else {
		(PrefixedStream { prefix: Bytes::new(), pos: 0, inner: tcp }, peer_addr)
	};
	let io = TokioIo::new(tcp);
	let service = service_fn(move |req| {
		let proxy = proxy.clone();
		async move { Ok::<_, std::convert::Infallible>(proxy.handle(req, real_peer, inbound_is_tls).await) }
	});
	http1::Builder::new()
		.timer(TokioTimer::new())
		.serve_connection(io, service)
		.with_upgrades()
		.await?;
	Ok(())
}

/// Wraps a `TcpStream` with leftover bytes read past a consumed PROXY protocol header, replaying
/// them before further reads reach the socket.
struct PrefixedStream {
	prefix: Bytes,
	pos: usize,
	inner: tokio::net::TcpStream,
}

impl tokio::io::AsyncRead for PrefixedStream {
	fn poll_read(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &mut tokio::io::ReadBuf<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		let this = self.get_mut();
		if this.pos < this.prefix.len() {
			let remaining = &this.prefix[this.pos..];
			let n = remaining.len().min(buf.remaining());
			buf.put_slice(&remaining[..n]);
			this.pos += n;
			return std::task::Poll::Ready(Ok(()));
		}
		std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl tokio::io::AsyncWrite for PrefixedStream {
	fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}
	fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}
	fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

/// Reads and consumes a PROXY protocol v2 header off a freshly accepted connection, per spec.md
/// §9's `enableProxy` note, grounded on the peek-then-parse loop real load balancers expect
/// (`ppp::v2::Header::try_from` over an accumulating buffer until it stops reporting "incomplete").
/// Any bytes read past the header are preserved in a `PrefixedStream` for the HTTP parser.
async fn read_proxy_header(mut tcp: tokio::net::TcpStream) -> anyhow::Result<(PrefixedStream, Option<SocketAddr>)> {
	use ppp::PartialResult;
	use ppp::v2::{Addresses, Header};
	use tokio::io::AsyncReadExt;

	const MAX_HEADER_CAPACITY: usize = 512;
	let mut buf = bytes::BytesMut::with_capacity(MAX_HEADER_CAPACITY);
	loop {
		if tcp.read_buf(&mut buf).await? == 0 {
			anyhow::bail!("connection closed before a full PROXY protocol header arrived");
		}
		match Header::try_from(buf.as_ref()) {
			Ok(header) => {
				let consumed = header.as_bytes().len();
				let source = match header.addresses {
					Addresses::IPv4(v4) => Some(SocketAddr::new(v4.source_address.into(), v4.source_port)),
					Addresses::IPv6(v6) => Some(SocketAddr::new(v6.source_address.into(), v6.source_port)),
					_ => None,
				};
				let leftover = buf.split_off(consumed).freeze();
				return Ok((PrefixedStream { prefix: leftover, pos: 0, inner: tcp }, source));
			},
			Err(e) if !e.is_incomplete() => anyhow::bail!("malformed PROXY protocol header"),
			_ => {},
		}
		if buf.len() >= buf.capacity() {
			anyhow::bail!("PROXY protocol header exceeded {MAX_HEADER_CAPACITY} bytes");
		}
	}
}
