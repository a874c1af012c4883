//! Demo Engine.IO server: echoes every message back, reports connection
//! totals on `/conns`, and shuts down cleanly on Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use eio_server::EngineBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "eio-server", about = "Engine.IO echo server")]
struct Arguments {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// HTTP path prefix for the engine endpoint.
    #[arg(long, default_value = "/engine.io/")]
    path: String,

    /// Advertised ping interval, milliseconds.
    #[arg(long, default_value_t = 25_000)]
    ping_interval_ms: u64,

    /// Liveness deadline, milliseconds.
    #[arg(long, default_value_t = 60_000)]
    ping_timeout_ms: u64,

    /// Disable mid-session transport upgrades.
    #[arg(long)]
    no_upgrades: bool,

    /// Session cookie name to set on handshake responses.
    #[arg(long)]
    cookie: Option<String>,

    /// Seconds between broadcast ticks; zero disables the broadcaster.
    #[arg(long, default_value_t = 0)]
    broadcast_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();

    let mut builder = EngineBuilder::new()
        .path(args.path.clone())
        .ping_interval(Duration::from_millis(args.ping_interval_ms))
        .ping_timeout(Duration::from_millis(args.ping_timeout_ms))
        .allow_upgrades(!args.no_upgrades);
    if let Some(cookie) = args.cookie.clone() {
        builder = builder.cookie(cookie);
    }
    let engine = builder.build();

    engine.on_connect(|socket| {
        info!(sid = %socket.id(), "socket connected");
        let peer = Arc::clone(socket);
        socket.on_message(move |data, binary| {
            let text = String::from_utf8_lossy(data).into_owned();
            info!(sid = %peer.id(), binary, message = %text, "got message");
            let peer = Arc::clone(&peer);
            tokio::spawn(async move {
                if let Err(e) = peer.send_text(format!("ECHO: {text}")).await {
                    warn!(error = %e, "echo failed");
                }
            });
        });
        let sid = socket.id().to_owned();
        socket.on_close(move |reason| info!(sid = %sid, reason, "socket closed"));
    });

    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let token = token.clone();
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_ok() {
                    match hits.fetch_add(1, Ordering::Relaxed) {
                        0 => {
                            eprintln!("Ctrl+C — shutting down… (press again to force)");
                            token.cancel();
                        }
                        _ => std::process::exit(130),
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let token = token.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                eprintln!("SIGTERM — shutting down…");
                token.cancel();
            }
        });
    }

    {
        let engine = engine.clone();
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            engine.close().await;
        });
    }

    if args.broadcast_secs > 0 {
        let engine = engine.clone();
        let token = token.clone();
        let period = Duration::from_secs(args.broadcast_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick += 1;
                for socket in engine.clients() {
                    if let Err(e) = socket.send_text(format!("BROADCAST #{tick}")).await {
                        tracing::debug!(sid = %socket.id(), error = %e, "broadcast skipped");
                    }
                }
            }
        });
    }

    let stats = Router::new().route(
        "/conns",
        get({
            let engine = engine.clone();
            move || {
                let engine = engine.clone();
                async move { format!("totals: {}", engine.count()) }
            }
        }),
    );
    let app = engine.router().merge(stats);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(addr = %listener.local_addr()?, path = %args.path, "serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await?;

    Ok(())
}
