//! Shared harness for end-to-end tests.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use eio_server::{Engine, EngineBuilder};

static TRACING: OnceLock<()> = OnceLock::new();

pub fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt().with_env_filter("warn").init();
    });
}

/// Build the engine and serve it on an ephemeral local port.
pub async fn start(builder: EngineBuilder) -> (Arc<Engine>, SocketAddr) {
    init_tracing();
    let engine = builder.build();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = engine.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (engine, addr)
}

#[allow(dead_code)]
pub fn http_url(addr: SocketAddr, query: &str) -> String {
    format!("http://{addr}/engine.io/?{query}")
}

#[allow(dead_code)]
pub fn ws_url(addr: SocketAddr, query: &str) -> String {
    format!("ws://{addr}/engine.io/?{query}")
}
