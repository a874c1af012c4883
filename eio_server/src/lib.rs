//! # Engine.IO server
//!
//! The engine: a registry of live sessions plus the HTTP entry point
//! dispatching each request to the right transport and socket by session
//! id. Build one with [`EngineBuilder`], mount [`Engine::router`] into an
//! HTTP stack or let [`Engine::listen`] own the listener.
//!
//! ```no_run
//! # async fn demo() -> std::io::Result<()> {
//! use eio_server::EngineBuilder;
//!
//! let engine = EngineBuilder::new().build();
//! engine.on_connect(|socket| {
//!     let peer = std::sync::Arc::clone(socket);
//!     socket.on_message(move |data, _binary| {
//!         let peer = std::sync::Arc::clone(&peer);
//!         let text = String::from_utf8_lossy(data).into_owned();
//!         tokio::spawn(async move {
//!             let _ = peer.send_text(text).await;
//!         });
//!     });
//! });
//! engine.listen("0.0.0.0:3000".parse().expect("address")).await
//! # }
//! ```

mod engine;
mod router;

pub use engine::{ConnectHandler, Engine, EngineBuilder};
