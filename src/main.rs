//! Demo chat server: rooms, broadcasts, and acknowledged events.

use std::net::SocketAddr;

use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wavelink::{event, Config, Server, Transport};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    // DEBUG=1 turns on verbose diagnostics; an explicit RUST_LOG wins.
    let default_filter = if std::env::var("DEBUG").as_deref() == Ok("1") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let addr: SocketAddr = config
        .addr
        .parse()
        .expect("WAVELINK_ADDR must be host:port");

    let transport = Transport::v4().with_ping(config.ping_interval, config.ping_timeout);
    let server = Server::with_config(transport, config);
    server.enable_cors("*");

    server.on(event::CONNECTION, |channel, _| async move {
        tracing::info!(sid = %channel.id(), ip = %channel.ip(), "peer connected");
        Ok(None)
    });

    server.on(event::DISCONNECTION, |channel, _| async move {
        tracing::info!(sid = %channel.id(), "peer disconnected");
        Ok(None)
    });

    server.on(event::ERROR, |channel, args| async move {
        tracing::warn!(sid = %channel.id(), ?args, "handler error");
        Ok(None)
    });

    server.on("join", |channel, args| async move {
        let room = args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("lobby")
            .to_string();
        channel.join(&room)?;
        Ok(Some(json!(["joined", room, channel.amount(&room)])))
    });

    server.on("leave", |channel, args| async move {
        let room = args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("lobby")
            .to_string();
        channel.leave(&room)?;
        Ok(None)
    });

    server.on("msg", |channel, args| async move {
        let room = args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("lobby")
            .to_string();
        let body = args.get(1).cloned().unwrap_or(json!(null));
        channel.broadcast_to(&room, "msg", vec![json!(room), body])?;
        Ok(None)
    });

    let app = server.router().layer(TraceLayer::new_for_http());

    tracing::info!(%addr, "wavelink listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
