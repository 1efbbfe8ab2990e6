use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use offerdeck::scripted::{router, ScriptedBackend};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scripted-backend")]
#[command(about = "Serve canned tailored-offer evaluations for offline demos")]
struct Args {
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Milliseconds between replayed events
    #[arg(long, default_value_t = 400)]
    event_delay_ms: u64,

    /// Queue every offer for human approval
    #[arg(long)]
    require_approval: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,offerdeck=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let backend = ScriptedBackend::new()
        .with_event_delay(Duration::from_millis(args.event_delay_ms))
        .with_approval_required(args.require_approval);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(backend)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("scripted backend listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
