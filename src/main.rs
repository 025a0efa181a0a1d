use std::sync::Arc;

use tower_http::cors::CorsLayer;

use pong_backend::config::Config;
use pong_backend::db::Database;
use pong_backend::engine::server::GameServer;
use pong_backend::{api, metrics};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run(Config::load()).await {
        tracing::error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    metrics::register_metrics();

    let db = Arc::new(Database::new(&config.database_url).await?);
    let game_server = Arc::new(GameServer::new(db.clone(), config.game.clone()));

    // Stats collaborators hang off this stream; for now it only feeds the log.
    let mut completions = game_server.subscribe_completions();
    tokio::spawn(async move {
        loop {
            match completions.recv().await {
                Ok(done) => tracing::info!(
                    room_id = %done.room_id,
                    winner_id = done.winner_id,
                    loser_id = done.loser_id,
                    reason = done.reason.as_str(),
                    "Match completed"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Completion listener lagged, skipped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let app = api::router(db, game_server).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Pong backend listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
