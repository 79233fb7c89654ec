use std::sync::Arc;
use std::time::Duration;

use signal_server::records::{CallRecordStore, MemoryCallRecords, PgCallRecords};
use signal_server::state::AppState;

#[tokio::main]
async fn main() {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let ring_timeout = std::env::var("RING_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(signal_server::DEFAULT_RING_TIMEOUT_SECS));

    let records: Arc<dyn CallRecordStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(8)
                .connect(&url)
                .await
                .expect("connect to DATABASE_URL");
            sqlx::migrate!()
                .run(&pool)
                .await
                .expect("run call_records migrations");
            Arc::new(PgCallRecords::new(pool))
        }
        Err(_) => {
            tracing::warn!(
                "⚠️  DATABASE_URL not set! Call records are kept in memory only and will not survive a restart."
            );
            Arc::new(MemoryCallRecords::default())
        }
    };

    let state = AppState::new(records, ring_timeout);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, signal_server::app(state)).await.unwrap();
}
