use std::sync::Arc;
use std::time::Duration;

use crate::AppState;
use crate::config::HubConfig;
use crate::db::Database;
use crate::generation::Generator;
use crate::generation::test_support::ScriptedGenerator;
use crate::hub::StreamHub;
use crate::metrics::ServerMetrics;
use crate::repository::{MessageRepository, MessageStore};

/// Build a fully-wired `AppState` backed by an in-memory SQLite database and
/// a scripted generator. The generator is returned so tests can feed each
/// generation run step by step.
pub async fn test_app_state() -> (AppState, Arc<ScriptedGenerator>) {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    let db = Arc::new(Database { pool: pool.clone() });
    let store: Arc<dyn MessageStore> = Arc::new(MessageRepository::new(pool));
    let script = ScriptedGenerator::new();
    let generator: Arc<dyn Generator> = script.clone();
    let metrics = Arc::new(ServerMetrics::new());
    let hub = Arc::new(StreamHub::new(
        store,
        generator,
        HubConfig {
            outbound_queue_capacity: 64,
            generation_timeout: Some(Duration::from_secs(5)),
        },
        Arc::clone(&metrics),
    ));

    let state = AppState { hub, db, metrics };
    (state, script)
}
