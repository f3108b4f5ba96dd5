use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use subseq_dag::api::{DagApp, HasPool};
use subseq_dag::config::LinkTableConfig;
use subseq_dag::db::LinkTable;
use subseq_dag::relations::{NodeLinks, NodeLinksConfig};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ExampleApp {
    pool: Arc<SqlitePool>,
    links: Arc<NodeLinks>,
}

impl HasPool for ExampleApp {
    fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }
}

impl DagApp for ExampleApp {
    fn node_links(&self) -> Arc<NodeLinks> {
        Arc::clone(&self.links)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
    let bind = env::var("DAG_EXAMPLE_BIND").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid DAG_EXAMPLE_BIND '{}'", bind))?;

    let node_class = env::var("DAG_EXAMPLE_NODE_CLASS").unwrap_or_else(|_| "Node".to_string());
    let mut table_config = LinkTableConfig::new(node_class.clone());
    if let Ok(table) = env::var("DAG_EXAMPLE_TABLE") {
        table_config = table_config.with_table(table);
    }
    if env_flag("DAG_EXAMPLE_SCOPED") {
        table_config = table_config.with_scope_column("scope_id");
    }
    let table = Arc::new(LinkTable::new(&table_config).context("invalid link table config")?);
    let links = NodeLinks::new(
        &NodeLinksConfig::new(table.name()).with_prefix(node_class.to_ascii_lowercase()),
        &[Arc::clone(&table)],
    )
    .context("invalid node links config")?;

    // Each in-memory connection is its own database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to sqlite")?;
    table
        .create_table(&pool)
        .await
        .context("failed to create link table")?;

    let app_state = ExampleApp {
        pool: Arc::new(pool),
        links: Arc::new(links),
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .merge(subseq_dag::api::routes::<ExampleApp>());

    let app = Router::new().nest("/api/v1", api_v1).with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    println!("subseq_dag example server listening on http://{}", bind_addr);
    println!("api base path: /api/v1");
    println!("link table: {} (scoped: {})", table.name(), table.schema().is_scoped());

    axum::serve(listener, app)
        .await
        .context("example server failed")
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
