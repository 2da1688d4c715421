use axum::serve;
use branchvc::api::routes::create_router;
use branchvc::config::Settings;
use branchvc::logic::BranchService;
use branchvc::store::PostgresStore;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    println!("BranchVC: Versioned Branch Service");

    // Load configuration
    let settings = Settings::load()?;
    println!("Configuration loaded: bind={}", settings.http.bind);

    println!("Connecting to PostgreSQL...");
    let postgres_store =
        PostgresStore::new(&settings.store_url(), settings.store.max_connections).await?;

    println!("Creating schema if needed...");
    postgres_store.migrate().await?;
    println!("Database ready");

    let service = Arc::new(BranchService::with_find_all_page_size(
        Arc::new(postgres_store),
        settings.branches.find_all_page_size,
    ));

    run_server(create_router().with_state(service), &settings).await?;

    Ok(())
}

async fn run_server(app: axum::Router, settings: &Settings) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&settings.http.bind).await?;
    println!("BranchVC server running on http://{}", settings.http.bind);

    serve(listener, app).await?;

    Ok(())
}
