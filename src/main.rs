use procurement_mesh::config::Config;
use procurement_mesh::{logging, server};

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load("config.toml")?;
    logging::init(&config.logging);
    tracing::info!("Starting procurement mesh...");
    server::start(config).await?;
    Ok(())
}
