use std::{sync::Arc, time::Duration};

use chrono::Utc;
use engine::{FileCache, MemoryCache};

use crate::{client::HttpStore, config::AppConfig, error::Result};

mod client;
mod commands;
mod config;
mod error;
mod seed;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "spendsync={level},engine={level}",
            level = config.level
        ))
        .with_writer(std::io::stderr)
        .init();

    if config.memory {
        let user_id = config.user_id().unwrap_or(seed::SAMPLE_USER).to_string();
        tracing::info!(%user_id, "using seeded in-memory store");
        let store = seed::sample_store(&user_id, Utc::now());
        let config = AppConfig { user_id, ..config };
        return commands::run(Arc::new(store), MemoryCache::new(), &config, command).await;
    }

    tracing::debug!(base_url = %config.base_url, "using remote store");
    let store = HttpStore::new(
        &config.base_url,
        config.token.clone(),
        Duration::from_millis(config.poll_interval_ms),
    )?;
    let cache = FileCache::new(&config.cache_path);
    commands::run(Arc::new(store), cache, &config, command).await
}
