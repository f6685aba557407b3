pub mod filter_utils;
pub mod models;
pub mod repositories;
pub mod test_utils;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::path::Path;
use std::time::Duration;
use util::config::AppConfig;

/// Connect to the server-side store named by `DATABASE_PATH`.
pub async fn connect() -> Result<DatabaseConnection, DbErr> {
    let path = AppConfig::global().database_path.clone();
    connect_to(&path).await
}

/// Connect to the device-side cache named by `DEVICE_CACHE_PATH`.
pub async fn connect_device_cache() -> Result<DatabaseConnection, DbErr> {
    let path = AppConfig::global().device_cache_path.clone();
    connect_to(&path).await
}

/// Accepts a full DSN or a bare SQLite file path.
pub async fn connect_to(path_or_url: &str) -> Result<DatabaseConnection, DbErr> {
    let url = if path_or_url.starts_with("sqlite:") {
        path_or_url.to_owned()
    } else {
        // SQLite won't create intermediate dirs.
        if let Some(parent) = Path::new(path_or_url).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        format!("sqlite://{path_or_url}?mode=rwc")
    };

    let mut opts = ConnectOptions::new(url);
    opts.connect_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    tracing::info!(target: "db", path = path_or_url, "connecting");
    Database::connect(opts).await
}
