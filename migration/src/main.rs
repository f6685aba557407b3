use migration::Migrator;
use std::{env, fs, path::Path, process::ExitCode};
use util::config::AppConfig;

mod runner;

#[tokio::main]
async fn main() -> ExitCode {
    let (log_level, log_file, targets) = {
        let cfg = AppConfig::global();
        (
            cfg.log_level.clone(),
            format!("logs/migration-{}", cfg.log_file),
            [cfg.database_path.clone(), cfg.device_cache_path.clone()],
        )
    };
    if let Err(e) = common::init_logger(&log_level, &log_file) {
        eprintln!("Logger disabled: {e}");
    }

    let args: Vec<String> = env::args().collect();

    for db_path in &targets {
        let url = format!("sqlite://{}?mode=rwc", db_path);
        match args.get(1).map(|s| s.as_str()) {
            Some("clean") => {
                remove_db_file(db_path);
                continue;
            }
            Some("fresh") => remove_db_file(db_path),
            _ => {}
        }

        if let Err(e) = create_db_dir(db_path) {
            log::error!("Cannot create directory for {db_path}: {e}");
            return ExitCode::FAILURE;
        }
        if let Err(e) = runner::run_all_migrations(&url).await {
            log::error!("Migrations aborted: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

fn remove_db_file(path: &str) {
    let db_path = Path::new(path);
    if !db_path.exists() {
        log::info!("DB file does not exist: {}", db_path.display());
        return;
    }
    match fs::remove_file(db_path) {
        Ok(()) => log::info!("Deleted DB: {}", db_path.display()),
        Err(e) => log::error!("Failed to delete {}: {e}", db_path.display()),
    }
}

fn create_db_dir(path: &str) -> std::io::Result<()> {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
