use api::middleware::log_request;
use api::routes::routes;
use api::state::AppState;
use axum::{
    Router,
    http::header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    middleware::from_fn,
};
use migration::Migrator;
use sea_orm_migration::MigratorTrait;
use services::scheduler::SessionReaper;
use std::net::SocketAddr;
use std::process::ExitCode;
use tower_http::cors::CorsLayer;
use tracing_appender::rolling;
use util::clock::system_clock;
use util::config::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let (log_file, log_level, log_to_stdout, host, port, project_name) = {
        let cfg = AppConfig::global();
        (
            cfg.log_file.clone(),
            cfg.log_level.clone(),
            cfg.log_to_stdout,
            cfg.host.clone(),
            cfg.port,
            cfg.project_name.clone(),
        )
    };
    let _log_guard = init_logging(&log_file, &log_level, log_to_stdout);

    let db = match db::connect().await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "cannot open database");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = Migrator::up(&db, None).await {
        tracing::error!(error = %e, "migrations failed");
        return ExitCode::FAILURE;
    }

    let clock = system_clock();
    let app_state = match AppState::init(db, clock.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "cannot initialise application state");
            return ExitCode::FAILURE;
        }
    };

    let mut reaper = SessionReaper::new(
        app_state.store().clone(),
        app_state.repo().clone(),
        clock,
    );
    reaper.start();

    let cors = CorsLayer::very_permissive().expose_headers([CONTENT_DISPOSITION, CONTENT_TYPE]);
    let app = Router::new()
        .nest("/api", routes(app_state))
        .layer(from_fn(log_request))
        .layer(cors);

    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, host = %host, port, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting {project_name} on http://{addr}");
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    reaper.stop().await;
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server crashed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl_c");
        std::future::pending::<()>().await;
    }
    tracing::info!("ctrl_c signal received");
}

fn init_logging(
    log_file: &str,
    log_level: &str,
    log_to_stdout: bool,
) -> tracing_appender::non_blocking::WorkerGuard {
    use std::fs;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    fs::create_dir_all("logs").ok();

    let file_appender = rolling::daily("logs", log_file);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    let stdout_layer = log_to_stdout.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(true)
            .with_thread_ids(true)
    });

    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("api=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    guard
}
