use migration::Migrator;
use sea_orm_migration::MigratorTrait;
use serde_json::{Value, json};
use services::AppError;
use services::device::DeviceRuntime;
use services::models::{Identity, Role};
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::rolling;
use util::config::AppConfig;

#[derive(Debug, PartialEq)]
enum Command {
    SignIn(Identity),
    SignOut,
    Scan(String),
    Status,
    Sync,
    ClearFailed,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".into());
    };
    match verb {
        "signin" => {
            let user_id = words.next().ok_or("usage: signin <user_id> <role> [role_identifier]")?;
            let role = match words.next() {
                Some("student") => Role::Student,
                Some("lecturer") => Role::Lecturer,
                Some("admin") => Role::Admin,
                Some(other) => return Err(format!("unknown role '{other}'")),
                None => return Err("usage: signin <user_id> <role> [role_identifier]".into()),
            };
            Ok(Command::SignIn(Identity {
                user_id: user_id.to_owned(),
                role,
                role_identifier: words.next().map(str::to_owned),
            }))
        }
        "signout" => Ok(Command::SignOut),
        "scan" => words
            .next()
            .map(|raw| Command::Scan(raw.to_owned()))
            .ok_or_else(|| "usage: scan <token>".into()),
        "status" => Ok(Command::Status),
        "sync" => Ok(Command::Sync),
        "clear-failed" => Ok(Command::ClearFailed),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn reply<T: serde::Serialize>(res: Result<T, AppError>) -> Value {
    match res {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(e) => json!({ "success": false, "message": e.to_string() }),
    }
}

async fn run(runtime: &DeviceRuntime, command: Command) -> Value {
    match command {
        Command::SignIn(identity) => reply(runtime.sign_in(identity).await.map(|c| c.identity())),
        Command::SignOut => reply(runtime.sign_out().await),
        Command::Scan(raw) => match runtime.process_scan(&raw).await {
            Ok(result) => json!({
                "success": true,
                "message": result.user_message(),
                "data": result,
            }),
            Err(e) => json!({ "success": false, "message": e.to_string() }),
        },
        Command::Status => reply(runtime.status().await),
        Command::Sync => {
            let drained = runtime.sync_now().await;
            reply(
                runtime
                    .status()
                    .await
                    .map(|status| json!({ "drained": drained, "status": status })),
            )
        }
        Command::ClearFailed => reply(runtime.clear_failed().await.map(|n| json!({ "cleared": n }))),
        Command::Quit => json!({ "success": true }),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let (log_file, log_level, log_to_stdout) = {
        let cfg = AppConfig::global();
        (format!("device-{}", cfg.log_file), cfg.log_level.clone(), cfg.log_to_stdout)
    };
    let _log_guard = init_logging(&log_file, &log_level, log_to_stdout);

    let db = match db::connect_device_cache().await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "cannot open device cache");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = Migrator::up(&db, None).await {
        tracing::error!(error = %e, "migrations failed");
        return ExitCode::FAILURE;
    }

    let runtime = match DeviceRuntime::from_config(db) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "cannot initialise device runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl_c signal received");
                break ExitCode::SUCCESS;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "cannot read stdin");
                break ExitCode::FAILURE;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let out = match parse_command(&line) {
            Ok(Command::Quit) => break ExitCode::SUCCESS,
            Ok(command) => run(&runtime, command).await,
            Err(message) => json!({ "success": false, "message": message }),
        };
        println!("{out}");
    };

    runtime.stop().await;
    code
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

    // Stdout carries command replies, so console logs go to stderr.
    let console_layer = log_to_stdout.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
    });

    let env_filter =
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("device=info,services=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
