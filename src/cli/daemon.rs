use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::DaemonConfig;
use crate::core::dispatch::TaskDispatcher;
use crate::core::engine::{ExecutionEngine, SandboxDriver};
use crate::core::lifecycle::LifecycleManager;
use crate::core::run::RunLifecycle;
use crate::core::sandbox::{DockerRuntime, SandboxPool};
use crate::core::store::StateStore;
use crate::core::terminal::{GuideSection, print_error, print_info, print_warn};
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::platform::{NativePlatform, Platform};

pub async fn gateway_start(run_dir: &Path, pid_file: &Path, args: &[String]) -> Result<()> {
    std::fs::create_dir_all(run_dir)?;
    NativePlatform::restrict_dir_permissions(run_dir);
    if pid_file.exists() && std::fs::read_to_string(pid_file).is_ok() {
        print_warn("Daemon is already running. Use 'drydock gateway stop' first.");
        return Ok(());
    }

    let defaults = DaemonConfig::default();
    let (api_host, api_port) =
        crate::cli::parse_api_server_flags(args, 3, defaults.api_host, defaults.api_port);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("drydock.log"))?;

    let exe = std::env::current_exe()?;
    let mut child_cmd = std::process::Command::new(exe);
    child_cmd.arg("daemon-run");
    child_cmd.arg("--api-host").arg(&api_host);
    child_cmd.arg("--api-port").arg(api_port.to_string());

    let child = child_cmd
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    std::fs::write(pid_file, child.id().to_string())?;

    GuideSection::new("Gateway Started")
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(child.id()).dim()
            ),
        )
        .status("API Endpoint", &format!("http://{}:{}", api_host, api_port))
        .print();
    println!();

    Ok(())
}

pub async fn gateway_stop(pid_file: &Path) -> Result<()> {
    let mut daemon_stopped = false;
    if pid_file.exists() {
        if let Ok(pid_str) = std::fs::read_to_string(pid_file) {
            let pid = pid_str.trim();
            if !pid.is_empty() {
                let _ = NativePlatform::kill_process(pid);
                GuideSection::new("Gateway Stopped")
                    .status(
                        "Status",
                        &format!(
                            "{} (was PID {})",
                            style("STOPPED").red().bold(),
                            style(pid).dim()
                        ),
                    )
                    .print();
                daemon_stopped = true;
            }
        }
        std::fs::remove_file(pid_file).ok();
    }

    if !daemon_stopped {
        print_info("Gateway is not currently running.");
    }

    println!();
    Ok(())
}

pub async fn gateway_restart() -> Result<()> {
    let exe = std::env::current_exe()?;
    let _ = std::process::Command::new(&exe)
        .arg("gateway")
        .arg("stop")
        .status();
    let _ = std::process::Command::new(&exe)
        .arg("gateway")
        .arg("start")
        .status();
    Ok(())
}

pub async fn gateway_status(pid_file: &Path) -> Result<()> {
    if pid_file.exists() {
        let pid_str = std::fs::read_to_string(pid_file)?;
        GuideSection::new("Gateway Status")
            .status(
                "Gateway",
                &format!(
                    "{} (PID {})",
                    style("RUNNING").green().bold(),
                    style(pid_str.trim()).dim()
                ),
            )
            .print();
    } else {
        GuideSection::new("Gateway Status")
            .status("Gateway", &style("STOPPED").red().bold().to_string())
            .blank()
            .info(&format!(
                "Run {} to start the daemon.",
                style("drydock gateway start").cyan().bold()
            ))
            .print();
    }
    println!();
    Ok(())
}

pub async fn follow_logs(run_dir: &Path, pid_file: &Path) -> Result<()> {
    if pid_file.exists() && std::fs::read_to_string(pid_file).is_ok() {
        let log_file = run_dir.join("drydock.log");
        if log_file.exists() {
            GuideSection::new("Live Logs")
                .text(&format!(
                    "Following {} - press {} to stop.",
                    style("drydock.log").cyan(),
                    style("Ctrl+C").bold().yellow()
                ))
                .print();
            println!();
            let mut child = NativePlatform::tail_file(&log_file)?;
            let _ = child.wait()?;
        } else {
            print_error(&format!(
                "Log file not found at {}",
                style(log_file.display()).dim()
            ));
        }
    } else {
        GuideSection::new("Live Logs")
            .warn("Gateway is not running.")
            .blank()
            .info(&format!(
                "Run {} to start it.",
                style("drydock gateway start").cyan().bold()
            ))
            .print();
        println!();
    }
    Ok(())
}

/// Foreground daemon: store, pool, engine, dispatcher, API server, and the
/// dispatcher tick on the lifecycle scheduler.
pub async fn daemon_run(data_dir: &Path, args: &[String]) -> Result<()> {
    let mut config = DaemonConfig::load(data_dir)?;
    let (api_host, api_port) =
        crate::cli::parse_api_server_flags(args, 2, config.api_host.clone(), config.api_port);
    config.api_host = api_host;
    config.api_port = api_port;

    let (log_tx, _) = tokio::sync::broadcast::channel(256);
    crate::logging::init_tracing(log_tx.clone(), false);

    info!("drydock daemon starting (data dir: {:?})", data_dir);

    let store = Arc::new(StateStore::open(data_dir).await?);
    let lifecycle = Arc::new(RunLifecycle::new(store.clone()));
    let pool = Arc::new(SandboxPool::new(
        Arc::new(DockerRuntime::new()),
        config.sandbox.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        lifecycle.clone(),
        pool.clone(),
        Arc::new(SandboxDriver::new()),
        config.gate.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(
        store.clone(),
        lifecycle.clone(),
        config.dispatch.clone(),
    ));

    let mut manager = LifecycleManager::new().await?;

    // Every tick: claim due definitions, then hand each materialized run to
    // the engine.
    let tick_dispatcher = dispatcher.clone();
    let tick_engine = engine.clone();
    let tick_job = tokio_cron_scheduler::Job::new_async(
        config.dispatch.tick_cron.as_str(),
        move |_uuid, mut _l| {
            let dispatcher = tick_dispatcher.clone();
            let engine = tick_engine.clone();
            Box::pin(async move {
                let summary = dispatcher.tick().await;
                for run_id in summary.run_ids {
                    if let Err(e) = engine.clone().submit_run(run_id).await {
                        tracing::warn!("Failed to submit dispatched run {}: {}", run_id, e);
                    }
                }
            })
        },
    )?;
    manager.scheduler.add(tick_job).await?;

    let api = ApiServer::new(ApiServerConfig {
        store,
        dispatcher,
        lifecycle,
        pool,
        engine,
        log_tx,
        api_host: config.api_host.clone(),
        api_port: config.api_port,
        internal_token: config.internal_token.clone(),
        default_owner: config.default_owner.clone(),
    });
    manager.attach(Arc::new(Mutex::new(api)));

    manager.start().await?;
    info!(
        "drydock ready at http://{}:{}",
        config.api_host, config.api_port
    );

    tokio::signal::ctrl_c().await?;
    manager.shutdown().await?;
    Ok(())
}
