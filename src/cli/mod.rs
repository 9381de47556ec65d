mod daemon;

use anyhow::Result;
use console::style;

use crate::core::config;
use crate::core::terminal::{self, GuideSection};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Gateway")
        .command("gateway", "Manage the background daemon process")
        .command("daemon-run", "Run the daemon in the foreground")
        .command("logs", "Follow real-time daemon logs")
        .print();

    GuideSection::new("Diagnostics")
        .command("version", "Print the drydock version")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("drydock").green()
    );
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = config::data_dir();
    let run_dir = data_dir.join("run");
    let pid_file = run_dir.join("drydock.pid");

    match args.get(1).map(String::as_str) {
        Some("gateway") => match args.get(2).map(String::as_str) {
            Some("start") => daemon::gateway_start(&run_dir, &pid_file, &args).await,
            Some("stop") => daemon::gateway_stop(&pid_file).await,
            Some("restart") => daemon::gateway_restart().await,
            Some("status") => daemon::gateway_status(&pid_file).await,
            _ => {
                print_help();
                Ok(())
            }
        },
        Some("daemon-run") => daemon::daemon_run(&data_dir, &args).await,
        Some("logs") => daemon::follow_logs(&run_dir, &pid_file).await,
        Some("version") | Some("--version") => {
            println!("drydock {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        _ => {
            print_help();
            Ok(())
        }
    }
}
