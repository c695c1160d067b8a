// SPDX-License-Identifier: Apache-2.0

//! `mcp-process` CLI binary entrypoint: resolves the security config,
//! builds the supervisor core, and runs the JSON-RPC stdio loop.

mod dispatcher;
mod paths;
mod rpc;
mod tools;

use clap::Parser;
use dispatcher::Dispatcher;
use std::process::ExitCode;
use supervisor_core::config::SecurityConfig;
use supervisor_core::SupervisorState;

/// mcp-process — sandboxed process supervisor exposed over JSON-RPC stdio
#[derive(Parser)]
#[command(name = "mcp-process", version, about, long_about = None)]
struct Cli {
    /// Load the security config from this path instead of the default chain.
    #[arg(long)]
    config: Option<String>,

    /// Write a sample security config to the given path and exit.
    #[arg(long)]
    create_config: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(path) = cli.create_config {
        return match write_sample_config(&path) {
            Ok(()) => {
                println!("wrote sample config to {path}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to write sample config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MCP_PROCESS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config));
    ExitCode::SUCCESS
}

async fn run(config: SecurityConfig) {
    let state = match SupervisorState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("failed to initialize supervisor: {e}");
            return;
        }
    };

    state.set_audit_sink(|line| eprintln!("{line}"));
    let background = state.spawn_background_tasks();

    tracing::info!("mcp-process supervisor starting");
    rpc::run_stdio_loop(Dispatcher::new(state.clone())).await;

    tracing::info!("stdin closed, shutting down");
    state.shutdown().await;
    for task in background {
        task.abort();
    }
}

fn write_sample_config(path: &str) -> std::io::Result<()> {
    let sample = SecurityConfig::sample();
    let json = serde_json::to_string_pretty(&sample).unwrap_or_default();
    std::fs::write(path, json)
}

fn load_config(flag: Option<&str>) -> Result<SecurityConfig, String> {
    let resolved = paths::resolve_config_path(flag);
    let config = match resolved {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            serde_json::from_str(&contents)
                .map_err(|e| format!("failed to parse {}: {e}", path.display()))?
        }
        None => SecurityConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_no_file_fails_validation() {
        // Guards against MCP_PROCESS_CONFIG_PATH leaking from the host env
        // into this test process.
        std::env::remove_var(paths::ENV_VAR);
        let result = load_config(Some("/nonexistent/mcp-process-config.json"));
        assert!(result.is_err());
    }
}
