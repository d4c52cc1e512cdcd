//! Command-line entry point.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::core::config::Config;
use crate::core::diagnostics::Diagnostics;
use crate::core::terminal;
use crate::core::topology::Topology;
use crate::interfaces::web;

/// Health diagnostics for the sales and marketing data pipeline.
#[derive(Debug, Parser)]
#[command(name = "pipewatch", version, about)]
pub struct Cli {
    /// Config file (defaults to ./pipewatch.toml when present)
    #[arg(long, global = true, env = "PIPEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Print reports as JSON instead of styled text
    #[arg(long, global = true)]
    json: bool,

    /// SQLite warehouse file
    #[arg(long, global = true)]
    warehouse: Option<PathBuf>,

    /// History database file
    #[arg(long, global = true)]
    history: Option<PathBuf>,

    /// Base URL of the reporting API to probe
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check sources, master tables and reconciliation rules
    Check,

    /// Show the pipeline flow graph
    Graph,

    /// Probe warehouse sources and API endpoints end to end
    E2e,

    /// List recorded runs
    History {
        /// Number of runs to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Full diagnostics run, recorded to history
    Run,

    /// Serve the report API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the resolved topology
    Topology,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(path) = &self.warehouse {
            config.warehouse.path = path.clone();
        }
        if let Some(path) = &self.history {
            config.history.path = path.clone();
        }
        if let Some(url) = &self.base_url {
            config.probe.base_url = url.clone();
        }
        if let Command::Serve { host, port } = &self.command {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
        }
    }
}

fn emit<T: Serialize>(json: bool, report: &T, render: impl FnOnce(&T)) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(report).context("serializing report")?;
        println!("{}", text);
    } else {
        render(report);
    }
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).await?;
    cli.apply_overrides(&mut config);

    let json = cli.json;

    if let Command::Topology = cli.command {
        let topology =
            Topology::load(config.topology_path.as_deref()).context("loading pipeline topology")?;
        return emit(json, &topology, terminal::print_topology);
    }

    let diagnostics = Diagnostics::from_config(&config).await?;

    match cli.command {
        Command::Check => {
            let report = diagnostics.pipeline_check(Utc::now()).await;
            emit(json, &report, terminal::print_pipeline)
        }
        Command::Graph => {
            let report = diagnostics.flow_graph(Utc::now()).await;
            emit(json, &report, terminal::print_flow)
        }
        Command::E2e => {
            let report = diagnostics.e2e(Utc::now()).await;
            emit(json, &report, terminal::print_e2e)
        }
        Command::History { limit } => {
            let report = diagnostics.history(limit).await?;
            emit(json, &report, terminal::print_history)
        }
        Command::Run => {
            let report = diagnostics.run(Utc::now()).await;
            emit(json, &report, terminal::print_run)?;
            match report.history_error {
                Some(e) => anyhow::bail!("Run {} was not recorded: {}", report.run_id, e),
                None => Ok(()),
            }
        }
        Command::Serve { .. } => {
            if !json {
                terminal::print_step("Starting pipeline report API");
                terminal::print_link(
                    "Reports",
                    &format!(
                        "http://{}:{}/api/pipeline/check",
                        config.server.host, config.server.port
                    ),
                );
            }
            web::serve(diagnostics, &config.server.host, config.server.port).await
        }
        Command::Topology => emit(json, diagnostics.topology(), terminal::print_topology),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "pipewatch",
            "history",
            "--limit",
            "5",
            "--json",
            "--warehouse",
            "/tmp/w.db",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::History { limit: Some(5) }));
        assert_eq!(cli.warehouse, Some(PathBuf::from("/tmp/w.db")));
    }

    #[test]
    fn overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "pipewatch",
            "--base-url",
            "http://api:9000",
            "--history",
            "h.db",
            "serve",
            "--port",
            "9999",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.probe.base_url, "http://api:9000");
        assert_eq!(config.history.path, PathBuf::from("h.db"));
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.warehouse.path, PathBuf::from("warehouse.db"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Cli::try_parse_from(["pipewatch", "deploy"]).is_err());
    }
}
