//! `provisionflow` command-line front end.
//!
//! Wires the pipeline catalog to `kubectl`, `helm` and `psql` and maps the
//! run report to the process exit status.

#![forbid(unsafe_code)]

mod adapters;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, warn, Level};

use provisionflow::cancellation::CancellationToken;
use provisionflow::config::EnvironmentConfig;
use provisionflow::events::LoggingEventSink;
use provisionflow::observability::{init_tracing, LogFormat};
use provisionflow::pipeline::{PipelineCatalog, Provisioner, EXIT_CONFIG, EXIT_SUCCESS};

use adapters::ToolConfig;
use output::{render_catalog, render_names, render_report, ReportFormat};

#[derive(Debug, Parser)]
#[command(name = "provisionflow")]
#[command(author, version, about = "Provision and reset dataspace environments")]
struct Cli {
    /// Environment configuration file (YAML, or JSON by extension)
    #[arg(short, long, global = true, default_value = "environment.yaml")]
    config: PathBuf,

    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    /// Report output format
    #[arg(long, global = true, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,

    /// Path to kubectl
    #[arg(long, global = true, default_value = "kubectl")]
    kubectl: PathBuf,

    /// Path to helm
    #[arg(long, global = true, default_value = "helm")]
    helm: PathBuf,

    /// Cluster context to target instead of the current one
    #[arg(long, global = true)]
    kube_context: Option<String>,

    /// Timeout in seconds for short cluster and database calls
    #[arg(long, global = true, default_value_t = 60)]
    command_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision a pipeline, skipping stages already in place
    Run {
        /// Pipeline name (see `list`)
        pipeline: String,
    },
    /// Tear down everything a pipeline provisions, in reverse order
    Reset {
        /// Pipeline name (see `list`)
        pipeline: String,
    },
    /// List the pipelines for this environment
    List,
    /// Validate the configuration and print the derived resource names
    Validate,
}

impl Cli {
    fn tools(&self) -> ToolConfig {
        ToolConfig {
            kubectl: self.kubectl.clone(),
            helm: self.helm.clone(),
            context: self.kube_context.clone(),
            command_timeout: Duration::from_secs(self.command_timeout),
        }
    }
}

/// Cancels the run on the first interrupt. The current stage finishes first.
fn cancel_on_interrupt() -> Arc<CancellationToken> {
    let cancel = Arc::new(CancellationToken::new());
    let token = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next stage");
            token.cancel("interrupted");
        }
    });
    cancel
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = EnvironmentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match &cli.command {
        Command::List => {
            let catalog = PipelineCatalog::from_config(&config)?;
            print!("{}", render_catalog(&catalog));
            Ok(EXIT_SUCCESS)
        }
        Command::Validate => {
            let catalog = PipelineCatalog::from_config(&config)?;
            println!("{}", render_names(catalog.resource_names())?);
            Ok(EXIT_SUCCESS)
        }
        Command::Run { pipeline } | Command::Reset { pipeline } => {
            let provisioner = Provisioner::new(&config, cli.tools().collaborators())?
                .with_event_sink(Arc::new(LoggingEventSink::new(Level::INFO)))
                .with_cancel_token(cancel_on_interrupt());
            let report = if matches!(cli.command, Command::Run { .. }) {
                provisioner.run(pipeline).await?
            } else {
                provisioner.reset(pipeline).await?
            };
            println!("{}", render_report(&report, cli.report)?);
            Ok(report.exit_code())
        }
    }
}

/// Codes outside the byte range collapse to a generic failure.
fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match execute(cli).await {
        Ok(code) => ExitCode::from(exit_byte(code)),
        Err(err) => {
            error!(error = %format!("{err:#}"), "Aborted before running any stage");
            eprintln!("error: {err:#}");
            ExitCode::from(exit_byte(EXIT_CONFIG))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "provisionflow",
            "--config",
            "env.yaml",
            "--report",
            "json",
            "--log-format",
            "json",
            "run",
            "dataspace",
        ]);
        assert_eq!(cli.report, ReportFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Run { ref pipeline } if pipeline == "dataspace"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["provisionflow", "reset", "connector-alpha", "--kube-context", "kind"]);
        assert_eq!(cli.kube_context.as_deref(), Some("kind"));
        assert_eq!(cli.tools().command_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_exit_byte() {
        assert_eq!(exit_byte(EXIT_SUCCESS), 0);
        assert_eq!(exit_byte(3), 3);
        assert_eq!(exit_byte(-1), 1);
    }

    #[tokio::test]
    async fn test_missing_config_is_a_config_error() {
        let cli = Cli::parse_from(["provisionflow", "--config", "/nonexistent/env.yaml", "list"]);
        assert!(execute(cli).await.is_err());
    }
}
