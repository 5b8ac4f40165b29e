use anyhow::Context;
use clap::{Parser, Subcommand};
use code_sandbox::{
    ExecutionFilter, ExecutionStatus, IsolationPolicy, Language, SandboxConfig, SandboxManager,
    SecurityLevel, SubmitRequest,
};
use std::{io::Read, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sandbox configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Isolation policy: container-only, prefer-container or local-only
    #[arg(short, long, global = true)]
    isolation: Option<IsolationPolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze and run a snippet, printing the execution record as JSON
    Run {
        /// Source file; reads stdin when omitted or "-"
        file: Option<PathBuf>,

        #[arg(short, long)]
        language: Language,

        /// Run-step timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Highest security level allowed to run
        #[arg(short, long)]
        security_level: Option<SecurityLevel>,
    },
    /// Score a snippet for risk and quality without running it
    Analyze {
        file: Option<PathBuf>,

        #[arg(short, long)]
        language: Language,
    },
    /// List supported languages and their execution profiles
    Languages,
}

fn read_source(file: Option<&PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("reading stdin")?;
            Ok(code)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SandboxConfig> {
    let mut config = match &cli.config {
        Some(path) => SandboxConfig::from_file(path)?,
        None => SandboxConfig::default(),
    };
    if let Some(isolation) = cli.isolation {
        config.isolation = isolation;
    }
    Ok(config)
}

/// Kill whatever is still running when the user hits Ctrl-C
fn kill_on_interrupt(manager: Arc<SandboxManager>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let running = manager
            .list(&ExecutionFilter {
                status: Some(ExecutionStatus::Running),
                ..Default::default()
            })
            .await;
        for execution in running {
            warn!("Interrupted, killing {}", execution.id);
            manager.kill(&execution.id).await;
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Command::Run {
            file,
            language,
            timeout,
            security_level,
        } => {
            let code = read_source(file.as_ref())?;
            let manager = Arc::new(SandboxManager::new(config).await?);
            kill_on_interrupt(manager.clone());

            let mut request = SubmitRequest::new(code, *language);
            if let Some(level) = security_level {
                request = request.with_security_level(*level);
            }
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(*secs));
            }

            let execution = manager.submit(request).await?;
            info!("Execution {} finished as {}", execution.id, execution.status);
            println!("{}", serde_json::to_string_pretty(&execution)?);

            let code = match (execution.status, execution.exit_code) {
                (ExecutionStatus::Completed, Some(code)) => code.clamp(0, 255) as u8,
                (ExecutionStatus::Completed, None) => 0,
                _ => 1,
            };
            Ok(ExitCode::from(code))
        }
        Command::Analyze { file, language } => {
            let code = read_source(file.as_ref())?;
            let manager = SandboxManager::new(config).await?;
            let report = manager.analyze(&code, *language)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Languages => {
            let manager = SandboxManager::new(config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&manager.language_profiles())?
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
