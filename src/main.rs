
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use noema::runner::{validate_target_url, CognitiveRunController, RunHandle, RunOptions};
use noema::{NoemaConfig, NoemaContext};

#[derive(Parser, Debug)]
#[command(name = "noema", version, about = "Persistent, self-improving QA agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API server
    Serve {
        /// Override NOEMA_API_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Execute a single run from the command line and print the report
    Run {
        /// Natural-language test goal
        goal: String,
        /// Target URL
        url: String,
        /// Launch the experience optimizer after the run
        #[arg(long)]
        optimize: bool,
    },
    /// Print the agent's identity
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("noema=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = NoemaConfig::from_env();

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.api_port = port;
            }
            let ctx = NoemaContext::initialize(config).await?;
            noema::server::serve(ctx).await
        }
        Command::Run { goal, url, optimize } => {
            if let Err(message) = validate_target_url(&url) {
                anyhow::bail!(message);
            }
            let ctx = NoemaContext::initialize(config).await?;

            let run_id = noema::store::new_id();
            let handle = RunHandle::new(&run_id, &goal, &url);
            ctx.runs.insert(handle.clone());
            info!(run = %run_id, "starting run");

            let controller = CognitiveRunController::new(
                ctx.clone(),
                handle,
                RunOptions {
                    goal,
                    url,
                    enable_optimization: optimize,
                    budgets: ctx.config.budgets.clone(),
                },
            );
            let report = controller.run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Identity => {
            let ctx = NoemaContext::initialize(config).await?;
            let view = ctx.identity.view().await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
    }
}
