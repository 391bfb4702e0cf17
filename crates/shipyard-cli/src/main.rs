//! Shipyard CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Staged build/deploy pipeline engine", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, env = "SHIPYARD_CONFIG", default_value = "shipyard.kdl")]
    config: String,

    /// PostgreSQL URL; overrides the store in the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run worker pools for every stage until interrupted
    Run,
    /// Submit a pipeline run
    Submit {
        /// Project identifier; runs of one project never overlap
        #[arg(long)]
        project: String,
        /// Repository URL
        #[arg(long)]
        repo: String,
        /// Branch to build
        #[arg(long, default_value = "main")]
        branch: String,
        /// Project type (ink-contract or dapp)
        #[arg(long = "type", default_value = "dapp")]
        project_type: String,
        /// Framework of a dapp (vite, nextjs, svelte, sveltekit)
        #[arg(long)]
        framework: Option<String>,
    },
    /// Show queue counts and recent jobs
    Inspect {
        /// Only this stage
        #[arg(long)]
        queue: Option<String>,
        /// Only jobs in this state
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of jobs to show per queue
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Validate an engine configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "shipyard.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let options = commands::StoreOptions {
        config_path: cli.config,
        database_url: cli.database_url,
    };

    match cli.command {
        Commands::Run => {
            commands::run::run(&options).await?;
        }
        Commands::Submit {
            project,
            repo,
            branch,
            project_type,
            framework,
        } => {
            let request = shipyard_scheduler::SubmitPipeline {
                project_id: project,
                repo_url: repo,
                branch,
                project_type,
                framework,
            };
            commands::submit::submit(&options, request).await?;
        }
        Commands::Inspect {
            queue,
            state,
            limit,
        } => {
            commands::inspect::inspect(&options, queue.as_deref(), state.as_deref(), limit)
                .await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}
