use clap::{CommandFactory, Parser, Subcommand};
use please::commands::{
    cmd_clear, cmd_config, cmd_doctor, cmd_generate, cmd_history, cmd_last, cmd_refine,
    GenerateOptions,
};
use please::config::{load_config, Config};
use please::error::PleaseError;
use please::types::ScriptType;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Turn a task description into a script, with a risk review attached.
/// Scripts are printed, never run.
#[derive(Debug, Parser)]
#[command(name = "please", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Provider to use (ollama, openai, anthropic)
    #[arg(long)]
    provider: Option<String>,

    /// Model name; falls back to the provider default if unsupported
    #[arg(short, long)]
    model: Option<String>,

    /// Script type: bash, powershell, command, python or auto
    #[arg(short = 't', long = "type")]
    script_type: Option<ScriptType>,

    /// Directory the script should assume it runs in
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Log pipeline stages to stderr
    #[arg(short, long)]
    verbose: bool,

    /// What the script should do
    task: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show recently generated scripts
    History {
        /// Number of entries to show
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Only show scripts from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,
    },
    /// Print the most recent script again
    Last {
        /// Also save it, to FILE or a name derived from the task
        #[arg(long, value_name = "FILE")]
        save: Option<Option<PathBuf>>,
    },
    /// Ask for a changed version of the most recent script
    Refine {
        /// Provider to use instead of the one that wrote the script
        #[arg(long)]
        provider: Option<String>,
        /// Model to use instead of the one that wrote the script
        #[arg(short, long)]
        model: Option<String>,
        /// What to change
        #[arg(required = true)]
        request: Vec<String>,
    },
    /// Delete all stored scripts
    Clear,
    /// Check providers, history and config
    Doctor,
    /// Open the config file in $EDITOR
    Config,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "please=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli, config: &Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::History { count, since_hours }) => {
            cmd_history(config, count, since_hours).await
        }
        Some(Commands::Last { save }) => cmd_last(save).await,
        Some(Commands::Refine {
            provider,
            model,
            request,
        }) => {
            let options = GenerateOptions {
                provider,
                model,
                ..GenerateOptions::default()
            };
            cmd_refine(&request.join(" "), config, options, cancel).await
        }
        Some(Commands::Clear) => cmd_clear().await,
        Some(Commands::Doctor) => cmd_doctor(config).await,
        Some(Commands::Config) => cmd_config(),
        None => {
            let task = cli.task.join(" ");
            if task.trim().is_empty() {
                Cli::command().print_help()?;
                return Ok(());
            }
            let options = GenerateOptions {
                provider: cli.provider,
                model: cli.model,
                script_type: cli.script_type,
                working_directory: cli.cwd,
            };
            cmd_generate(&task, config, options, cancel).await
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = tokio::select! {
        result = run(cli, &config, &cancel) => result,
        _ = cancel.cancelled() => Err(PleaseError::Cancelled.into()),
    };

    if let Err(e) = result {
        if e.downcast_ref::<PleaseError>().is_some_and(PleaseError::is_cancelled) {
            eprintln!("please: cancelled");
            std::process::exit(130);
        }
        eprintln!("please: {:#}", e);
        std::process::exit(1);
    }
}
