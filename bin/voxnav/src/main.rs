mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use voxnav_core::Paths;

#[derive(Parser)]
#[command(name = "voxnav")]
#[command(about = "Voice-driven web browsing agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Base directory for config, database and browser profiles (default ~/.voxnav)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent: audio intake, task pipeline and the HTTP query gateway
    Serve {
        /// Raw PCM s16le mono input: `-` for stdin or a file path
        #[arg(short, long)]
        input: Option<String>,

        /// Port to listen on (overrides config gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config gateway.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Segment a WAV recording and execute every command spoken in it
    Run {
        /// Mono 16-bit WAV file
        wav: PathBuf,
    },

    /// Execute a typed command, skipping transcription
    Say {
        /// The command, e.g. "go to example dot com then read the title"
        text: String,
    },

    /// Inspect the task history
    Tasks {
        #[command(subcommand)]
        command: TasksCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Run environment diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum TasksCommands {
    /// List recent tasks
    List {
        /// Only tasks in this state (idle, executing, succeeded, failed, aborted)
        #[arg(short, long)]
        state: Option<String>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one task with its step log (id or unique id prefix)
    Show { task_id: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a default config.json
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let paths = match cli.home {
        Some(home) => Paths::with_base(home),
        None => Paths::new(),
    };

    match cli.command {
        Commands::Serve { input, port, host } => {
            commands::serve::run(&paths, input, host, port).await?;
        }
        Commands::Run { wav } => {
            commands::run_cmd::wav(&paths, &wav).await?;
        }
        Commands::Say { text } => {
            commands::run_cmd::say(&paths, &text).await?;
        }
        Commands::Tasks { command } => match command {
            TasksCommands::List { state, limit } => {
                commands::tasks_cmd::list(&paths, state.as_deref(), limit)?;
            }
            TasksCommands::Show { task_id } => {
                commands::tasks_cmd::show(&paths, &task_id)?;
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show(&paths)?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(&paths, force)?;
            }
        },
        Commands::Doctor => {
            commands::doctor::run(&paths)?;
        }
    }

    Ok(())
}
