mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pilotdeck")]
#[command(about = "Browser control and tool-call correlation for agent runtimes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration, browser and hook status
    Status,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Drive the shared browser (coordinates are normalized to 0-1000)
    Browse {
        #[command(subcommand)]
        command: BrowseCommands,
    },

    /// Execute a tool directly with JSON params
    Run {
        /// Tool name (e.g. "browser")
        tool: String,

        /// Tool parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Reset the config file to defaults
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Subcommand)]
pub enum BrowseCommands {
    /// Open a URL
    Navigate { url: String },
    /// Click at a normalized point
    Click { x: f64, y: f64 },
    /// Click a point and type text into it
    Type {
        x: f64,
        y: f64,
        text: String,
        /// Press Enter after typing
        #[arg(long)]
        enter: bool,
        /// Keep the field's existing content
        #[arg(long)]
        append: bool,
    },
    /// Drag from one normalized point to another
    Drag { x: f64, y: f64, to_x: f64, to_y: f64 },
    /// Scroll the page, or the element under --at X Y
    Scroll {
        #[arg(value_enum)]
        direction: Direction,
        /// Pixels to scroll
        #[arg(short, long, default_value_t = 400.0)]
        amount: f64,
        /// Scroll at a normalized point instead of the page center
        #[arg(long, num_args = 2, value_names = ["X", "Y"])]
        at: Option<Vec<f64>>,
    },
    /// Run a script body (use `return` for the result)
    Eval { code: String },
    /// Print the page's accessibility snapshot
    Snapshot {
        /// Open this URL first
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config_cmd::show().await?,
            ConfigCommands::Path => commands::config_cmd::path().await?,
            ConfigCommands::Reset { force } => commands::config_cmd::reset(force).await?,
        },
        Commands::Browse { command } => {
            commands::browse::run(command).await?;
        }
        Commands::Run { tool, params } => {
            commands::run_cmd::tool(&tool, &params).await?;
        }
    }

    Ok(())
}
