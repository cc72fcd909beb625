//! fclocal - run cloud functions locally in containers

mod commands;

use clap::{Parser, Subcommand};
use fclocal_config::GlobalConfig;
use fclocal_core::{ContainerManager, ShutdownCoordinator};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status after an interrupt-driven cleanup
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "fclocal")]
#[command(author, version, about = "Local function runner", long_about = None)]
struct Cli {
    /// Verbose output (also enabled by FCLOCAL_VERBOSE > 0)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DebugArgs {
    /// Start the runtime under a debugger listening on this port
    #[arg(short = 'd', long = "debug-port")]
    pub debug_port: Option<u16>,

    /// IDE that attaches to the debugger (vscode or pycharm)
    #[arg(long, default_value = "vscode")]
    pub debug_ide: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Invoke a function once
    Invoke {
        /// Function definition file (.toml or .json)
        definition: PathBuf,
        /// Event payload
        #[arg(short, long, conflicts_with = "event_file")]
        event: Option<String>,
        /// Read the event payload from a file, '-' for stdin
        #[arg(short = 'f', long)]
        event_file: Option<PathBuf>,
        /// Pass the event on the command line instead of stdin
        #[arg(long)]
        inline_event: bool,
        #[command(flatten)]
        debug: DebugArgs,
        /// Host directory mounted on /tmp
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
        /// Value for FC_HTTP_PARAMS
        #[arg(long)]
        http_params: Option<String>,
        /// Run the agent in HTTP mode
        #[arg(long)]
        http: bool,
        /// Skip the initializer
        #[arg(long)]
        no_initializer: bool,
    },

    /// Start the long-running local server for a function
    Start {
        /// Function definition file (.toml or .json)
        definition: PathBuf,
        #[command(flatten)]
        debug: DebugArgs,
        /// Host directory mounted on /tmp
        #[arg(long)]
        tmp_dir: Option<PathBuf>,
    },

    /// Run commands in a dependency installation container
    Install {
        /// Runtime name, e.g. python3
        #[arg(short, long)]
        runtime: String,
        /// Code directory mounted on /code
        #[arg(long, default_value = ".")]
        code_uri: PathBuf,
        /// Extra install dir as <host dir>:<container dir>
        #[arg(short, long = "target")]
        targets: Vec<String>,
        /// Use this image instead of the runtime build image
        #[arg(long)]
        image: Option<String>,
        /// Working directory inside the container
        #[arg(long, default_value = "/code")]
        cwd: String,
        /// Environment variables as KEY=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Command to run
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Open a sandbox shell in a runtime container
    Sbox {
        /// Runtime name, e.g. nodejs8
        #[arg(short, long)]
        runtime: String,
        /// Code directory mounted on /code
        #[arg(long)]
        code_uri: Option<PathBuf>,
        /// Command string to run instead of a shell
        #[arg(short, long)]
        cmd: Option<String>,
        /// Environment variables as KEY=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Keep stdin open
        #[arg(short, long)]
        interactive: bool,
        /// Allocate a pseudo-TTY
        #[arg(short, long)]
        tty: bool,
        /// Use this image instead of the runtime build image
        #[arg(long)]
        image: Option<String>,
    },

    /// Build an image from a context directory
    Build {
        /// Build context directory
        #[arg(long, default_value = ".")]
        context: PathBuf,
        /// Dockerfile inside the context
        #[arg(long)]
        dockerfile: Option<PathBuf>,
        /// Image tag
        #[arg(long)]
        tag: String,
    },

    /// Pull an image by reference or runtime name
    Pull {
        /// Image reference
        #[arg(required_unless_present = "runtime")]
        image: Option<String>,
        /// Pull the image of this runtime instead
        #[arg(short, long, conflicts_with = "image")]
        runtime: Option<String>,
        /// With --runtime, pull the build image
        #[arg(long)]
        build: bool,
    },

    /// Copy a path out of an image
    Copy {
        /// Source image
        #[arg(long)]
        image: String,
        /// Path inside the image
        #[arg(long)]
        from: String,
        /// Host destination directory
        #[arg(long)]
        to: PathBuf,
    },
}

fn verbose_from_env() -> bool {
    std::env::var("FCLOCAL_VERBOSE")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .is_some_and(|level| level > 0)
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    // The stdin reader thread of a sandbox session may still block in read
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let verbose = cli.verbose || verbose_from_env();
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = GlobalConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring global config: {}", e);
        GlobalConfig::default()
    });

    // Parse local inputs before touching the engine
    let command = commands::prepare(cli.command)?;

    let engine = fclocal_provider::create_engine(&config.engine).await?;
    let shutdown = ShutdownCoordinator::new(engine.clone());
    let signal_task = shutdown.install_signal_handler();
    let manager = ContainerManager::new(engine, shutdown.clone(), &config);

    let outcome = tokio::select! {
        result = commands::execute(&manager, command, verbose) => Some(result),
        _ = shutdown.finished() => None,
    };
    signal_task.abort();

    if shutdown.is_stopping() {
        shutdown.finished().await;
        return Ok(INTERRUPTED_EXIT_CODE);
    }
    match outcome {
        Some(result) => result,
        None => Ok(INTERRUPTED_EXIT_CODE),
    }
}
