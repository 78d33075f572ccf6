mod commands;
mod signal;

use clap::{Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_SETUP_ERROR};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use testbed_schema::BackendKind;

#[derive(Debug, Parser)]
#[command(
    name = "testbed",
    version,
    about = "Run ECU software under namespace, container, or host execution environments"
)]
struct Cli {
    /// Path to the testbed configuration file.
    #[arg(long, short, default_value = "testbed.toml", global = true)]
    config: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Set up an environment, run one command in it, and tear it down.
    Run {
        /// Override the configured backend (namespace, container, none).
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Override the configured workspace directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Stop the process if it is still running after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Working directory inside the environment.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra environment variable for the process (KEY=VALUE, repeatable).
        #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Command and arguments to run.
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Check host prerequisites for each backend.
    Doctor {
        /// Report only on this backend.
        #[arg(long)]
        backend: Option<BackendKind>,
    },
    /// Validate the configuration file and print it with defaults applied.
    Check,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn,testbed::output=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TESTBED_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .without_time()
        .init();

    signal::install_signal_handler();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Run {
            backend,
            workspace,
            timeout,
            cwd,
            env,
            command,
        } => commands::load_config(&cli.config, backend, workspace).and_then(|config| {
            commands::run::run(
                &config,
                &command,
                &commands::run::RunOptions {
                    timeout,
                    cwd,
                    env,
                },
                json_output,
            )
        }),
        Commands::Doctor { backend } => commands::doctor::run(&cli.config, backend, json_output),
        Commands::Check => commands::check::run(&cli.config),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:")
                || msg.starts_with("failed to parse config")
                || msg.starts_with("failed to read config")
            {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("setup failed:") || msg.starts_with("missing prerequisites")
            {
                EXIT_SETUP_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
