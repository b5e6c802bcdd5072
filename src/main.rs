use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ultra_orchestrator::cli::commands;
use ultra_orchestrator::cli::commands::run::RunOptions;
use ultra_orchestrator::cli::load_config;

#[derive(Parser)]
#[command(name = "ultra")]
#[command(
    version,
    about = "Multi-provider LLM orchestration with peer review and failover"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use this config file instead of the global and project layers
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a prompt through the three-stage pipeline
    Run {
        #[arg(help = "Prompt text, or - to read stdin")]
        prompt: String,
        #[arg(
            long = "model",
            short = 'm',
            help = "Model to query (repeatable; registry name or provider/model)"
        )]
        models: Vec<String>,
        #[arg(long, short, help = "Pipeline pattern: ultra, quick")]
        pattern: Option<String>,
        #[arg(long, help = "Overall deadline in seconds")]
        timeout: Option<u64>,
        #[arg(long, help = "Max output tokens per call")]
        max_tokens: Option<u32>,
        #[arg(long, help = "Sampling temperature (0.0-2.0)")]
        temperature: Option<f32>,
        #[arg(long, help = "System prompt for every call")]
        system: Option<String>,
        #[arg(long, help = "Print the full result as JSON")]
        json: bool,
    },

    /// List registered models or map one across providers
    Models {
        #[arg(long, help = "Only list models of this provider")]
        provider: Option<String>,
        #[arg(long, help = "Show the equivalent of this model on every provider")]
        map: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Probe every configured provider
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(long, help = "Output as JSON instead of TOML")]
        json: bool,
    },
    /// Show configuration file paths
    Path,
    /// Write a starter configuration
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31multra encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Call default hook for backtrace (if RUST_BACKTRACE=1)
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` means the command ran but the outcome was a failure
fn run_cli() -> anyhow::Result<bool> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // `config init` and `config path` work without a valid config
    if let Commands::Config { action } = &cli.command {
        match action {
            ConfigAction::Path => {
                commands::config::path()?;
                return Ok(true);
            }
            ConfigAction::Init { global, force } => {
                commands::config::init(*global, *force)?;
                return Ok(true);
            }
            ConfigAction::Show { .. } => {}
        }
    }

    let config = load_config(cli.config.as_deref())?;

    let ok = match cli.command {
        Commands::Run {
            prompt,
            models,
            pattern,
            timeout,
            max_tokens,
            temperature,
            system,
            json,
        } => commands::run::run(
            &config,
            RunOptions {
                prompt,
                models,
                pattern,
                timeout_secs: timeout,
                max_tokens,
                temperature,
                system,
                json,
            },
        )?,
        Commands::Models {
            provider,
            map,
            json,
        } => {
            commands::models::run(&config, provider.as_deref(), map.as_deref(), json)?;
            true
        }
        Commands::Health { json } => commands::health::run(&config, json)?,
        Commands::Config { action } => {
            if let ConfigAction::Show { json } = action {
                commands::config::show(&config, json)?;
            }
            true
        }
    };

    Ok(ok)
}
