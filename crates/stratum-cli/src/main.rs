mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_KUBEFILE_ERROR, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;
use stratum_core::{BuildMode, BuildOptions, StratumConfig};

#[derive(Debug, Parser)]
#[command(
    name = "stratum",
    version,
    about = "Layered, content-addressed cluster image builder"
)]
struct Cli {
    /// Path to the Stratum store directory (overrides the config file).
    #[arg(long)]
    store: Option<String>,

    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

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
    /// Build a cluster image from a context directory.
    Build {
        /// Name (and tag) of the resulting image, e.g. "my-app:v1".
        #[arg(short = 't', long = "tag")]
        name: String,
        /// Kubefile to build from, relative to the context.
        #[arg(short = 'f', long = "file")]
        kubefile: Option<String>,
        /// Build mode: "local" aborts on the first failed instruction,
        /// "lite" skips failed RUN/CMD layers.
        #[arg(long, default_value = "local")]
        mode: BuildMode,
        /// Execute every layer even if a cached one exists.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Build context directory.
        #[arg(default_value = ".")]
        context: PathBuf,
    },
    /// List images in the store.
    Images,
    /// Show an image's layers and annotations.
    Inspect {
        /// Image name.
        name: String,
    },
    /// Remove an image name from the store.
    Rmi {
        /// Image name.
        name: String,
    },
    /// Run diagnostic checks on the system and store.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATUM_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let store_path = cli
        .store
        .as_deref()
        .map(expand_tilde)
        .or_else(|| config.store_root.clone())
        .unwrap_or_else(|| expand_tilde("~/.local/share/stratum"));
    let json_output = cli.json;
    tracing::debug!("using store {}", store_path.display());

    if matches!(cli.command, Commands::Build { .. })
        && std::env::var("STRATUM_SKIP_PREREQS").as_deref() != Ok("1")
    {
        let mut missing = Vec::new();
        if config.executor.backend == "overlay" {
            missing.extend(stratum_runtime::check_overlay_prereqs());
        }
        if config.registry.bind_dir.is_some() {
            missing.extend(stratum_runtime::check_cluster_prereqs(
                &config.executor.kubectl,
            ));
        }
        if !missing.is_empty() {
            eprintln!("error: {}", stratum_runtime::format_missing(&missing));
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    let result = match cli.command {
        Commands::Build {
            name,
            kubefile,
            mode,
            no_cache,
            context,
        } => commands::build::run(
            &config,
            &store_path,
            &name,
            &context,
            kubefile.as_deref(),
            BuildOptions { mode, no_cache },
            json_output,
        ),
        Commands::Images => commands::images::run(&store_path, json_output),
        Commands::Inspect { name } => commands::inspect::run(&store_path, &name, json_output),
        Commands::Rmi { name } => commands::rmi::run(&store_path, &name, json_output),
        Commands::Doctor => commands::doctor::run(&config, &store_path, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.contains("kubefile error:") {
                EXIT_KUBEFILE_ERROR
            } else if msg.contains("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<StratumConfig, String> {
    let path = match explicit {
        Some(p) => {
            if !p.exists() {
                return Err(format!("config file {} not found", p.display()));
            }
            p.to_path_buf()
        }
        None => match StratumConfig::default_path() {
            Some(p) => p,
            None => return Ok(StratumConfig::default()),
        },
    };
    StratumConfig::load(&path).map_err(|e| e.to_string())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
