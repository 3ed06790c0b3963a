mod config;
mod logging;
mod run_cmd;
mod scenarios;

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use config::{CliOverrides, ConfigFile, DroverConfig};

#[derive(Parser)]
#[command(name = "drover", about = "Scripted test driver for applications under test")]
struct Cli {
    /// Config file (default: ./drover.toml, then ~/.config/drover/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Where to write it
        #[arg(long, default_value = config::LOCAL_CONFIG_FILE)]
        path: PathBuf,
        /// Target executable to record in the file
        #[arg(long)]
        executable: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List the built-in scenarios
    Scenarios,
    /// Run scenarios against the target
    Run {
        /// Scenario to run (repeatable; default: the first four built-ins)
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Number of full passes over the selection
        #[arg(long)]
        repeat: Option<u32>,
        /// Deterministic seed sent to the target after every start
        #[arg(long, conflicts_with = "random_seed")]
        seed: Option<u64>,
        /// Draw a seed at random (it is logged and recorded in the repro file)
        #[arg(long)]
        random_seed: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Re-issue a recorded repro file against a fresh target
    Replay {
        /// Path to a repro_steps_<timestamp>.json file
        file: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Target settings shared by `run` and `replay`.
#[derive(Args, Default)]
struct TargetArgs {
    /// Transport: pipe (alias cli) or http (overrides DROVER_TRANSPORT)
    #[arg(long)]
    transport: Option<String>,
    /// Target executable for the pipe transport (overrides DROVER_EXECUTABLE)
    #[arg(long)]
    executable: Option<PathBuf>,
    /// Endpoint for the http transport (overrides DROVER_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,
    /// Artifact directory (overrides DROVER_ARTIFACTS_DIR)
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    /// Per-command timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Step budget per scenario
    #[arg(long)]
    max_steps: Option<u32>,
}

impl TargetArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            transport: self.transport,
            executable: self.executable,
            endpoint: self.endpoint,
            artifacts_dir: self.artifacts_dir,
            action_timeout_ms: self.timeout_ms,
            max_steps: self.max_steps,
            ..CliOverrides::default()
        }
    }
}

/// Execute the `drover init` command: write a config file.
fn cmd_init(path: &Path, executable: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = ConfigFile::default();
    cfg.target.executable = executable;
    config::save_config(&cfg, path)?;

    println!("Config written to {}", path.display());
    match &cfg.target.executable {
        Some(exe) => println!("  target.executable = {}", exe.display()),
        None => println!("  target.executable is unset; edit the file or pass --executable"),
    }
    println!();
    println!("Next: run `drover scenarios` to see what can run, then `drover run`.");
    Ok(())
}

/// Execute the `drover scenarios` command: print the catalog.
fn cmd_scenarios() {
    for (idx, (name, description)) in scenarios::CATALOG.iter().enumerate() {
        let marker = if idx < scenarios::DEFAULT_SELECTION { "*" } else { " " };
        println!("{marker} {name:<26} {description}");
    }
    println!();
    println!("* runs by default");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Init {
            path,
            executable,
            force,
        } => {
            logging::init(None)?;
            cmd_init(&path, executable, force)?;
            0
        }
        Commands::Scenarios => {
            cmd_scenarios();
            0
        }
        Commands::Run {
            scenarios,
            repeat,
            seed,
            random_seed,
            target,
        } => {
            let overrides = CliOverrides {
                repeat,
                seed,
                ..target.into_overrides()
            };
            let resolved = DroverConfig::resolve(&overrides, cli.config.as_deref())?;
            run_cmd::run_suite(resolved, &scenarios, random_seed).await?
        }
        Commands::Replay { file, target } => {
            let resolved = DroverConfig::resolve(&target.into_overrides(), cli.config.as_deref())?;
            run_cmd::run_replay(resolved, &file).await?
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
