// CLI module - command-line argument parsing and handlers
//
// `agentd serve` runs the control-plane server (the default when no
// subcommand is given). `agentd config ...` provides config
// inspection/reset/edit commands.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::Command;

#[derive(Parser)]
#[command(name = "agentd")]
#[command(version = VERSION)]
#[command(about = "Local control-plane server for AI-CLI agent processes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control-plane server (default when no subcommand is given).
    Serve {
        /// Override the bind address (env: AGENTD_BIND).
        #[arg(long)]
        bind: Option<String>,

        /// Override the projects root directory (env: AGENTD_PROJECTS_DIR).
        #[arg(long)]
        projects_dir: Option<String>,

        /// Override the data directory (env: AGENTD_DATA_DIR).
        #[arg(long)]
        data_dir: Option<String>,

        /// Override the relay rendezvous URL (env: AGENTD_RELAY_URL).
        #[arg(long)]
        relay_url: Option<String>,
    },
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Open config file in $EDITOR
        #[arg(long)]
        edit: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Parsed result of the CLI: either the server should run (with whatever
/// `serve` overrides were given) or a one-shot command already ran and the
/// process should exit.
pub enum CliOutcome {
    Serve(ServeOverrides),
    Handled,
}

#[derive(Default)]
pub struct ServeOverrides {
    pub bind: Option<String>,
    pub projects_dir: Option<String>,
    pub data_dir: Option<String>,
    pub relay_url: Option<String>,
}

impl ServeOverrides {
    /// Apply `--flag` overrides on top of an already-loaded `Config`
    /// (which itself applied env > file > default precedence); CLI flags
    /// win over all three.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(bind) = self.bind {
            config.bind_addr = bind.parse().expect("invalid --bind address");
        }
        if let Some(dir) = self.projects_dir {
            config.projects_dir = dir.into();
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir.into();
        }
        if let Some(url) = self.relay_url {
            config.relay_url = Some(url);
        }
        config
    }
}

/// Parse argv and decide what to do. `Handled` means a command already ran
/// to completion (or exited the process directly) and `main` should return.
pub fn parse() -> CliOutcome {
    let cli = Cli::parse();

    match cli.command {
        None
        | Some(Commands::Serve {
            bind: None,
            projects_dir: None,
            data_dir: None,
            relay_url: None,
        }) => CliOutcome::Serve(ServeOverrides::default()),
        Some(Commands::Serve {
            bind,
            projects_dir,
            data_dir,
            relay_url,
        }) => CliOutcome::Serve(ServeOverrides {
            bind,
            projects_dir,
            data_dir,
            relay_url,
        }),
        Some(Commands::Config {
            show,
            reset,
            edit,
            path,
        }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else if reset {
                handle_config_reset();
            } else if edit {
                handle_config_edit();
            } else {
                println!("Usage: agentd config [--show|--reset|--edit|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --reset   Reset config file to defaults");
                println!("  --edit    Open config file in $EDITOR");
                println!("  --path    Show config file path");
            }
            CliOutcome::Handled
        }
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();

    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("bind_addr = {:?}", config.bind_addr.to_string());
    println!("projects_dir = {:?}", config.projects_dir.display().to_string());
    println!("data_dir = {:?}", config.data_dir.display().to_string());
    println!("relay_url = {:?}", config.relay_url);
    println!("agent_command = {:?}", config.agent_command);
    println!("idle_timeout_secs = {}", config.idle_timeout.as_secs());
    println!(
        "external_threshold_secs = {}",
        config.external_threshold.as_secs()
    );
    println!("watch_debounce_ms = {}", config.watch_debounce.as_millis());
    println!();
    println!("[logging]");
    println!("level = {:?}", config.logging.level);
    println!("file = {}", config.logging.file);

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if path.exists() {
        eprint!(
            "Config file exists at {}. Overwrite? [y/N] ",
            path.display()
        );
        std::io::stderr().flush().unwrap();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).unwrap();

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return;
        }
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Error creating directory: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = std::fs::write(&path, Config::default().to_toml()) {
        eprintln!("Error writing config: {}", e);
        std::process::exit(1);
    }

    println!("Config reset to defaults: {}", path.display());
}

fn handle_config_edit() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if !path.exists() {
        Config::ensure_config_exists();
        println!("Created new config file: {}", path.display());
    }

    let editor = std::env::var("EDITOR")
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| {
            if cfg!(windows) {
                "notepad".to_string()
            } else {
                "nano".to_string()
            }
        });

    println!("Opening {} with {}", path.display(), editor);

    let status = Command::new(&editor).arg(&path).status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            eprintln!("Editor exited with status: {}", s);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to launch editor '{}': {}", editor, e);
            eprintln!("Set $EDITOR environment variable to your preferred editor");
            std::process::exit(1);
        }
    }
}
