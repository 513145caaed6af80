use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use resilience_runtime::config::loader::load_config;
use resilience_runtime::policy::codec;
use resilience_runtime::{Policy, ResilienceError};

#[derive(Parser)]
#[command(name = "policy-cli")]
#[command(about = "Offline tooling for resilience policy files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// Stable single-line JSON
    Json,
    /// Pretty TOML
    Toml,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a runtime configuration file
    Validate { file: PathBuf },
    /// Print the policies of a configuration file in a given form
    Show {
        file: PathBuf,
        /// Only this policy
        #[arg(short, long)]
        policy: Option<String>,
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,
    },
    /// Decode a single serialized policy and report every violation
    Check { file: PathBuf },
}

fn encode(policy: &Policy, format: Format) -> Result<String, ResilienceError> {
    match format {
        Format::Json => codec::to_json(policy),
        Format::Toml => codec::to_pretty(policy),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let config = load_config(&file)?;
            println!("{}: {} policies OK", file.display(), config.policies.len());
        }
        Commands::Show {
            file,
            policy,
            format,
        } => {
            let config = load_config(&file)?;
            let selected: Vec<&Policy> = config
                .policies
                .iter()
                .filter(|p| policy.as_deref().map_or(true, |name| p.name == name))
                .collect();
            if selected.is_empty() {
                return Err(Box::new(ResilienceError::PolicyNotFound(
                    policy.unwrap_or_default(),
                )));
            }
            for p in selected {
                println!("{}", encode(p, format)?);
            }
        }
        Commands::Check { file } => {
            let content = std::fs::read_to_string(&file)?;
            let decoded = if file.extension().is_some_and(|ext| ext == "json") {
                codec::from_json(&content)
            } else {
                codec::from_pretty(&content)
            };
            match decoded {
                Ok(policy) => println!("{}: policy '{}' OK", file.display(), policy.name),
                Err(ResilienceError::Validation(errors)) => {
                    for violation in errors.violations() {
                        eprintln!("{}", violation);
                    }
                    std::process::exit(1);
                }
                Err(e) => return Err(Box::new(e)),
            }
        }
    }

    Ok(())
}
