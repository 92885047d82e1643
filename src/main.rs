//! Warden - guard hooks for autonomous agents
//!
//! Hook entry points for the host agent plus operator commands for
//! inspecting rules, classifications and API health.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use warden::breaker::{CircuitBreaker, CircuitState, SourceHealth};
use warden::classifier::CallOutcome;
use warden::config::{self, ConfigLocations, WardenConfig};
use warden::hooks::{self, HookKind};
use warden::policy::{PolicyDecision, Priority, Section};
use warden::WardenError;

#[derive(Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Guard hooks for autonomous agents", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a hook: read one tool call from stdin, print the decision
    Hook {
        /// Hook to run
        #[arg(value_enum)]
        kind: HookKind,
    },

    /// Evaluate one command or path against the active rules
    Check {
        /// Rule section: bash, write or read
        section: Section,

        /// Command (bash) or file path (write, read)
        subject: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify the outcome of a command
    Classify {
        /// The command that ran
        #[arg(short, long)]
        command: String,

        /// Its exit code
        #[arg(short, long, allow_negative_numbers = true)]
        exit_code: i32,

        /// Its output (read from stdin when absent)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Show or change API source health
    Health {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(subcommand)]
        action: Option<HealthAction>,
    },

    /// List active rules in evaluation order
    Rules {
        /// Only list this section
        #[arg(short, long)]
        section: Option<Section>,

        #[command(subcommand)]
        action: Option<RulesAction>,
    },
}

#[derive(Subcommand)]
enum HealthAction {
    /// Close the circuit for a source
    Reset {
        /// API source name
        source: String,
    },

    /// Record the outcome of a call
    Record {
        /// API source name
        source: String,

        /// Call outcome
        #[arg(value_enum)]
        outcome: CallOutcome,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Parse configuration files and report errors
    Validate,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "warden=debug,info"
    } else {
        "warden=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Hook stdout carries the protocol, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let project_path = cli
        .project
        .canonicalize()
        .or_else(|_| std::path::absolute(&cli.project))
        .unwrap_or_else(|_| cli.project.clone());

    if let Commands::Hook { kind } = cli.command {
        // Hooks always answer, even for a missing project directory
        let config = WardenConfig::load(&project_path);
        let mut raw = String::new();
        if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
            tracing::warn!("Could not read hook input: {}", e);
        }
        println!("{}", hooks::run_hook(kind, &raw, &config).to_json());
        return Ok(());
    }

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }
    let config = WardenConfig::load(&project_path);

    match cli.command {
        Commands::Hook { .. } => {}

        Commands::Check {
            section,
            subject,
            json,
        } => {
            let decision = config.policy_engine().check(section, &subject);
            if json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                print_decision(&decision);
            }
            if decision.is_blocked() {
                std::process::exit(2);
            }
        }

        Commands::Classify {
            command,
            exit_code,
            output,
        } => {
            let output = match output {
                Some(output) => output,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read command output from stdin")?;
                    buf
                }
            };
            let classification = config.error_classifier().classify(&command, &output, exit_code);
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }

        Commands::Health { json, action } => {
            let breaker = CircuitBreaker::new(config.state_store(), config.breaker.clone());
            match action {
                None => {
                    let table = breaker.summary().unwrap_or_else(|e| fail(e));
                    if json {
                        println!("{}", serde_json::to_string_pretty(&table)?);
                    } else if table.is_empty() {
                        println!("{} No API sources recorded yet", "Health:".cyan().bold());
                    } else {
                        println!("\n{} API Source Health", "Health:".cyan().bold());
                        println!("{}", "─".repeat(60));
                        for (source, health) in &table {
                            print_health(source, health);
                        }
                    }
                }
                Some(HealthAction::Reset { source }) => {
                    let health = breaker.reset(&source).unwrap_or_else(|e| fail(e));
                    if json {
                        println!("{}", serde_json::to_string_pretty(&health)?);
                    } else {
                        println!("{} Circuit closed for {}", "OK".green().bold(), source);
                    }
                }
                Some(HealthAction::Record { source, outcome }) => {
                    let health = breaker
                        .record_result(&source, outcome)
                        .unwrap_or_else(|e| fail(e));
                    if json {
                        println!("{}", serde_json::to_string_pretty(&health)?);
                    } else {
                        print_health(&source, &health);
                    }
                }
            }
        }

        Commands::Rules {
            action: Some(RulesAction::Validate),
            ..
        } => {
            let locations = ConfigLocations::for_project(&project_path);
            if !validate_config(&locations) {
                std::process::exit(1);
            }
        }

        Commands::Rules {
            section,
            action: None,
        } => {
            let engine = config.policy_engine();
            println!(
                "\n{} {} (preset '{}', level {})",
                "Rules:".cyan().bold(),
                engine.source(),
                engine.selection().preset,
                engine.selection().level
            );
            let sections: Vec<Section> = match section {
                Some(section) => vec![section],
                None => Section::all().to_vec(),
            };
            for section in sections {
                println!("\n{} {}", "Section:".bold(), section);
                println!("{}", "─".repeat(60));
                let rules = engine.rules(section);
                if rules.is_empty() {
                    println!("   (no active rules)");
                }
                for rule in rules {
                    println!(
                        "   {} {:<24} {} {}",
                        colored_priority(rule.priority),
                        rule.id,
                        format!("{:<20}", rule.guard_tag).dimmed(),
                        rule.matcher.kind()
                    );
                }
            }
        }
    }

    Ok(())
}

fn fail(err: WardenError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), err);
    if err.is_state_error() {
        eprintln!("   Inspect or remove the file under state/ to recover");
    }
    std::process::exit(err.exit_code());
}

fn print_decision(decision: &PolicyDecision) {
    match decision {
        PolicyDecision::Allow => println!("{} Allowed", "OK".green().bold()),
        PolicyDecision::Block {
            rule_id,
            reason,
            guard_tag,
        } => {
            println!("{} {}", "Blocked:".red().bold(), reason);
            println!("   rule: {} ({})", rule_id, guard_tag);
        }
    }
}

fn print_health(source: &str, health: &SourceHealth) {
    let label = format!("{:<10}", health.state);
    let state = match health.state {
        CircuitState::Closed => label.green(),
        CircuitState::HalfOpen => label.yellow(),
        CircuitState::Open => label.red(),
    };
    let cooldown = health
        .cooldown_until
        .map(|t| format!(" until {}", t.to_rfc3339()))
        .unwrap_or_default();
    println!(
        "   {:<16} {} failures: {}{}",
        source, state, health.consecutive_failures, cooldown
    );
}

fn colored_priority(priority: Priority) -> colored::ColoredString {
    let label = format!("{:<9}", priority);
    match priority {
        Priority::Critical => label.red().bold(),
        Priority::High => label.red(),
        Priority::Medium => label.yellow(),
        Priority::Low => label.normal(),
    }
}

fn validate_config(locations: &ConfigLocations) -> bool {
    let results = config::validate_files(locations);
    if results.is_empty() {
        println!(
            "{} No configuration files found, built-in defaults apply",
            "OK".green().bold()
        );
        return true;
    }
    let mut valid = true;
    for (path, outcome) in &results {
        match outcome {
            Ok(()) => println!("{} {}", "OK".green().bold(), path.display()),
            Err(e) => {
                valid = false;
                eprintln!("{} {}: {}", "Invalid:".red().bold(), path.display(), e);
            }
        }
    }
    valid
}
