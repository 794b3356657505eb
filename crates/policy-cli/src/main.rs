//! Policy command line interface
//!
//! Offline checks for policy submissions: nothing here talks to a node.
//!
//! # Usage
//!
//! ```bash
//! # Digest of the raw submission text
//! policyctl hash --file rate_limited.pol
//!
//! # Restricted compile, as run on every incoming submission
//! policyctl check --file rate_limited.pol
//!
//! # Canonical text under a given unique name
//! policyctl canonicalize --file rate_limited.pol --name RateLimited_abc_123
//!
//! # Full pipeline, printing the resulting policy record
//! policyctl submit --file rate_limited.pol --class RateLimited --user alice -o json
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use policy_engine::hash::code_hash;
use policy_engine::store_memory::{MemoryConnectionRegistry, MemoryObjectStore, MemoryPolicyStateStore};
use policy_engine::{EngineConfig, PolicyEngine, SubmitUserPolicy, TypeRegistry, VerifyKey};
use policy_lang::{canonicalize, compile_restricted};

#[derive(Parser)]
#[command(name = "policyctl")]
#[command(version)]
#[command(about = "Check, canonicalize and dry-run policy submissions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (YAML); falls back to the environment
    #[arg(long, global = true, env = "POLICY_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the content hash of a submission
    Hash {
        /// Input file (reads stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Validate and compile in restricted mode
    Check {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Rewrite the class under a unique name
    Canonicalize {
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Unique name to rewrite the class under
        #[arg(long)]
        name: String,
    },

    /// Run the submission pipeline without persisting anything
    Submit {
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Declared class name
        #[arg(long = "class")]
        class_name: String,

        /// Submitter verify key, hex encoded
        #[arg(long, conflicts_with = "user")]
        key: Option<String>,

        /// Submitter name, used to derive a key for local runs
        #[arg(long)]
        user: Option<String>,

        /// Input parameter names of the governed computation
        #[arg(long = "input", value_delimiter = ',')]
        inputs: Vec<String>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Hash { file } => cmd_hash(file, cli.format),
        Commands::Check { file } => load_config(cli.config.as_ref()).and_then(|c| cmd_check(file, &c, cli.format)),
        Commands::Canonicalize { file, name } => {
            load_config(cli.config.as_ref()).and_then(|c| cmd_canonicalize(file, &name, &c, cli.format))
        }
        Commands::Submit {
            file,
            class_name,
            key,
            user,
            inputs,
        } => load_config(cli.config.as_ref())
            .and_then(|c| cmd_submit(file, class_name, key, user, inputs, c, cli.format)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::json!({ "success": false, "error": format!("{e:#}") }));
            } else {
                eprintln!("{}: {:#}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_env()?,
    };
    config.validate()?;
    debug!(?config, "configuration loaded");
    Ok(config)
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

fn cmd_hash(file: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let source = read_input(file)?;
    let hash = code_hash(&source);
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "success": true, "code_hash": hash })),
        OutputFormat::Pretty => println!("{hash}"),
    }
    Ok(())
}

fn cmd_check(file: Option<PathBuf>, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let source = read_input(file)?;
    let unit = compile_restricted(&source, &config.compile_options())?;
    let class = &unit.class;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "success": true,
                "class": class.name,
                "base": class.base,
                "params": class.params,
                "outputs": class.outputs,
                "nodes": unit.stats.node_count,
                "depth": unit.stats.max_depth,
                "free_variables": unit.free_variables.iter().map(|v| &v.name).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Pretty => {
            println!("{} {} [{}]", "OK".green(), class.name.bold(), class.base);
            if !class.params.is_empty() {
                println!("  params:  {}", class.params.join(", "));
            }
            if !class.outputs.is_empty() {
                println!("  outputs: {}", class.outputs.join(", "));
            }
            println!(
                "  {} nodes, depth {}, {} bytes",
                unit.stats.node_count, unit.stats.max_depth, unit.stats.source_bytes
            );
            for var in &unit.free_variables {
                println!("  {} unbound @{} in :{}", "warning".yellow(), var.name, var.member);
            }
        }
    }
    Ok(())
}

fn cmd_canonicalize(file: Option<PathBuf>, name: &str, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let source = read_input(file)?;
    let canonical = canonicalize(&source, name, &config.compile_options())?;
    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "success": true,
                "original_name": canonical.original_name,
                "base": canonical.base,
                "parsed_code": canonical.parsed_code,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Pretty => println!("{}", canonical.parsed_code),
    }
    Ok(())
}

fn cmd_submit(
    file: Option<PathBuf>,
    class_name: String,
    key: Option<String>,
    user: Option<String>,
    inputs: Vec<String>,
    config: EngineConfig,
    format: OutputFormat,
) -> Result<()> {
    let credentials = match (key, user) {
        (Some(hex), _) => VerifyKey::from_hex(&hex).with_context(|| format!("invalid verify key '{hex}'"))?,
        (None, Some(user)) => VerifyKey::from_bytes(user.as_bytes()),
        (None, None) => bail!("one of --key or --user is required"),
    };
    let source = read_input(file)?;

    let engine = PolicyEngine::new(
        config,
        Arc::new(TypeRegistry::with_builtins()),
        Arc::new(MemoryConnectionRegistry::new()),
        Arc::new(MemoryObjectStore::new()),
        Arc::new(MemoryPolicyStateStore::new()),
    )?;
    let policy = engine.submit(SubmitUserPolicy::new(source, class_name, inputs), &credentials)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&policy)?),
        OutputFormat::Pretty => {
            println!("{} {}", "OK".green().bold(), policy.unique_name);
            println!("  id:        {}", policy.id);
            println!("  base:      {}", policy.base);
            println!("  signature: {}", policy.signature);
            println!("  status:    {:?}", policy.status);
            println!();
            println!("{}", policy.parsed_code.dimmed());
        }
    }
    Ok(())
}

fn read_input(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => {
            std::fs::read_to_string(&path).with_context(|| format!("failed to read '{}'", path.display()))
        }
        None => {
            if io::stdin().is_terminal() {
                return Err(anyhow!("no input provided; use --file or pipe input via stdin"));
            }
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer).context("failed to read stdin")?;
            Ok(buffer)
        }
    }
}
