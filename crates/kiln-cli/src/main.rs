//! Kiln CLI - incremental asset builds

mod config;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use config::Config;
use rhi_kiln_core::{DEFAULT_RULES_FILENAME, Engine, Registry, RuleSet, UpdateSummary};
use std::path::{Path, PathBuf};

/// Name of the cache file written to the build directory by default.
const DEFAULT_CACHE_FILENAME: &str = "cache.json";

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Incremental asset build pipeline", long_about = None)]
struct Cli {
    /// Verbose output (-v per job, -vv per match, -vvv everything)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Path to config file (default: ~/.config/kiln/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the build up to date
    Build {
        #[command(flatten)]
        setup: Setup,
    },

    /// Build, then list files no job used
    Gc {
        #[command(flatten)]
        setup: Setup,
    },

    /// List available actions
    Actions,

    /// List the rules found in the input tree, in scheduling order
    Rules {
        #[command(flatten)]
        setup: Setup,
    },
}

/// Options shared by every command that works on a tree.
#[derive(clap::Args)]
struct Setup {
    /// Root of the source tree
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Directory for intermediate files (created if missing)
    #[arg(short, long)]
    build: Option<PathBuf>,
    /// Directory for final outputs (created if missing)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// File name of rule files
    #[arg(long)]
    rules: Option<String>,
    /// Cache file (default: <build>/cache.json)
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Ignore the previous cache and rebuild everything
    #[arg(long)]
    no_cache: bool,
    /// Worker threads for parallel jobs
    #[arg(short = 'j', long)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file
    let config = if let Some(ref path) = cli.config {
        Config::load_from_path(Some(path.clone()))
    } else {
        Config::load()
    };

    // CLI flags override config defaults
    let verbose = cli.verbose.max(config.defaults.verbose);
    init_tracing(verbose)?;

    match cli.command {
        Commands::Build { setup } => cmd_build(&setup, &config, verbose),
        Commands::Gc { setup } => cmd_gc(&setup, &config, verbose),
        Commands::Actions => cmd_actions(),
        Commands::Rules { setup } => cmd_rules(&setup, &config, verbose),
    }
}

/// Default filter for a verbosity level. Without `-v` only the engine's
/// pass summaries and warnings are shown.
fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,rhi_kiln_core=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in log_filter(verbose).split(',') {
        filter = filter.add_directive(directive.parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn register_actions(engine: &mut Engine) {
    #[cfg(feature = "actions")]
    rhi_kiln_actions::register_all(engine);
    #[cfg(not(feature = "actions"))]
    let _ = engine;
}

/// A configured engine and the cache file it uses.
struct Session {
    engine: Engine,
    cache: Option<PathBuf>,
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

/// Configure an engine from flags and config, load rules and, if asked,
/// the previous cache.
fn open(setup: &Setup, config: &Config, verbose: u8, load_cache: bool) -> Result<Session> {
    let mut engine = Engine::new();
    engine.set_verbose(u32::from(verbose));
    engine.set_threads(setup.threads.or(config.defaults.threads));
    register_actions(&mut engine);

    let input = setup
        .input
        .as_ref()
        .or(config.paths.input.as_ref())
        .context("No input directory (use --input or set paths.input in the config file)")?;
    engine.set_input_path(input)?;

    let build = setup.build.as_ref().or(config.paths.build.as_ref());
    if let Some(build) = build {
        create_dir(build)?;
        engine.set_build_path(build)?;
    }
    if let Some(output) = setup.output.as_ref().or(config.paths.output.as_ref()) {
        create_dir(output)?;
        engine.set_output_path(output)?;
    }

    let rules_filename = setup
        .rules
        .as_deref()
        .or(config.defaults.rules.as_deref())
        .unwrap_or(DEFAULT_RULES_FILENAME);
    let count = engine.load_rules(rules_filename)?;
    if count == 0 {
        tracing::warn!(rules = rules_filename, "no rules found in input tree");
    }

    let cache = setup
        .cache
        .clone()
        .or_else(|| config.defaults.cache.clone())
        .or_else(|| {
            build
                .is_some()
                .then(|| engine.roots().build.join(DEFAULT_CACHE_FILENAME))
        });
    if load_cache && !setup.no_cache {
        if let Some(ref path) = cache {
            if !engine.load_cache(path)? {
                tracing::info!(path = %path.display(), "no usable cache, building everything");
            }
        }
    }

    Ok(Session { engine, cache })
}

/// Run an update and persist its state.
fn update(session: &mut Session) -> Result<UpdateSummary> {
    let summary = session.engine.update()?;
    if let Some(ref path) = session.cache {
        if let Some(parent) = path.parent() {
            create_dir(parent)?;
        }
        session.engine.save_cache(path)?;
    }
    Ok(summary)
}

fn print_summary(summary: &UpdateSummary) {
    if summary.succeeded == 0 && summary.failed == 0 {
        println!("Up to date ({} jobs)", summary.skipped);
    } else {
        println!(
            "{} succeeded, {} failed, {} up to date",
            summary.succeeded, summary.failed, summary.skipped
        );
    }
}

fn cmd_build(setup: &Setup, config: &Config, verbose: u8) -> Result<()> {
    let mut session = open(setup, config, verbose, true)?;
    let summary = update(&mut session)?;
    print_summary(&summary);

    if summary.failed > 0 {
        bail!("{} job(s) failed", summary.failed);
    }
    Ok(())
}

fn cmd_gc(setup: &Setup, config: &Config, verbose: u8) -> Result<()> {
    let mut session = open(setup, config, verbose, true)?;
    let summary = update(&mut session)?;
    print_summary(&summary);

    let garbage = session.engine.collect_garbage();
    for path in &garbage {
        println!("unused: {}", path.display());
    }
    println!("Total: {} unused files", garbage.len());
    Ok(())
}

fn cmd_actions() -> Result<()> {
    let mut engine = Engine::new();
    register_actions(&mut engine);
    list_actions(engine.registry());
    Ok(())
}

fn list_actions(registry: &Registry) {
    println!("Available actions:\n");

    for decl in registry.declarations() {
        println!("  {} {}", decl.name, decl.version);
        if !decl.description.is_empty() {
            println!("    {}", decl.description);
        }
        println!(
            "    {}",
            if decl.parallel { "parallel" } else { "serial" }
        );
        println!();
    }

    println!("Total: {} actions", registry.len());
}

fn cmd_rules(setup: &Setup, config: &Config, verbose: u8) -> Result<()> {
    let session = open(setup, config, verbose, false)?;
    list_rules(session.engine.rules());
    Ok(())
}

fn list_rules(rules: &RuleSet) {
    for rule in rules.iter() {
        println!("  {} (pass {}, action {})", rule.id, rule.pass, rule.action);
        if !rule.path.as_os_str().is_empty() {
            println!("    path: {}", rule.path.display());
        }
        for (slot, pattern) in &rule.inputs {
            println!("    input {}: {}", slot, pattern.source());
        }
        for (name, template) in &rule.outputs {
            println!("    output {}: {}", name, template);
        }
        if !rule.group_by.is_empty() {
            println!("    group-by: {:?}", rule.group_by);
        }
        println!();
    }

    println!("Total: {} rules", rules.len());
}
