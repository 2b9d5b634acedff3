use std::{
    fs,
    io::IsTerminal,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flake_resolve::{
    clone_flake,
    eval::JsonEvaluator,
    fetch::CommandFetcher,
    flake::source_info_attrs,
    resolve_flake,
    storage::FilesystemStore,
    update_lock_file, FlakeContext, FlakeRef, LockPolicy, Registry, ResolvedFlake, Settings,
};

#[derive(Parser)]
#[command(name = "flake-resolve", version, about = "Resolve, fetch and lock flakes")]
struct Cli {
    /// Map the flake reference FROM to TO ahead of every registry
    #[arg(long, num_args = 2, value_names = ["FROM", "TO"], global = true)]
    override_flake: Vec<String>,

    /// Do not draw progress spinners
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the direct reference a flake reference resolves to
    Resolve { flake_ref: String },
    /// Fetch a flake and show its metadata
    Info {
        #[arg(default_value = ".")]
        flake_ref: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a flake and its lock file
    Lock {
        #[arg(default_value = ".")]
        flake_ref: String,
        #[arg(long, value_enum, default_value = "update")]
        policy: LockPolicy,
    },
    /// Refresh the lock file of a local flake
    Update {
        #[arg(default_value = ".")]
        flake_ref: String,
        /// Discard the existing lock file
        #[arg(long)]
        recreate: bool,
    },
    /// Clone the repository of a flake
    Clone {
        flake_ref: String,
        dest: Option<PathBuf>,
    },
    /// Inspect or edit the user registry
    #[command(subcommand)]
    Registry(RegistryCommand),
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// List entries of all registries in lookup order
    List,
    /// Add or replace an entry in the user registry
    Add { from: String, to: String },
    /// Remove an entry from the user registry
    Remove { from: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    let overrides = cli
        .override_flake
        .chunks(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect::<Vec<_>>();
    let overrides = Registry::from_overrides(&overrides)?;

    let show_progress = !cli.no_progress && std::io::stderr().is_terminal();
    let ctx = build_context(settings, overrides, show_progress)?;

    match cli.command {
        Command::Resolve { flake_ref } => {
            let flake_ref = parse_flake_ref(&flake_ref)?;
            println!("{}", ctx.lookup(&flake_ref, true)?);
        }
        Command::Info { flake_ref, json } => {
            let flake_ref = parse_flake_ref(&flake_ref)?;
            let resolved = resolve_flake(&ctx, &flake_ref, LockPolicy::UseExistingAllowUpdated)?;
            print_info(&resolved, json)?;
        }
        Command::Lock { flake_ref, policy } => {
            let flake_ref = parse_flake_ref(&flake_ref)?;
            let resolved = resolve_flake(&ctx, &flake_ref, policy)?;
            println!("{}", resolved.lock_file);
            eprintln!("fingerprint: {}", resolved.fingerprint());
        }
        Command::Update { flake_ref, recreate } => {
            let flake_ref = parse_flake_ref(&flake_ref)?;
            let resolved = update_lock_file(&ctx, &flake_ref, recreate)?;
            println!("{}", resolved.lock_file);
        }
        Command::Clone { flake_ref, dest } => {
            let flake_ref = parse_flake_ref(&flake_ref)?;
            clone_flake(&ctx, &flake_ref, dest.as_deref())?;
        }
        Command::Registry(command) => handle_registry(&ctx, command)?,
    }

    Ok(())
}

fn build_context(settings: Settings, overrides: Registry, show_progress: bool) -> Result<FlakeContext> {
    let store = Arc::new(FilesystemStore::new(&settings.store_dir)?);
    store.initialize()?;

    let fetcher = CommandFetcher::new(store.clone(), settings.cache_dir.clone())
        .with_progress(show_progress);
    let vcs = Arc::new(fetcher.git().clone());

    Ok(FlakeContext::new(
        settings,
        Arc::new(fetcher),
        store,
        Arc::new(JsonEvaluator::new()),
        vcs,
    )
    .with_registry_overrides(overrides))
}

/// Relative paths on the command line name local flakes.
fn parse_flake_ref(input: &str) -> Result<FlakeRef> {
    let is_relative_path =
        input == "." || input.starts_with("./") || input.starts_with("../") || input == "..";
    if is_relative_path {
        let path = fs::canonicalize(input)
            .with_context(|| format!("Failed to resolve flake path '{}'", input))?;
        return Ok(FlakeRef::path(path));
    }
    Ok(FlakeRef::parse(input)?)
}

fn print_info(resolved: &ResolvedFlake, json: bool) -> Result<()> {
    let flake = &resolved.flake;
    let source = &flake.source_info;

    if json {
        let mut info = serde_json::Map::new();
        info.insert("description".into(), flake.description.clone().into());
        info.insert("url".into(), source.resolved_ref.to_string().into());
        info.insert("narHash".into(), source.nar_hash.clone().into());
        info.insert("path".into(), source.store_path.to_string_lossy().into());
        for (name, value) in source_info_attrs(source) {
            if let Some(s) = value.as_str() {
                info.entry(name).or_insert_with(|| s.into());
            }
        }
        if let Some(count) = source.rev_count {
            info.insert("revCount".into(), count.into());
        }
        info.insert(
            "inputs".into(),
            flake.inputs.keys().cloned().collect::<Vec<_>>().into(),
        );
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    if let Some(description) = &flake.description {
        println!("Description:   {}", description);
    }
    println!("URL:           {}", source.resolved_ref);
    println!("Path:          {}", source.store_path.display());
    println!("NAR hash:      {}", source.nar_hash);
    if let Some(rev) = &source.resolved_ref.rev {
        println!("Revision:      {}", rev);
    }
    if let Some(count) = source.rev_count {
        println!("Revisions:     {}", count);
    }
    if let Some(modified) = source_info_attrs(source).get("lastModified").and_then(|v| v.as_str()) {
        println!("Last modified: {}", modified);
    }
    for (name, input) in &flake.inputs {
        let locked = resolved
            .lock_file
            .inputs
            .get(name)
            .map(|l| l.reference.to_string())
            .unwrap_or_default();
        println!("Input {}: {} -> {}", name, input.reference, locked);
    }
    println!("Fingerprint:   {}", resolved.fingerprint());
    Ok(())
}

fn handle_registry(ctx: &FlakeContext, command: RegistryCommand) -> Result<()> {
    let user_registry_path = &ctx.settings().user_registry_path;

    match command {
        RegistryCommand::List => {
            let labels = ["override", "user", "global"];
            for (label, registry) in labels.iter().zip(ctx.registries()?) {
                for (from, to) in registry.entries() {
                    println!("{} {} {}", label, from, to);
                }
            }
        }
        RegistryCommand::Add { from, to } => {
            let mut registry = ctx.user_registry()?;
            registry.add(FlakeRef::parse(&from)?, parse_flake_ref(&to)?);
            save_user_registry(&registry, user_registry_path)?;
        }
        RegistryCommand::Remove { from } => {
            let mut registry = ctx.user_registry()?;
            let from = FlakeRef::parse(&from)?;
            if registry.remove(&from).is_none() {
                tracing::warn!("'{}' is not in the user registry", from);
            }
            save_user_registry(&registry, user_registry_path)?;
        }
    }
    Ok(())
}

fn save_user_registry(registry: &Registry, path: &Path) -> Result<()> {
    registry.save(path)?;
    tracing::info!("saved user registry {:?}", path);
    Ok(())
}
