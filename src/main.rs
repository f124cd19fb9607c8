use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use stratum::config::Config;
use stratum::coordinator::{Coordinator, GenerationReport, GenerationRequest};
use stratum::discovery::{Strategy, ToolDiscovery};
use stratum::executor::builtin_registry;
use stratum::integration::ManifestIntegrator;
use stratum::logging;
use stratum::model::ComponentConfig;
use stratum::offline::OfflineDetector;
use stratum::process::{ProcessRunner, SystemProcessRunner};
use stratum::rollback::RollbackManager;
use stratum::tool_cache::ToolCache;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn cli() -> Command {
    Command::new("stratum")
        .about("Generate multi-component projects from real toolchains or built-in skeletons")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(Arg::new("verbose")
            .long("verbose")
            .short('v')
            .help("Debug logging and streamed tool output")
            .global(true)
            .action(ArgAction::SetTrue))
        .subcommand(Command::new("new")
            .about("Generate a new project")
            .arg(Arg::new("name")
                .help("Project name")
                .required(true))
            .arg(Arg::new("component")
                .long("component")
                .short('c')
                .help("Component to generate; the name defaults to the type")
                .value_name("TYPE[:NAME]")
                .required(true)
                .action(ArgAction::Append))
            .arg(Arg::new("output")
                .long("output")
                .short('o')
                .help("Output directory (default: ./<NAME>)")
                .value_name("DIR"))
            .arg(Arg::new("offline")
                .long("offline")
                .help("Skip network checks and use built-in skeletons")
                .action(ArgAction::SetTrue))
            .arg(Arg::new("no-parallel")
                .long("no-parallel")
                .help("Generate components one at a time")
                .action(ArgAction::SetTrue))
            .arg(Arg::new("force")
                .long("force")
                .help("Replace existing component directories")
                .action(ArgAction::SetTrue))
            .arg(Arg::new("no-backup")
                .long("no-backup")
                .help("Do not snapshot an existing output directory")
                .action(ArgAction::SetTrue))
            .arg(Arg::new("dry-run")
                .long("dry-run")
                .help("Show what would be generated without writing anything")
                .action(ArgAction::SetTrue)))
        .subcommand(Command::new("tools")
            .about("Show toolchain availability")
            .arg(Arg::new("component")
                .long("component")
                .help("Only tools needed by this component type")
                .value_name("TYPE")))
        .subcommand(Command::new("cache")
            .about("Manage the tool cache")
            .subcommand_required(true)
            .subcommand(Command::new("clear").about("Remove every entry"))
            .subcommand(Command::new("prune").about("Remove expired entries"))
            .subcommand(Command::new("export")
                .about("Write the cache to a portable file")
                .arg(Arg::new("file").required(true)))
            .subcommand(Command::new("import")
                .about("Merge entries from an exported file")
                .arg(Arg::new("file").required(true))))
        .subcommand(Command::new("backups")
            .about("Manage output directory backups")
            .subcommand_required(true)
            .subcommand(Command::new("list").about("List stored backups, oldest first"))
            .subcommand(Command::new("prune")
                .about("Delete all but the newest backups")
                .arg(Arg::new("keep")
                    .long("keep")
                    .help("Number of backups to keep (default: keep_backups from the config)")
                    .value_name("N")
                    .value_parser(clap::value_parser!(usize)))))
        .subcommand(Command::new("config")
            .about("Show configuration information"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let verbose = matches.get_flag("verbose");
    logging::init(verbose);

    let config = Config::load()?;

    match matches.subcommand() {
        Some(("new", sub)) => run_new(&config, sub, verbose).await,
        Some(("tools", sub)) => run_tools(&config, sub.get_one::<String>("component")).await,
        Some(("cache", sub)) => run_cache(&config, sub),
        Some(("backups", sub)) => run_backups(&config, sub),
        Some(("config", _)) => config.show_config_info(),
        _ => Ok(()),
    }
}

fn discovery(config: &Config, runner: Arc<dyn ProcessRunner>) -> ToolDiscovery {
    let cache = Arc::new(ToolCache::open(config.cache_config()));
    if config.force_offline {
        cache.set_offline_mode(true);
    }
    ToolDiscovery::new(cache, runner)
        .with_offline_detector(Arc::new(OfflineDetector::new(config.offline_config())))
        .with_version_timeout(config.tool_timeout())
        .with_default_tools()
}

/// `type[:name]`; the name defaults to the type.
fn parse_component(spec: &str) -> ComponentConfig {
    match spec.split_once(':') {
        Some((component_type, name)) => ComponentConfig::new(component_type.trim(), name.trim()),
        None => ComponentConfig::new(spec.trim(), spec.trim()),
    }
}

async fn run_new(config: &Config, matches: &ArgMatches, verbose: bool) -> Result<()> {
    let name = matches
        .get_one::<String>("name")
        .cloned()
        .unwrap_or_default();
    let output = matches
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&name));

    let mut options = config.generation_options();
    options.force_offline |= matches.get_flag("offline");
    options.disable_parallel |= matches.get_flag("no-parallel");
    options.force_overwrite = matches.get_flag("force");
    options.create_backup = !matches.get_flag("no-backup");
    options.dry_run = matches.get_flag("dry-run");
    options.stream_output = verbose;

    let mut request = GenerationRequest::new(&name, output).options(options);
    for spec in matches.get_many::<String>("component").unwrap_or_default() {
        request = request.component(parse_component(spec));
    }

    let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
    let coordinator = Coordinator::builder(
        Arc::new(discovery(config, runner.clone())),
        Arc::new(RollbackManager::new(config.backup_path())),
    )
    .executors(Arc::new(builtin_registry(runner)))
    .integrator(Arc::new(ManifestIntegrator))
    .refresh_on_reconnect(config.refresh_on_reconnect)
    .keep_backups(config.keep_backups)
    .build();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping generation");
            interrupt.cancel();
        }
    });

    info!("Generating '{}' with {} component(s)", name, request.components.len());
    match coordinator.generate(request, cancel).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(err) => {
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    }
}

fn print_report(report: &GenerationReport) {
    let mode = if report.offline { " (offline)" } else { "" };
    if report.dry_run {
        println!("Plan for '{}' in {}{}", report.project_name, report.output_dir.display(), mode);
        for planned in &report.planned {
            println!(
                "  {} ({}): {}{}",
                planned.name,
                planned.component_type,
                planned.strategy,
                if planned.flags.is_empty() { String::new() } else { format!(" {}", planned.flags.join(" ")) }
            );
            if planned.conflict {
                println!("    ⚠️  {} exists and is not empty; --force replaces it", planned.path.display());
            }
        }
        return;
    }

    println!("✅ Generated '{}' in {}{}", report.project_name, report.output_dir.display(), mode);
    for component in &report.components {
        println!(
            "  {} ({}) -> {}{}",
            component.name,
            component.component_type,
            component.path.display(),
            if component.used_fallback { " [skeleton]" } else { "" }
        );
    }
    for tool in &report.outdated_tools {
        println!("⚠️  {} {} is older than the recommended {}", tool.name, tool.found, tool.required);
    }
}

async fn run_tools(config: &Config, component_type: Option<&String>) -> Result<()> {
    let discovery = discovery(config, Arc::new(SystemProcessRunner));
    let names: Vec<String> = match component_type {
        Some(t) => discovery
            .get_tools_for_component(t)
            .into_iter()
            .map(|tool| tool.name.clone())
            .collect(),
        None => discovery.tools().map(|tool| tool.name.clone()).collect(),
    };
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let report = discovery.check_requirements(&names).await;

    for name in &names {
        if report.available.iter().any(|a| a == name) {
            let version = discovery.get_version(name).await.unwrap_or_default();
            let first_line = version.lines().next().unwrap_or("");
            println!("✅ {:<8} {}", name, first_line);
        } else {
            let hint = discovery.install_hint(name).unwrap_or("");
            println!("❌ {:<8} not found {}", name, hint);
        }
    }
    for tool in &report.outdated {
        println!("⚠️  {} {} is older than the recommended {}", tool.name, tool.found, tool.required);
    }

    if let Some(t) = component_type {
        match discovery.select_strategy(t).await {
            Ok(Strategy::Executor) => println!("\n{t}: toolchain"),
            Ok(Strategy::Fallback(reason)) => println!("\n{t}: built-in skeleton ({reason})"),
            Err(err) => println!("\n{t}: cannot generate\n{err}"),
        }
    }

    discovery.cache().save()?;
    Ok(())
}

fn run_cache(config: &Config, matches: &ArgMatches) -> Result<()> {
    let cache = ToolCache::open(config.cache_config());
    match matches.subcommand() {
        Some(("clear", _)) => {
            cache.clear();
            cache.save()?;
            println!("🧹 Tool cache cleared");
        }
        Some(("prune", _)) => {
            let removed = cache.clear_expired();
            cache.save()?;
            println!("🧹 Removed {removed} expired entries, {} left", cache.len());
        }
        Some(("export", sub)) => {
            let file = file_arg(sub)?;
            cache.export_to(&file)?;
            println!("📦 Exported {} entries to {}", cache.len(), file.display());
        }
        Some(("import", sub)) => {
            let file = file_arg(sub)?;
            let imported = cache
                .import_from(&file)
                .with_context(|| format!("Failed to import {}", file.display()))?;
            cache.save()?;
            println!("📥 Imported {imported} entries from {}", file.display());
        }
        _ => {}
    }
    Ok(())
}

fn run_backups(config: &Config, matches: &ArgMatches) -> Result<()> {
    let rollback = RollbackManager::new(config.backup_path());
    match matches.subcommand() {
        Some(("list", _)) => {
            let backups = rollback.stored_backups()?;
            if backups.is_empty() {
                println!("No backups in {}", rollback.backup_root().display());
            }
            for backup in backups {
                println!("{}", backup.display());
            }
        }
        Some(("prune", sub)) => {
            let keep = sub
                .get_one::<usize>("keep")
                .copied()
                .unwrap_or(config.keep_backups);
            let removed = rollback.prune_backups(keep)?;
            println!("🧹 Removed {removed} backup(s), kept at most {keep}");
        }
        _ => {}
    }
    Ok(())
}

fn file_arg(matches: &ArgMatches) -> Result<PathBuf> {
    matches
        .get_one::<String>("file")
        .map(PathBuf::from)
        .context("missing FILE argument")
}
