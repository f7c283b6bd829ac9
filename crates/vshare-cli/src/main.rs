use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use console::style;

use vshare_cas::{ObjectId, SharedObjectStore};
use vshare_config::logging::{init_logging, LogLevel};
use vshare_config::path::absolute;
use vshare_config::{log_cli_debug, Config};
use vshare_enlistment::{
    clone, mount, prepare, repair_cache_root, repair_enlistment, status, Enlistment,
    EnlistmentOptions, LayoutMigrator,
};

#[derive(Parser)]
#[command(name = "vshare")]
#[command(version, about = "Shared object cache for git enlistments", long_about = None)]
struct Cli {
    /// Shared cache root (overrides config and VSHARE_CACHE_ROOT)
    #[arg(long, global = true, value_name = "DIR")]
    cache_root: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an enlistment whose objects live in the shared cache
    Clone {
        /// Origin: a directory of loose objects
        origin: PathBuf,
        /// Enlistment root to create
        enlistment: PathBuf,
        /// Skip mounting after the clone
        #[arg(long)]
        no_mount: bool,
    },

    /// Validate and upgrade an enlistment, then mark it ready
    Mount {
        #[arg(value_name = "DIR")]
        enlistment: Option<PathBuf>,
    },

    /// Clear the mount state
    Unmount {
        #[arg(value_name = "DIR")]
        enlistment: Option<PathBuf>,
    },

    /// Show the enlistment's cache wiring and mount state
    Status {
        #[arg(value_name = "DIR")]
        enlistment: Option<PathBuf>,
    },

    /// Run pending disk layout upgrades without mounting
    Upgrade {
        #[arg(value_name = "DIR")]
        enlistment: Option<PathBuf>,
    },

    /// Detect and fix damaged cache state
    Repair {
        /// Repair one enlistment's wiring as well as its shared state
        #[arg(long, value_name = "DIR")]
        enlistment: Option<PathBuf>,
    },

    /// Print the binary and disk layout versions
    Version,
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    });

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(root) = &cli.cache_root {
        config.cache.root = absolute(root)?;
    }
    let options = EnlistmentOptions::from_config(&config);
    log_cli_debug!(
        "Resolved cache root",
        cache_root = options.cache_root.display().to_string()
    );

    match cli.command {
        Commands::Clone {
            origin,
            enlistment,
            no_mount,
        } => cmd_clone(&origin, &enlistment, no_mount, &options),
        Commands::Mount { enlistment } => cmd_mount(&open(enlistment)?, &options),
        Commands::Unmount { enlistment } => {
            let enlistment = open(enlistment)?;
            mount::clear_mount_state(&enlistment)?;
            println!("Unmounted {}", enlistment.root().display());
            Ok(())
        }
        Commands::Status { enlistment } => {
            let report = status(&open(enlistment)?)?;
            print!("{}", report);
            Ok(())
        }
        Commands::Upgrade { enlistment } => cmd_upgrade(&open(enlistment)?, &options),
        Commands::Repair { enlistment } => cmd_repair(enlistment, &options),
        Commands::Version => {
            println!("vshare {}", env!("CARGO_PKG_VERSION"));
            println!("Disk layout version: {}", LayoutMigrator::current_version());
            Ok(())
        }
    }
}

fn cmd_clone(
    origin: &Path,
    enlistment: &Path,
    no_mount: bool,
    options: &EnlistmentOptions,
) -> Result<()> {
    let origin = fs::canonicalize(origin)
        .with_context(|| format!("Origin not found: {}", origin.display()))?;
    let source = SharedObjectStore::new(&origin);
    let wanted: Vec<ObjectId> = source
        .list()
        .with_context(|| format!("Failed to list objects in {}", origin.display()))?
        .into_iter()
        .map(|(oid, _)| oid)
        .collect();

    let enlistment = Enlistment::new(absolute(enlistment)?);
    let report = clone(
        &origin.to_string_lossy(),
        &enlistment,
        options,
        &source,
        &wanted,
    )
    .with_context(|| format!("Clone into {} failed", enlistment.root().display()))?;

    println!(
        "{} Cloned into {}",
        style("✓").green(),
        enlistment.root().display()
    );
    println!("  Cache key:       {}", report.cache_key);
    println!("  Objects root:    {}", report.objects_root.display());
    println!("  Downloaded:      {}", report.downloaded);
    println!("  Already cached:  {}", report.already_present);

    if no_mount {
        return Ok(());
    }
    cmd_mount(&enlistment, options)
}

fn cmd_mount(enlistment: &Enlistment, options: &EnlistmentOptions) -> Result<()> {
    let session = prepare(enlistment, options)
        .with_context(|| format!("Mount of {} failed", enlistment.root().display()))?;
    println!(
        "{} Mounted {} (layout {})",
        style("✓").green(),
        enlistment.root().display(),
        session.layout_version()
    );
    println!("  Objects root: {}", session.objects_root().display());
    Ok(())
}

fn cmd_upgrade(enlistment: &Enlistment, options: &EnlistmentOptions) -> Result<()> {
    mount::clear_mount_state(enlistment)?;
    let report = LayoutMigrator::new(options).upgrade(enlistment)?;
    if report.is_noop() {
        println!("Disk layout is current ({})", report.to);
        return Ok(());
    }
    for (from, to) in &report.applied {
        println!("  {} {} -> {}", style("•").dim(), from, to);
    }
    println!(
        "{} Upgraded disk layout {} -> {}",
        style("✓").green(),
        report.from,
        report.to
    );
    Ok(())
}

fn cmd_repair(enlistment: Option<PathBuf>, options: &EnlistmentOptions) -> Result<()> {
    let report = match enlistment {
        Some(dir) => repair_enlistment(&open(Some(dir))?, options)?,
        None => repair_cache_root(&options.cache_root, options)?,
    };
    print!("{}", report);

    if !report.is_success() {
        anyhow::bail!("Repair left problems unresolved");
    }
    if report.fixed_count() == 0 {
        println!("{}", style("Nothing to repair").dim());
    } else {
        println!(
            "{} Fixed {} problem(s)",
            style("✓").green(),
            report.fixed_count()
        );
    }
    Ok(())
}

/// Enlistment at `dir`, or the current directory
fn open(dir: Option<PathBuf>) -> Result<Enlistment> {
    let root = match dir {
        Some(dir) => absolute(&dir)?,
        None => std::env::current_dir().context("cwd")?,
    };
    Ok(Enlistment::new(root))
}
