//! archprov - main entry point
//!
//! Thin front-end over the library: parse arguments, set up logging and
//! signal handling, then plan or provision.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use archprov::backend::{CommandBackend, RecordingBackend, StorageBackend};
use archprov::cli::{Cli, Commands, LayoutArgs};
use archprov::config_file::ProvisionConfig;
use archprov::engine::layout::format_size;
use archprov::engine::{MountTree, Schedule, plan_with_options, provision_device, release};
use archprov::error::ProvisionError;
use archprov::inventory::{DeviceInventory, LsblkInventory};
use archprov::process_guard::{self, ProcessGuard};
use archprov::sanity;

/// Initialize the tracing subscriber (stderr, `RUST_LOG` overrides the level)
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    // Terminate running storage tools if we are interrupted
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            exit_code_for(&e)
        }
    }
}

/// 2 when nothing on the disk was touched, 1 otherwise.
fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<ProvisionError>() {
        Some(pe) if pe.is_recoverable() => {
            eprintln!("  No changes were made to the disk.");
            ExitCode::from(2)
        }
        Some(_) => {
            eprintln!("  The disk was modified and needs manual recovery.");
            ExitCode::FAILURE
        }
        None => ExitCode::FAILURE,
    }
}

fn run(cli: Cli) -> Result<()> {
    let inventory = LsblkInventory::new();

    match cli.command {
        Commands::Devices { json } => list_devices(&inventory, json),
        Commands::Plan { layout, json } => show_plan(&inventory, &layout, json),
        Commands::Provision {
            layout,
            confirm,
            mount_tree_out,
        } => {
            let config = layout.resolve()?;
            if !confirm && !cli.dry_run {
                anyhow::bail!(
                    "Refusing to provision {} without --confirm (all data on it will be lost)",
                    config.device.display()
                );
            }
            let tree = provision(&inventory, &config, cli.dry_run, mount_tree_out.as_deref())?;
            println!(
                "✓ {} provisioned, mounted under {}",
                config.device.display(),
                tree.root().display()
            );
            for entry in tree.entries() {
                println!(
                    "  {} -> {}",
                    entry.source.device().display(),
                    entry.path.display()
                );
            }
            if let Some(path) = mount_tree_out {
                tree.save_to_file(&path)?;
                info!("Mount tree written to {}", path.display());
            }
            Ok(())
        }
        Commands::Release { mount_tree } => {
            let mut tree = MountTree::load_from_file(&mount_tree)?;
            let mut backend = backend_for(cli.dry_run);
            release(&mut tree, backend.as_mut())?;
            println!("✓ Released {}", tree.root().display());
            Ok(())
        }
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            let loaded = ProvisionConfig::load_from_file(&config)?;
            loaded.validate().context("Configuration validation failed")?;
            println!("✓ Configuration file is valid: {}", config.display());
            Ok(())
        }
    }
}

fn backend_for(dry_run: bool) -> Box<dyn StorageBackend> {
    if dry_run {
        info!("Dry-run mode: storage calls are logged, not executed");
        Box::new(RecordingBackend::echoing())
    } else {
        Box::new(CommandBackend::new())
    }
}

fn list_devices(inventory: &dyn DeviceInventory, json: bool) -> Result<()> {
    let devices = inventory.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No block devices found");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:<16} {:>12}  {:>4} B  {:<6} {}{}",
            device.path.display(),
            format_size(device.capacity),
            device.sector_size,
            device.transport.as_deref().unwrap_or("-"),
            device.model.as_deref().unwrap_or(""),
            if device.read_only { " (read-only)" } else { "" }
        );
    }
    Ok(())
}

fn show_plan(inventory: &dyn DeviceInventory, layout: &LayoutArgs, json: bool) -> Result<()> {
    let config = layout.resolve()?;
    let device = inventory.probe(&config.device)?;
    let plan = plan_with_options(
        &device,
        config.filesystem,
        config.policy,
        &config.planner_options(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let existing = inventory.partitions(&config.device)?;
    let schedule = Schedule::build(&plan, &config.provision_options(), &existing);
    println!("{}\n\n{}", plan.summary(), schedule.summary());
    Ok(())
}

fn provision(
    inventory: &dyn DeviceInventory,
    config: &ProvisionConfig,
    dry_run: bool,
    mount_tree_out: Option<&Path>,
) -> Result<MountTree> {
    if !dry_run {
        let check = sanity::verify_environment(config.filesystem, config.policy);
        if !check.is_ok() {
            anyhow::bail!("{}", check.report());
        }
    }

    let request = config.to_request()?;
    let mut backend = backend_for(dry_run);

    // Kills any tool still running if we bail out early
    let _guard = ProcessGuard::new();
    match provision_device(&request, backend.as_mut(), inventory) {
        Ok((_plan, tree)) => Ok(tree),
        Err(e) => {
            if let ProvisionError::ProvisioningFailed { mounted, .. } = &e {
                keep_partial_tree(mounted, mount_tree_out);
            }
            Err(e.into())
        }
    }
}

/// Leave a record of what a failed run left mounted, so `release` can take it
/// down.
fn keep_partial_tree(mounted: &MountTree, out: Option<&Path>) {
    if mounted.is_empty() {
        return;
    }
    match out {
        Some(path) => match mounted.save_to_file(path) {
            Ok(()) => warn!(
                "Partial mount tree written to {}; run `archprov release --mount-tree {}`",
                path.display(),
                path.display()
            ),
            Err(e) => warn!("Could not write partial mount tree: {:#}", e),
        },
        None => {
            for entry in mounted.entries() {
                warn!("Left mounted: {}", entry.path.display());
            }
        }
    }
}
