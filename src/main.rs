mod common;
mod config;
mod error;
mod gate;
mod hypervisor;
mod inventory;
mod layer4;
mod registry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::gate::ReadinessGate;
use crate::hypervisor::{CommandHypervisor, InventoryProvider};
use crate::layer4::{Layer4Listener, ListenerSettings};
use crate::registry::{BuildOutcome, RegistryStore};

/// Unrecoverable startup failure.
const EXIT_STARTUP: u8 = 1;
/// Fatal listener failure.
const EXIT_LISTENER: u8 = 2;

#[derive(Parser)]
#[command(name = "vmwake")]
#[command(about = "Wakes local virtual machines when a Wake-on-LAN magic packet arrives")]
struct Cli {
    /// Config file (YAML). Defaults apply if the default file is absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registry document location, overrides the config file
    #[arg(short, long)]
    registry: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let opts = Cli::parse();

    let level = match opts.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = SimpleLogger::new().with_level(level).env().init() {
        eprintln!("failed to set up logging: {}", e);
        return ExitCode::from(EXIT_STARTUP);
    }

    run(opts)
}

fn run(opts: Cli) -> ExitCode {
    let cfg = match load_config(&opts) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("{:#}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let store = match open_store(&opts, &cfg) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("{:#}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let hypervisor = match CommandHypervisor::new(cfg.hypervisor.clone()) {
        Ok(hv) => Arc::new(hv),
        Err(e) => {
            log::error!("failed to create command runtime: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("received termination signal");
        signal_token.cancel();
    }) {
        log::error!("failed to install signal handler: {}", e);
        return ExitCode::from(EXIT_STARTUP);
    }

    let gate = Arc::new(ReadinessGate::new());
    if let Err(e) = initialize_registry(hypervisor.as_ref(), &store, &gate) {
        log::error!("failed to initialize registry: {:#}", e);
        return ExitCode::from(EXIT_STARTUP);
    }

    let listener = Layer4Listener::new(
        store.clone(),
        gate.clone(),
        hypervisor.clone(),
        ListenerSettings::from(&cfg.listener),
        cancel_token.clone(),
    );
    let handle = match std::thread::Builder::new()
        .name("listener".to_string())
        .spawn(move || listener.run())
    {
        Ok(h) => h,
        Err(e) => {
            log::error!("failed to start listener thread: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    log::info!("running vmwake");
    match handle.join() {
        Ok(Ok(())) => {
            log::info!("shut down");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            log::error!("listener failed: {}", e);
            ExitCode::from(EXIT_LISTENER)
        }
        Err(_) => {
            log::error!("listener thread panicked");
            ExitCode::from(EXIT_LISTENER)
        }
    }
}

fn load_config(opts: &Cli) -> Result<Config> {
    match &opts.config {
        Some(path) => Config::load(path, true),
        None => Config::load(&config::default_config_path(), false),
    }
}

/// Resolves the registry location and makes sure its directory exists.
fn open_store(opts: &Cli, cfg: &Config) -> Result<RegistryStore> {
    let path = match &opts.registry {
        Some(p) => config::expand_path(p)?,
        None => cfg.registry_path()?,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create registry directory {}", dir.display()))?;
    }
    log::info!("registry path set to {}", path.display());
    Ok(RegistryStore::new(path))
}

/// Prepares the registry and opens the gate. The listener is spawned only
/// after this returns, so its readiness timeout never covers the scan.
fn initialize_registry<P: InventoryProvider + ?Sized>(
    provider: &P,
    store: &RegistryStore,
    gate: &ReadinessGate,
) -> Result<()> {
    prepare_registry(provider, store)?;
    if gate.fire() {
        log::info!("registry initialization complete");
    }
    Ok(())
}

/// Scans the hypervisor and persists a fresh registry. When scanning or
/// writing fails, a valid registry already on disk is kept instead.
fn prepare_registry<P: InventoryProvider + ?Sized>(provider: &P, store: &RegistryStore) -> Result<()> {
    log::info!("initializing registry");
    let records = match inventory::scan(provider) {
        Ok(records) => records,
        Err(e) if store.has_valid_registry() => {
            log::warn!("{}, using existing registry {}", e, store.path().display());
            return Ok(());
        }
        Err(e) => return Err(e).context("no existing registry to fall back to"),
    };

    match store.build(records)? {
        BuildOutcome::Written { entries } => log::info!("registry created with {} VMs", entries),
        BuildOutcome::KeptPrevious => log::warn!("using existing registry due to write failure"),
    }
    Ok(())
}
