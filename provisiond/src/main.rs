mod config;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use provision_core::transport::{BleTransportError, DisplayTransportError, WifiTransportError};
use provision_core::{
    ConfigStore, EventBus, IdentitySources, Orchestrator, OrchestratorConfig, OwnershipConfig, OwnershipService,
    ResetMonitor, ResetMonitorConfig, StorageError, Watchdog, WatchdogConfig,
};
use provision_gpio::{GpioError, RppalResetLine};
use provision_network::{NetworkError, NetworkManagerWifi};
use provision_ble::{BleError, BluerBleServer};
use provision_display::FramebufferDisplay;

use config::{Config, ConfigError, ConfigOverrides};

#[derive(Parser)]
#[command(name = "provisiond")]
#[command(about = "Rock Pi BLE/Wi-Fi provisioning daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning daemon.
    Run {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Print the effective, fully-resolved configuration (secrets redacted) and exit.
    Config {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Clear the config store offline, without starting the daemon.
    Reset {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ownership(#[from] provision_core::OwnershipError),
    #[error("ble error: {0}")]
    Ble(#[from] BleError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("gpio error: {0}")]
    Gpio(#[from] GpioError),
    #[error("ble transport error: {0}")]
    BleTransport(#[from] BleTransportError),
    #[error("wifi transport error: {0}")]
    WifiTransport(#[from] WifiTransportError),
    #[error("display transport error: {0}")]
    DisplayTransport(#[from] DisplayTransportError),
    #[error("pairing secret missing or unreadable at {path}: {source}")]
    PairingSecretMissing { path: String, source: std::io::Error },
}

impl DaemonError {
    /// §6.5: 0 normal, 2 config error, 3 fatal hardware error, 4 persistence
    /// error on the critical path.
    fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Config(_) | DaemonError::PairingSecretMissing { .. } => 2,
            DaemonError::Ble(_) | DaemonError::BleTransport(_) | DaemonError::Gpio(_) | DaemonError::DisplayTransport(_) => 3,
            DaemonError::Storage(_) => 4,
            DaemonError::Ownership(_) | DaemonError::Network(_) | DaemonError::WifiTransport(_) => 1,
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_pairing_secret(path: &std::path::Path) -> Result<Vec<u8>, DaemonError> {
    std::fs::read(path).map_err(|source| DaemonError::PairingSecretMissing { path: path.display().to_string(), source })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { overrides } => run(overrides).await,
        Commands::Config { overrides } => print_config(overrides),
        Commands::Reset { overrides } => reset(overrides),
    };

    if let Err(e) = result {
        error!(error = %e, "provisiond exiting");
        std::process::exit(e.exit_code());
    }
}

fn print_config(overrides: ConfigOverrides) -> Result<(), DaemonError> {
    let config = Config::load(&overrides)?;
    print!("{}", config.render_redacted());
    Ok(())
}

fn reset(overrides: ConfigOverrides) -> Result<(), DaemonError> {
    let config = Config::load(&overrides)?;
    let store = ConfigStore::open(&config.config_dir)?;
    store.clear_all()?;
    info!(config_dir = %config.config_dir.display(), "config store cleared");
    Ok(())
}

async fn run(overrides: ConfigOverrides) -> Result<(), DaemonError> {
    let config = Config::load(&overrides)?;
    init_tracing(&config.log_level);
    info!(config_dir = %config.config_dir.display(), "starting provisiond");

    let store = Arc::new(ConfigStore::open(&config.config_dir)?);
    let identity = provision_core::resolve_device_identity(&store, &IdentitySources::default());
    info!(device_id = %identity.device_id, mac = %identity.mac_address, "device identity resolved");

    let ownership_config = OwnershipConfig {
        max_attempts: config.max_failed_attempts,
        lockout_duration_secs: config.lockout_duration_secs,
        setup_timeout_secs: config.setup_timeout_secs,
        ..OwnershipConfig::default()
    };
    let ownership = Arc::new(OwnershipService::new(store.clone(), ownership_config));
    if !ownership.has_owner() {
        // Opens the registration window the `OwnerSetup` state's BLE/display
        // effects assume is already running once `InitComplete` fires.
        ownership.begin_setup();
    }

    let pairing_secret = load_pairing_secret(&config.pairing_secret_path)?;

    let bus = Arc::new(EventBus::new());

    let ble = Arc::new(
        BluerBleServer::new(
            bus.clone(),
            ownership.clone(),
            identity.device_id.clone(),
            identity.mac_address.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            pairing_secret,
        )
        .await?,
    );
    let ble: Arc<dyn provision_core::BleTransport> = ble;

    let wifi = Arc::new(NetworkManagerWifi::system(config.probe_endpoint.clone()).await?);
    let wifi: Arc<dyn provision_core::WifiTransport> = wifi;

    let display: Arc<dyn provision_core::DisplayTransport> = Arc::new(FramebufferDisplay::new(config.display_device.clone()));
    let display_health = Arc::new(AtomicBool::new(true));

    let reset_line = RppalResetLine::open(config.reset_gpio_pin)?;
    let reset_monitor = ResetMonitor::new(
        reset_line,
        ResetMonitorConfig { hold_threshold: std::time::Duration::from_secs(config.reset_hold_secs), ..ResetMonitorConfig::default() },
    );

    let watchdog = Watchdog::new(WatchdogConfig::default());

    let orchestrator = Orchestrator::new(
        bus.clone(),
        store.clone(),
        ownership.clone(),
        identity,
        ble.clone(),
        wifi.clone(),
        display,
        display_health.clone(),
        OrchestratorConfig::default(),
    );

    let reset_bus = bus.clone();
    tokio::spawn(async move { reset_monitor.run(&reset_bus).await });

    let watchdog_bus = bus.clone();
    tokio::spawn(async move { watchdog.run(&watchdog_bus, ble, wifi, display_health).await });

    orchestrator.start();
    tokio::select! {
        _ = orchestrator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}
