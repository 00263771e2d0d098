//! usb-redirect Client
//!
//! Lists local USB devices, checks filter rules and watches the device
//! manager's notifications.

use anyhow::{Context, Result};
use clap::Parser;
use client::config::{ClientConfig, load_config};
use client::usb::{FilterRules, RusbBackend, UsbBackend};
use client::{ChannelObserver, ManagerEvent, Session};
use common::setup_logging;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-redirect-client")]
#[command(author, version, about = "USB redirection client - redirect local USB devices to a remote VM")]
#[command(long_about = "
Discovers local USB devices and manages their redirection to a remote
virtual machine.

EXAMPLES:
    # Watch devices being plugged and unplugged (default)
    usb-redirect-client --watch

    # List devices with their auto-connect verdict
    usb-redirect-client --list-devices

    # Validate and normalize a filter rule string
    usb-redirect-client --check-filter '0x03,-1,-1,-1,0|-1,-1,-1,-1,1'

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-redirect/client.toml
    3. /etc/usb-redirect/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List local USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Parse a filter rule string, print it normalized and exit
    #[arg(long, value_name = "RULES")]
    check_filter: Option<String>,

    /// Print device manager notifications until Ctrl+C
    #[arg(long)]
    watch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    if let Some(rules) = &args.check_filter {
        let filter: FilterRules = rules
            .parse()
            .with_context(|| format!("Invalid filter '{}'", rules))?;
        println!("{}", filter);
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        load_config(path).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-redirect Client v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let settings = config.usb.manager_settings()?;
    let backend: Arc<dyn UsbBackend> = Arc::new(
        RusbBackend::new(config.usb.addressing).context("Failed to initialize libusb")?,
    );

    if args.list_devices {
        return list_devices(backend, &settings.auto_connect_filter).await;
    }

    if !args.watch {
        info!("No action given, watching devices");
    }
    let result = watch(Session::new(backend, settings)).await;

    info!("Client shutting down...");
    result
}

/// Print present devices with their auto-connect verdict
async fn list_devices(backend: Arc<dyn UsbBackend>, filter: &FilterRules) -> Result<()> {
    let mode = backend.addressing_mode();
    let devices = tokio::task::spawn_blocking(move || backend.enumerate())
        .await
        .context("Device enumeration task failed")?
        .context("Failed to enumerate USB devices")?;

    for device in devices.iter().filter(|d| !d.is_hub()) {
        let verdict = if filter.matches(&device.descriptor()) {
            "auto-connect"
        } else {
            "manual"
        };
        println!(
            "{:<10} {:<12} {}",
            device.key(mode).to_string(),
            verdict,
            device.description()
        );
    }
    Ok(())
}

/// Print manager notifications until Ctrl+C
async fn watch(session: Session) -> Result<()> {
    let manager = session
        .usb_device_manager()
        .await
        .context("Failed to start USB device manager")?;

    let (observer, events) = ChannelObserver::new();
    manager.subscribe(Arc::new(observer));

    for device in manager.devices() {
        println!("present  {} {}", device.key, device.info.description());
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(e) => {
                    warn!("Notification channel closed: {}", e);
                    break;
                }
            },
        }
    }

    Ok(())
}

fn print_event(event: &ManagerEvent) {
    let device = event.device();
    match event {
        ManagerEvent::DeviceAdded(_) => {
            println!("added    {} {}", device.key, device.info.description())
        }
        ManagerEvent::DeviceRemoved(_) => {
            println!("removed  {} {}", device.key, device.info.description())
        }
        ManagerEvent::AutoConnectFailed { reason, .. } => {
            println!("failed   {} {}", device.key, reason)
        }
        ManagerEvent::DeviceError { reason, .. } => {
            println!("error    {} {}", device.key, reason)
        }
    }
}
