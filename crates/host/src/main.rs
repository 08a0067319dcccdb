//! recovery-usb
//!
//! Command line front end for the host library: wait for a device in DFU or
//! recovery mode, print its identity, read descriptors, reset it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use host::HostConfig;
use host::usb::{ControlRequest, RecoveryClient, RusbBackend};
use protocol::{
    ControlSetup, DeviceMode, MAX_RESPONSE_LEN, string_descriptor_ascii,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "recovery-usb")]
#[command(
    author,
    version,
    about = "Talk to devices in DFU or recovery mode over USB"
)]
#[command(long_about = "
Finds a device in DFU or recovery mode, opens a control session on it and
reports what it says about itself.

EXAMPLES:
    # Wait up to 10 seconds for a DFU device and print its identity
    recovery-usb info --mode dfu --wait 10

    # Same, as JSON
    recovery-usb info --json

    # Read string descriptor 4
    recovery-usb descriptor --index 4

    # Reset a device in recovery mode
    recovery-usb reset --mode recovery

    # List attached devices
    recovery-usb list

CONFIGURATION:
    Configuration files are searched in the following order:
    1. Path specified with --config
    2. ~/.config/recovery-usb/host.toml
    3. /etc/recovery-usb/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire a session and print the device identity
    Info {
        /// dfu, wtf, recovery or a product code such as 0x1281
        #[arg(short, long, default_value = "dfu")]
        mode: DeviceMode,

        /// Seconds to wait for the device
        #[arg(short, long, default_value_t = 5)]
        wait: u32,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Read one string descriptor and print it as ASCII
    Descriptor {
        #[arg(short, long, default_value = "dfu")]
        mode: DeviceMode,

        /// Descriptor index
        #[arg(short, long)]
        index: u8,

        /// Language id
        #[arg(long, default_value_t = 0x040a)]
        language: u16,
    },

    /// Reset the device and let it re-enumerate
    Reset {
        #[arg(short, long, default_value = "dfu")]
        mode: DeviceMode,
    },

    /// Wait until a device in the given mode can be opened
    Wait {
        #[arg(short, long)]
        mode: DeviceMode,

        #[arg(short, long, default_value_t = 10)]
        seconds: u32,
    },

    /// List attached devices with the configured vendor id
    List,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("recovery-usb v{}", env!("CARGO_PKG_VERSION"));

    let backend = RusbBackend::new().context("Failed to initialize libusb")?;
    let mut client = RecoveryClient::new(backend, config.open_policy(), config.acquire_policy());

    match args.command.unwrap_or(Command::List) {
        Command::Info { mode, wait, json } => run_info(&mut client, mode, wait, json),
        Command::Descriptor {
            mode,
            index,
            language,
        } => run_descriptor(&mut client, &config, mode, index, language),
        Command::Reset { mode } => run_reset(&mut client, mode),
        Command::Wait { mode, seconds } => {
            client
                .acquire_within_seconds(mode, seconds)
                .with_context(|| format!("No {} device within {}s", mode, seconds))?;
            println!("{} device ready", mode);
            Ok(())
        }
        Command::List => run_list(&client),
    }
}

fn run_info(
    client: &mut RecoveryClient<RusbBackend>,
    mode: DeviceMode,
    wait: u32,
    json: bool,
) -> Result<()> {
    let session = client
        .acquire_within_seconds(mode, wait)
        .with_context(|| format!("No {} device within {}s", mode, wait))?;

    let incomplete = session.device_info().is_none_or(|i| i.srtg.is_none());
    if incomplete {
        session
            .query_self_identity()
            .context("Failed to query device identity")?;
    }

    let location_id = session.location_id();
    let device_mode = DeviceMode::from_product_id(session.mode());
    let info = session
        .device_info()
        .cloned()
        .context("Session closed while reading identity")?;

    if json {
        let out = serde_json::json!({
            "mode": device_mode.to_string(),
            "product_id": session.mode(),
            "location_id": location_id,
            "identity": info,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Mode:     {}", device_mode);
        println!("Location: {:#010x}", location_id);
        println!("{}", info);
    }

    Ok(())
}

fn run_descriptor(
    client: &mut RecoveryClient<RusbBackend>,
    config: &HostConfig,
    mode: DeviceMode,
    index: u8,
    language: u16,
) -> Result<()> {
    let session = client
        .open(mode)
        .with_context(|| format!("Failed to open {} device", mode))?;

    let setup = ControlSetup::string_descriptor(index, language, MAX_RESPONSE_LEN as u16);
    let request = ControlRequest::new(setup.request_type, setup.request, setup.value, setup.index);
    let mut buf = [0u8; MAX_RESPONSE_LEN];
    let len = session
        .transfer_with_timeout(request, &mut buf, config.default_timeout())
        .with_context(|| format!("Failed to read string descriptor {}", index))?;

    let ascii = string_descriptor_ascii(&buf[..len]).context("Malformed string descriptor")?;
    println!("{}", String::from_utf8_lossy(&ascii));
    Ok(())
}

fn run_reset(client: &mut RecoveryClient<RusbBackend>, mode: DeviceMode) -> Result<()> {
    client
        .open(mode)
        .with_context(|| format!("Failed to open {} device", mode))?
        .reset_and_reenumerate()
        .context("Failed to reset device")?;
    client.close();
    println!("Reset requested; the device will re-enumerate");
    Ok(())
}

fn run_list(client: &RecoveryClient<RusbBackend>) -> Result<()> {
    let devices = client.list_devices().context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Found {} device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {}",
            device.vendor_id,
            device.product_id,
            DeviceMode::from_product_id(device.product_id)
        );
        println!(
            "      Bus {:03} Device {:03} Location {:#010x}",
            device.bus_number, device.address, device.location_id
        );
    }

    Ok(())
}
