use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idfu_core::{
    DeviceCatalog, DeviceEvent, DeviceFilter, DfuTransferEngine, Dialect, EngineConfig,
    NullObserver, NusbBackend, NusbCatalog, SendError, TransferChannel, UsbError,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Apple DFU / recovery mode USB tool (Pure Rust)", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Vendor id of the device to open (hex), defaults to any Apple DFU/recovery device
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Product id of the device to open (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    List {
        /// Show every USB device, not only Apple DFU/recovery devices
        #[arg(long)]
        all: bool,

        /// Only devices of this bDeviceClass
        #[arg(long)]
        class: Option<u8>,
    },
    /// Show details of the selected device
    Info,
    /// Upload an image
    Send {
        /// Image file
        file: PathBuf,

        /// Skip the DFU end-of-image request
        #[arg(long)]
        no_notify: bool,
    },
    /// Send a command string to iBoot
    Command {
        /// Command, e.g. "go" or "setenv auto-boot true"
        command: String,
    },
    /// Watch for devices coming and going
    Monitor {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,

        /// Show every USB device, not only Apple DFU/recovery devices
        #[arg(long)]
        all: bool,
    },
    /// Write the default engine configuration to a file
    InitConfig {
        /// Output path
        path: PathBuf,
    },
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{s}': {e}"))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

/// Map failures onto the stable error codes.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<SendError>() {
        return e.kind().code();
    }
    if let Some(e) = err.downcast_ref::<UsbError>() {
        return e.kind().code();
    }
    1
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn open_device(catalog: &NusbCatalog, args: &Args) -> Result<TransferChannel<NusbBackend>> {
    let channel = match (args.vid, args.pid) {
        (Some(vid), Some(pid)) => catalog.open(vid, pid)?,
        (None, None) => catalog.open_apple()?,
        _ => anyhow::bail!("--vid and --pid must be given together"),
    };
    Ok(channel)
}

fn run(args: Args) -> Result<()> {
    let catalog = NusbCatalog::new();
    let config = load_config(args.config.as_ref())?;

    match &args.command {
        Command::List { all, class } => {
            let filter = if *all {
                DeviceFilter::any()
            } else {
                DeviceFilter::apple_modes()
            };
            let devices: Vec<_> = catalog
                .list_attached(*class)?
                .into_iter()
                .filter(|d| filter.matches(d))
                .collect();
            if devices.is_empty() {
                info!("No devices found");
            }
            for device in devices {
                println!("{device}");
            }
        }
        Command::Info => {
            let mut channel = open_device(&catalog, &args)?;
            let device = channel.device_information().clone();
            println!("Device:        {}", device.identity());
            println!("Location:      {}", device.location());
            println!(
                "Class:         {:02X}/{:02X}/{:02X}",
                device.class, device.subclass, device.protocol
            );
            println!(
                "Manufacturer:  {}",
                device.manufacturer.as_deref().unwrap_or("-")
            );
            println!("Name:          {}", channel.friendly_name().unwrap_or("-"));
            println!("Serial:        {}", channel.serial_number().unwrap_or("-"));
            println!("Config bytes:  {}", device.configuration.len());

            let mut engine =
                DfuTransferEngine::with_observer(&mut channel, config, Arc::new(NullObserver))?;
            println!("Mode:          {}", engine.dialect());
            if engine.dialect() == Dialect::Dfu {
                let status = engine.get_status()?;
                println!("DFU state:     {} (status {})", status.state, status.status);
            }
        }
        Command::Send { file, no_notify } => {
            let image =
                std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let mut channel = open_device(&catalog, &args)?;
            let mut engine = DfuTransferEngine::new(&mut channel, config)?;

            info!(file = %file.display(), size = image.len(), mode = %engine.dialect(), "Uploading");
            let session = engine.send_buffer(&image, !no_notify)?;
            info!(
                bytes_sent = session.bytes_sent,
                chunks = session.chunks_sent,
                finalized = session.finalized,
                "Upload complete"
            );
        }
        Command::Command { command } => {
            let mut channel = open_device(&catalog, &args)?;
            let mut engine = DfuTransferEngine::new(&mut channel, config)?;
            engine.send_command(command)?;
        }
        Command::Monitor { interval_ms, all } => {
            let filter = if *all {
                DeviceFilter::any()
            } else {
                DeviceFilter::apple_modes()
            };
            let monitor = catalog.monitor(filter, Duration::from_millis(*interval_ms))?;
            info!("Watching for devices, Ctrl-C to stop");
            while let Some(event) = monitor.recv() {
                match event {
                    DeviceEvent::Connected(d) => println!("+ {d}"),
                    DeviceEvent::Disconnected(d) => println!("- {d}"),
                }
            }
        }
        Command::InitConfig { path } => {
            EngineConfig::default()
                .save_to_file(path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Default configuration written");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_ids() {
        assert_eq!(parse_hex_u16("05AC"), Ok(0x05AC));
        assert_eq!(parse_hex_u16("0x1227"), Ok(0x1227));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["idfu", "--vid", "05AC", "--pid", "1281", "command", "go"])
            .unwrap();
        assert_eq!(args.vid, Some(0x05AC));
        assert!(matches!(args.command, Command::Command { ref command } if command == "go"));
    }

    #[test]
    fn test_exit_code_from_usb_error() {
        let err = anyhow::Error::new(UsbError::Unsupported("x".into()));
        assert_eq!(exit_code(&err), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
