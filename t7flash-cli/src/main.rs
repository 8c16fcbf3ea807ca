//! t7flash CLI - Command-line firmware upgrade tool for T7-family devices.
//!
//! ## Features
//!
//! - Upgrade device firmware from a local image file or an HTTP(S) URL
//! - Inspect firmware image headers
//! - Discover devices on the network
//! - Shell completion generation
//! - Environment variable support

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use t7flash::device::registers;
use t7flash::progress::ProgressSink;
use t7flash::{ConnectionType, Device, FwImage, TcpBackend, UpgradeOptions, Upgrader};

mod config;

use config::Config;

/// t7flash - firmware upgrade tool for T7-family devices.
///
/// Environment variables:
///   T7FLASH_SERIAL       - Default device serial number
///   T7FLASH_HOST         - Default device host address
///   T7FLASH_CONNECTION   - Default connection type (usb, ethernet, any)
#[derive(Parser)]
#[command(name = "t7flash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Device serial number (discovered automatically if not specified).
    #[arg(short, long, global = true, env = "T7FLASH_SERIAL")]
    serial: Option<u32>,

    /// Device host address, bypassing discovery (host or host:port).
    #[arg(long, global = true, env = "T7FLASH_HOST")]
    host: Option<String>,

    /// Connection type.
    #[arg(
        short,
        long,
        global = true,
        default_value = "any",
        env = "T7FLASH_CONNECTION"
    )]
    connection: Connection,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported connection types.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Connection {
    /// USB connection (requires the vendor driver).
    Usb,
    /// Ethernet connection.
    Ethernet,
    /// Any available connection.
    Any,
}

impl From<Connection> for ConnectionType {
    fn from(connection: Connection) -> Self {
        match connection {
            Connection::Usb => ConnectionType::Usb,
            Connection::Ethernet => ConnectionType::Ethernet,
            Connection::Any => ConnectionType::Any,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upgrade a device with a firmware image.
    Upgrade {
        /// Path or HTTP(S) URL of the firmware image.
        image: String,

        /// Verify the written image byte-for-byte before rebooting.
        #[arg(long)]
        verify: bool,

        /// Skip the post-erase verification pass.
        #[arg(long)]
        skip_erase_check: bool,

        /// Re-enumeration timeout in seconds (default: 60).
        #[arg(long)]
        timeout: Option<u64>,

        /// Remember this device as the default for future runs.
        #[arg(long)]
        remember: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Path or HTTP(S) URL of the firmware image.
        image: String,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List devices reachable on the network.
    List {
        /// Output the device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read the firmware version of a device.
    Version,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if std::env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    debug!("t7flash v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match cli.config_path {
        Some(ref path) => Config::load_from_path(path),
        None => Config::load(),
    };

    if let Err(err) = run(&cli, &mut config) {
        let cancelled = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<t7flash::Error>(),
                Some(t7flash::Error::Cancelled)
            )
        });
        if cancelled {
            eprintln!("{} Upgrade cancelled", style("✗").red());
            std::process::exit(130);
        }
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(1);
    }
}

fn run(cli: &Cli, config: &mut Config) -> Result<()> {
    match &cli.command {
        Commands::Upgrade {
            image,
            verify,
            skip_erase_check,
            timeout,
            remember,
        } => cmd_upgrade(cli, config, image, *verify, *skip_erase_check, *timeout, *remember),
        Commands::Info { image, json } => cmd_info(image, *json),
        Commands::List { json } => cmd_list(*json),
        Commands::Version => cmd_version(cli, config),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Connection type after applying the config fallback.
fn resolve_connection(cli: &Cli, config: &Config) -> ConnectionType {
    match cli.connection {
        Connection::Any => config
            .device
            .connection
            .as_deref()
            .and_then(ConnectionType::from_name)
            .unwrap_or(ConnectionType::Any),
        other => other.into(),
    }
}

/// Select and open the target device.
fn get_device(
    cli: &Cli,
    config: &Config,
    backend: &TcpBackend,
    connection: ConnectionType,
) -> Result<Box<dyn Device>> {
    if let Some(host) = cli.host.as_ref().or(config.device.host.as_ref()) {
        return backend
            .open_host(host)
            .with_context(|| format!("Failed to open device at {host}"));
    }

    let devices = backend.discover().context("Device discovery failed")?;
    if devices.is_empty() {
        bail!("No devices found. Connect a device or specify one with --host.");
    }

    let serial = match cli.serial.or(config.device.serial) {
        Some(serial) => {
            if !devices.iter().any(|d| d.serial == serial) {
                bail!(
                    "Device {serial} not found; discovered: {}",
                    devices
                        .iter()
                        .map(|d| d.serial.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            serial
        },
        None if devices.len() == 1 => devices[0].serial,
        None => bail!(
            "Multiple devices found ({}); select one with --serial",
            devices
                .iter()
                .map(|d| d.serial.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };

    t7flash::open_device(backend, connection, serial)
        .with_context(|| format!("Failed to open device {serial}"))
}

/// Progress sink driving the indicatif bar.
struct BarSink {
    bar: ProgressBar,
}

impl ProgressSink for BarSink {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn update(&mut self, percent: f64, _done: bool) {
        self.bar.set_position(percent.round() as u64);
    }

    fn status(&mut self, text: &str, _done: bool) {
        self.bar.set_message(text.to_string());
    }
}

/// Upgrade command implementation.
fn cmd_upgrade(
    cli: &Cli,
    config: &mut Config,
    source: &str,
    verify: bool,
    skip_erase_check: bool,
    timeout: Option<u64>,
    remember: bool,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware image {}",
            style("📦").cyan(),
            style(source).cyan()
        );
    }

    let image = FwImage::load(source)
        .with_context(|| format!("Failed to load firmware image {source}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Firmware {} for device type {}, {} payload bytes",
            style("ℹ").blue(),
            style(format!("{:.4}", image.firmware_version())).bold(),
            image.header().intended_device,
            image.payload().len()
        );
    }

    let backend = TcpBackend::new();
    let connection = resolve_connection(cli, config);
    let device = get_device(cli, config, &backend, connection)?;
    let serial = device.serial_number();

    if !cli.quiet {
        eprintln!("{} Using device {}", style("🔌").cyan(), style(serial).bold());
    }

    let timeout = timeout.or(config.upgrade.timeout_secs).unwrap_or(60);
    let options = UpgradeOptions::default()
        .with_verify_image(verify || config.upgrade.verify_image)
        .with_verify_erase(!(skip_erase_check || config.upgrade.skip_erase_check))
        .with_reenumeration_timeout(Duration::from_secs(timeout));

    let upgrader = Upgrader::new(&backend).with_options(options);

    let token = upgrader.cancel_token();
    ctrlc::set_handler(move || token.cancel()).context("Failed to install Ctrl-C handler")?;

    let bar = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar
    };
    let mut sink = BarSink { bar: bar.clone() };

    let mut device = upgrader.upgrade_image(image, device, connection, &mut sink)?;
    bar.finish_and_clear();

    let version = device.read_f32(registers::FIRMWARE_VERSION)?;

    if remember {
        config.remember_device(serial)?;
    }

    if !cli.quiet {
        eprintln!(
            "\n{} Device {} is running firmware {}",
            style("🎉").green().bold(),
            serial,
            style(format!("{version:.4}")).bold()
        );
    }

    Ok(())
}

/// Render a digest as lowercase hex.
fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Info command implementation.
fn cmd_info(source: &str, json: bool) -> Result<()> {
    let image = FwImage::load(source)
        .with_context(|| format!("Failed to load firmware image {source}"))?;
    let header = image.header();

    if json {
        let info = serde_json::json!({
            "source": image.source_name(),
            "header_code": format!("0x{:08X}", header.header_code),
            "intended_device": header.intended_device,
            "contained_version": header.contained_version_fixed(),
            "required_upgrader_version": f64::from(header.required_upgrader_version),
            "declared_version": image.firmware_version(),
            "image_number": header.image_number,
            "num_images": header.num_images,
            "length_of_image": header.length_of_image,
            "payload_bytes": image.payload().len(),
            "sha_byte_count": header.sha_byte_count,
            "options": format!("0x{:08X}", header.options),
            "encrypted_sha": hex(&header.encrypted_sha),
            "unencrypted_sha": hex(&header.unencrypted_sha),
            "compatible": t7flash::check_compatibility(&image).is_ok(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("\n{}", style("Firmware Image").bold().underlined());
    eprintln!("  Source:           {}", image.source_name());
    eprintln!("  Header code:      0x{:08X}", header.header_code);
    eprintln!("  Intended device:  {}", header.intended_device);
    eprintln!(
        "  Contained ver.:   {:.4}",
        header.contained_version_fixed()
    );
    eprintln!(
        "  Required upgr.:   {:.4}",
        header.required_upgrader_version
    );
    eprintln!("  Declared ver.:    {:.4}", image.firmware_version());
    eprintln!(
        "  Image:            {} of {}",
        header.image_number + 1,
        header.num_images
    );
    eprintln!("  Payload:          {} bytes", image.payload().len());
    eprintln!("  Options:          0x{:08X}", header.options);
    eprintln!("  Encrypted SHA:    {}", hex(&header.encrypted_sha));
    eprintln!("  Unencrypted SHA:  {}", hex(&header.unencrypted_sha));

    match t7flash::check_compatibility(&image) {
        Ok(()) => eprintln!("\n  {} Compatible with this upgrader", style("✓").green()),
        Err(e) => eprintln!("\n  {} {}", style("✗").red(), e),
    }

    Ok(())
}

/// List command implementation.
fn cmd_list(json: bool) -> Result<()> {
    let backend = TcpBackend::new();
    let devices = backend.discover().context("Device discovery failed")?;

    if json {
        let list: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "serial": d.serial,
                    "address": d.addr.to_string(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&list).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Discovered devices").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("(none)").dim());
    } else {
        for device in &devices {
            eprintln!(
                "  {} {} at {}",
                style("•").green(),
                style(device.serial).cyan(),
                device.addr
            );
        }
    }

    Ok(())
}

/// Version command implementation.
fn cmd_version(cli: &Cli, config: &mut Config) -> Result<()> {
    let backend = TcpBackend::new();
    let connection = resolve_connection(cli, config);
    let mut device = get_device(cli, config, &backend, connection)?;

    let firmware = device.read_f32(registers::FIRMWARE_VERSION)?;
    let bootloader = device.read_f32(registers::BOOTLOADER_VERSION)?;

    eprintln!(
        "Device {}: firmware {}, boot loader {:.4}",
        device.serial_number(),
        style(format!("{firmware:.4}")).bold(),
        bootloader
    );

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
