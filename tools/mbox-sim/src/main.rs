//! mbox-sim - exercise the host/BMC drivers against simulated hardware
//!
//! # Purpose
//! Attaches the mailbox and LPC controller drivers to register-level models
//! described by a platform file, and plays the BMC side so the full frame
//! path can be watched from a terminal.
//!
//! # Commands
//! - `info` - Show devices and what each driver bound to
//! - `loopback` - Send frames that the simulated BMC echoes back
//! - `send` - Send one frame and show what the BMC received
//! - `atn` - Post an attention byte

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use cap_broker::{DeviceInfo, RamWindow, SoftBroker};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dddk_runtime::{Driver, MiscRegistry, Signals};
use kaal_drivers::mbox_host::MBOX_NUM_DATA_REGS;
use kaal_drivers::{probe_device, BoundDriver, MboxConfig, MboxHost, SimMailbox};
use serde::Deserialize;

const DEFAULT_PLATFORM: &str = include_str!("../platforms/ast2500.toml");

#[derive(Parser)]
#[command(name = "mbox-sim")]
#[command(author = "KaaL Team")]
#[command(version)]
#[command(about = "Host mailbox driver on simulated hardware", long_about = None)]
struct Cli {
    /// Platform description (defaults to a built-in AST2500 layout)
    #[arg(short, long, global = true)]
    platform: Option<PathBuf>,

    /// Ignore the mailbox interrupt and poll instead
    #[arg(long, global = true)]
    poll: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show devices and bound drivers
    Info,

    /// Send frames through a simulated BMC that echoes them back
    Loopback {
        /// Number of frames
        #[arg(short, long, default_value_t = 4)]
        frames: usize,
    },

    /// Send one frame
    Send {
        /// Frame payload as hex, at most 14 bytes
        hex: String,
    },

    /// Post an attention byte
    Atn {
        /// Byte value, decimal or 0x-prefixed hex
        byte: String,
    },
}

/// Platform file layout
#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    mailbox: MboxConfig,

    #[serde(rename = "device", default)]
    devices: Vec<DeviceInfo>,
}

/// Simulated platform with drivers attached
struct Board {
    broker: SoftBroker,
    misc: MiscRegistry,
    drivers: Vec<BoundDriver>,
    mailboxes: HashMap<String, Arc<SimMailbox>>,
}

impl Board {
    fn bring_up(platform: &Platform, poll: bool) -> anyhow::Result<Self> {
        log::debug!("bringing up {} device(s)", platform.devices.len());
        let mut broker = SoftBroker::new();
        let mut mailboxes = HashMap::new();

        for device in &platform.devices {
            if MboxHost::matches(device) {
                let sim = Arc::new(SimMailbox::new());
                broker.add_device(device.clone(), sim.clone())?;
                if let Some(irq) = device.irq {
                    sim.connect_irq(broker.irq_table(), irq);
                    if poll {
                        broker.set_irq_routable(irq, false);
                    }
                }
                mailboxes.insert(device.name.clone(), sim);
            } else {
                broker.add_device(device.clone(), Arc::new(RamWindow::new(device.reg.size)))?;
            }
        }

        let misc = MiscRegistry::new();
        let mut drivers = Vec::new();
        for device in &platform.devices {
            let bound = probe_device(&mut broker, &misc, device, platform.mailbox)
                .with_context(|| format!("probing {}", device.name))?;
            drivers.extend(bound);
        }

        Ok(Self {
            broker,
            misc,
            drivers,
            mailboxes,
        })
    }

    fn mailbox(&self) -> anyhow::Result<(&MboxHost, Arc<SimMailbox>)> {
        let host = self
            .drivers
            .iter()
            .find_map(|d| match d {
                BoundDriver::MboxHost(host) => Some(host),
                _ => None,
            })
            .context("platform has no mailbox")?;
        let sim = self
            .mailboxes
            .get(host.device_name())
            .cloned()
            .context("mailbox has no simulation")?;
        Ok((host, sim))
    }

    fn tear_down(mut self) -> anyhow::Result<()> {
        while let Some(driver) = self.drivers.pop() {
            driver.remove(&mut self.broker, &self.misc)?;
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let platform = load_platform(cli.platform.as_ref())?;
    let board = Board::bring_up(&platform, cli.poll)?;

    match cli.command {
        Commands::Info => show_info(&platform, &board),
        Commands::Loopback { frames } => loopback(&board, frames)?,
        Commands::Send { hex } => send(&board, &parse_hex(&hex)?)?,
        Commands::Atn { byte } => atn(&board, parse_byte(&byte)?)?,
    }

    board.tear_down()
}

fn load_platform(path: Option<&PathBuf>) -> anyhow::Result<Platform> {
    let text = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => DEFAULT_PLATFORM.to_string(),
    };
    let platform: Platform = toml::from_str(&text).context("parsing platform description")?;
    if platform.devices.is_empty() {
        anyhow::bail!("platform describes no devices");
    }
    Ok(platform)
}

fn show_info(platform: &Platform, board: &Board) {
    println!("{}", "KaaL mailbox simulator".bold().green());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("Devices:");
    for device in &platform.devices {
        let irq = device
            .irq
            .map_or_else(|| "-".to_string(), |irq| irq.to_string());
        println!(
            "  {:<24} {:<20} reg {:#010x}+{:#x}  irq {}",
            device.name.bold(),
            device.compatible,
            device.reg.base,
            device.reg.size,
            irq
        );
    }

    println!("\nDrivers:");
    for driver in &board.drivers {
        match driver {
            BoundDriver::MboxHost(host) => println!(
                "  {:<24} {:?}",
                driver.name().cyan(),
                host.source()
            ),
            BoundDriver::LpcCtrl(lpc) => println!(
                "  {:<24} window {:#x} bytes",
                driver.name().cyan(),
                lpc.endpoint().window_size()
            ),
        }
    }
}

/// Simulated BMC that echoes every outbound frame back to the host
fn spawn_echo(sim: Arc<SimMailbox>, stop: Arc<AtomicBool>) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut echoed = 0;
        while !stop.load(Ordering::SeqCst) {
            match sim.take_outbound() {
                Some(frame) => {
                    while !sim.deliver(&frame) {
                        if stop.load(Ordering::SeqCst) {
                            return echoed;
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    echoed += 1;
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        echoed
    })
}

fn loopback(board: &Board, frames: usize) -> anyhow::Result<()> {
    let (host, sim) = board.mailbox()?;
    let endpoint = host.endpoint();
    let signals = Signals::new();

    let stop = Arc::new(AtomicBool::new(false));
    let echo = spawn_echo(sim, stop.clone());

    println!("{} Loopback of {} frame(s) via {:?}", "🔁".green(), frames, host.source());
    let mut failures = 0;
    for n in 0..frames {
        let frame: Vec<u8> = (0..MBOX_NUM_DATA_REGS).map(|i| (n * 16 + i) as u8).collect();
        let started = Instant::now();

        endpoint.write(&frame)?;
        let mut buf = [0u8; MBOX_NUM_DATA_REGS];
        endpoint.read(&mut buf, &signals)?;

        let ok = buf[..] == frame[..];
        if !ok {
            failures += 1;
        }
        println!(
            "  frame {:>3}: {} {} ({:?})",
            n,
            hex(&buf),
            if ok { "ok".green() } else { "MISMATCH".red() },
            started.elapsed()
        );
    }

    stop.store(true, Ordering::SeqCst);
    let echoed = echo
        .join()
        .map_err(|_| anyhow::anyhow!("echo thread panicked"))?;

    if failures > 0 {
        anyhow::bail!("{} of {} frames came back corrupted", failures, frames);
    }
    println!("{} {} frame(s) echoed", "✅".green(), echoed);
    Ok(())
}

fn send(board: &Board, payload: &[u8]) -> anyhow::Result<()> {
    let (host, sim) = board.mailbox()?;

    let sent = host.endpoint().write(payload)?;
    if sent < payload.len() {
        println!(
            "{} payload truncated to {} bytes",
            "⚠".yellow(),
            MBOX_NUM_DATA_REGS
        );
    }

    match sim.take_outbound() {
        Some(frame) => println!("BMC received: {}", hex(&frame[..sent])),
        None => println!("BMC received nothing"),
    }
    Ok(())
}

fn atn(board: &Board, byte: u8) -> anyhow::Result<()> {
    let (host, sim) = board.mailbox()?;
    host.endpoint().signal(byte)?;
    println!("BMC attention byte: {:#04x}", sim.attention());
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if digits.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits in '{}'", text);
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn parse_byte(text: &str) -> anyhow::Result<u8> {
    let value = match text.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    value.with_context(|| format!("'{}' is not a byte value", text))
}
