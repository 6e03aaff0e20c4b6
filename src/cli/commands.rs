use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use crossbeam_channel::{after, never, select};
use pcsc::{Disposition, ShareMode};

use crate::cli::menu::Menu;
use crate::core::{
    backend::{probe_readers, DeviceStatusBackend},
    card_monitor::{CardEvent, CardMonitor},
    connection::{CardConnectionManager, CardType, ConnectionSettings},
    devices::DeviceList,
    observable::{event_channel, Observer},
    pcsc_backend::PcscBackend,
    reader_monitor::{ReaderEvent, ReaderMonitor},
    status_words::StatusWordCatalog,
    utils::{format_hex_spaced, parse_byte, parse_hex},
};

#[derive(Parser)]
#[command(name = "smartcard-control")]
#[command(about = "Monitor smart card readers and cards, and talk to cards over PC/SC")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase logging verbosity (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Status word table to use instead of the built-in one
    #[arg(long, global = true, value_name = "PATH")]
    pub catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    Readers {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Follow reader and card insertions and removals
    Monitor {
        /// Stop after this many seconds (runs until interrupted otherwise)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },

    /// Explain an APDU status word
    StatusWord {
        /// First status byte in hex (e.g. "6A")
        sw1: String,

        /// Second status byte in hex (e.g. "82")
        sw2: String,

        /// Response payload in hex
        #[arg(long)]
        data: Option<String>,
    },

    /// Wait for a card, send one APDU and print the response
    Transmit {
        /// APDU command in hex format (e.g., "00A40400")
        apdu: String,

        /// Only accept the card with this ATR
        #[arg(long)]
        atr: Option<String>,

        /// Connection share mode
        #[arg(short, long, default_value = "shared")]
        mode: ShareModeArg,

        /// Seconds to wait for a card
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Interactive mode
    Interactive {
        /// Initial connection share mode
        #[arg(short, long, default_value = "shared")]
        mode: ShareModeArg,

        /// Initial disposition used on reconnect
        #[arg(long, default_value = "leave")]
        disposition: DispositionArg,
    },
}

#[derive(Clone, Copy, Debug)]
pub enum ShareModeArg {
    Shared,
    Exclusive,
    Direct,
}

impl std::str::FromStr for ShareModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(ShareModeArg::Shared),
            "exclusive" => Ok(ShareModeArg::Exclusive),
            "direct" => Ok(ShareModeArg::Direct),
            _ => Err(format!("Invalid share mode: {s}")),
        }
    }
}

impl From<ShareModeArg> for ShareMode {
    fn from(mode: ShareModeArg) -> Self {
        match mode {
            ShareModeArg::Shared => ShareMode::Shared,
            ShareModeArg::Exclusive => ShareMode::Exclusive,
            ShareModeArg::Direct => ShareMode::Direct,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum DispositionArg {
    Leave,
    Reset,
    Unpower,
    Eject,
}

impl std::str::FromStr for DispositionArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leave" => Ok(DispositionArg::Leave),
            "reset" => Ok(DispositionArg::Reset),
            "unpower" => Ok(DispositionArg::Unpower),
            "eject" => Ok(DispositionArg::Eject),
            _ => Err(format!("Invalid disposition: {s}")),
        }
    }
}

impl From<DispositionArg> for Disposition {
    fn from(disposition: DispositionArg) -> Self {
        match disposition {
            DispositionArg::Leave => Disposition::LeaveCard,
            DispositionArg::Reset => Disposition::ResetCard,
            DispositionArg::Unpower => Disposition::UnpowerCard,
            DispositionArg::Eject => Disposition::EjectCard,
        }
    }
}

/// Map the number of `-v` flags to a log level.
pub fn log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(log_level(cli.verbose))
        .init();

    if let Some(path) = &cli.catalog {
        install_catalog(path)?;
    }

    let backend: Arc<dyn DeviceStatusBackend> = Arc::new(PcscBackend::new());

    match cli.command {
        Commands::Readers { detailed } => cmd_readers(backend.as_ref(), detailed),
        Commands::Monitor { duration, json } => cmd_monitor(backend, duration, json),
        Commands::StatusWord { sw1, sw2, data } => cmd_status_word(&sw1, &sw2, data.as_deref()),
        Commands::Transmit {
            apdu,
            atr,
            mode,
            timeout,
        } => cmd_transmit(backend, &apdu, atr.as_deref(), mode, timeout),
        Commands::Interactive { mode, disposition } => {
            cmd_interactive(backend, mode.into(), disposition.into())
        }
    }
}

fn install_catalog(path: &Path) -> Result<()> {
    let catalog = StatusWordCatalog::load(path)
        .with_context(|| format!("Failed to load status word table: {}", path.display()))?;
    log::debug!(
        "Loaded {} status words from {}",
        catalog.len(),
        path.display()
    );
    StatusWordCatalog::install_global(catalog)?;
    Ok(())
}

fn cmd_readers(backend: &dyn DeviceStatusBackend, detailed: bool) -> Result<()> {
    let context = backend
        .establish_context()
        .context("Failed to initialize PCSC")?;

    let readers = probe_readers(context.as_ref()).context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    println!("Available PCSC readers:");
    for (i, reader_info) in readers.iter().enumerate() {
        if detailed {
            println!("  [{}] {}", i, reader_info.name);
            println!(
                "      Status: {}",
                if reader_info.is_connected {
                    "Card present"
                } else {
                    "No card"
                }
            );
            if let Some(ref atr) = reader_info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
        } else if let Some(ref atr) = reader_info.atr {
            println!(
                "  [{}] {} [CARD - ATR: {}]",
                i,
                reader_info.name,
                format_hex_spaced(atr)
            );
        } else {
            println!("  [{}] {}", i, reader_info.name);
        }
    }

    Ok(())
}

fn cmd_monitor(
    backend: Arc<dyn DeviceStatusBackend>,
    duration: Option<u64>,
    json: bool,
) -> Result<()> {
    let reader_monitor = ReaderMonitor::new(Arc::clone(&backend));
    let card_monitor = CardMonitor::new(backend);

    let (reader_observer, reader_events) = event_channel::<ReaderEvent>();
    let (card_observer, card_events) = event_channel::<CardEvent>();
    let reader_observer: Arc<dyn Observer<ReaderEvent>> = reader_observer;
    let card_observer: Arc<dyn Observer<CardEvent>> = card_observer;

    reader_monitor
        .add_observer(Arc::clone(&reader_observer))
        .context("Failed to start reader monitoring")?;
    card_monitor
        .add_observer(Arc::clone(&card_observer))
        .context("Failed to start card monitoring")?;

    let deadline = match duration {
        Some(seconds) => after(Duration::from_secs(seconds)),
        None => never(),
    };

    if !json {
        println!("Monitoring readers and cards (Ctrl+C to stop)...");
    }

    let result = loop {
        select! {
            recv(reader_events) -> event => match event {
                Ok(event) => {
                    if let Err(err) = print_reader_event(&event, json) {
                        break Err(err);
                    }
                }
                Err(_) => break Ok(()),
            },
            recv(card_events) -> event => match event {
                Ok(event) => {
                    if let Err(err) = print_card_event(&event, json) {
                        break Err(err);
                    }
                }
                Err(_) => break Ok(()),
            },
            recv(deadline) -> _ => break Ok(()),
        }
    };

    reader_monitor.remove_observer(&reader_observer);
    card_monitor.remove_observer(&card_observer);
    result
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn print_reader_event(event: &ReaderEvent, json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "kind": "reader",
            "event": event,
        });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    for reader in &event.added {
        println!("[{}] reader added: {}", timestamp(), reader);
    }
    for reader in &event.removed {
        println!("[{}] reader removed: {}", timestamp(), reader);
    }
    Ok(())
}

fn print_card_event(event: &CardEvent, json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "kind": "card",
            "event": event,
        });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    for card in &event.added {
        println!(
            "[{}] card inserted in {}: ATR {}",
            timestamp(),
            card.reader,
            format_hex_spaced(&card.atr)
        );
    }
    for card in &event.removed {
        println!(
            "[{}] card removed from {}: ATR {}",
            timestamp(),
            card.reader,
            format_hex_spaced(&card.atr)
        );
    }
    Ok(())
}

fn cmd_status_word(sw1: &str, sw2: &str, data: Option<&str>) -> Result<()> {
    let sw1 = parse_byte(sw1).context("Invalid SW1")?;
    let sw2 = parse_byte(sw2).context("Invalid SW2")?;
    let data = data
        .map(parse_hex)
        .transpose()
        .context("Invalid response data")?;

    match StatusWordCatalog::global().format_bytes(sw1, sw2, data.as_deref()) {
        Some(text) => println!("{text}"),
        None => println!("Unknown status word: {sw1:02X} {sw2:02X}"),
    }
    Ok(())
}

fn cmd_transmit(
    backend: Arc<dyn DeviceStatusBackend>,
    apdu_hex: &str,
    atr_hex: Option<&str>,
    mode: ShareModeArg,
    timeout: u64,
) -> Result<()> {
    let apdu = parse_hex(apdu_hex).context("Failed to parse APDU")?;
    if apdu.is_empty() {
        bail!("APDU cannot be empty");
    }

    let card_type = match atr_hex {
        Some(atr) => CardType::atr(parse_hex(atr).context("Failed to parse ATR")?),
        None => CardType::Any,
    };

    let settings = ConnectionSettings::default()
        .with_request_timeout(Duration::from_secs(timeout))
        .with_share_mode(mode.into())
        .with_card_type(card_type);
    let mut manager = CardConnectionManager::with_settings(backend, settings);
    manager.connect(None, None).context("Failed to connect to a card")?;

    if let Some(session) = manager.session() {
        println!("Reader: {}", session.reader());
        println!("ATR: {}", format_hex_spaced(session.atr()));
    }
    println!("APDU: {}", format_hex_spaced(&apdu));

    let response = manager
        .transmit(&apdu)
        .context("Failed to execute transmit command")?;

    println!("Response: {}", format_hex_spaced(&response));
    println!("{}", crate::core::apdu::describe_response(&response));

    manager.disconnect(None)?;
    Ok(())
}

fn cmd_interactive(
    backend: Arc<dyn DeviceStatusBackend>,
    share_mode: ShareMode,
    disposition: Disposition,
) -> Result<()> {
    let devices = DeviceList::new(Arc::clone(&backend));
    devices.start().context("Failed to start device monitoring")?;

    let mut manager = CardConnectionManager::new(backend);
    manager.set_share_mode(share_mode);
    manager.set_disposition(disposition);

    let stdin = io::stdin();
    let mut menu = Menu::new(&devices, manager, stdin.lock());
    let result = menu.run();

    devices.stop();
    result
}
