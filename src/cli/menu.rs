//! Text menu of the interactive mode.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use pcsc::{Disposition, ShareMode};

use crate::core::{
    apdu::{describe_response, predefined_commands},
    connection::{CardConnectionManager, CardType},
    devices::DeviceList,
    error::SmartcardError,
    utils::{format_hex, format_hex_spaced, parse_hex},
};

const SHARE_MODES: [(ShareMode, &str, &str); 3] = [
    (
        ShareMode::Exclusive,
        "SCARD_SHARE_EXCLUSIVE",
        "This application is not willing to share the card with other applications",
    ),
    (
        ShareMode::Shared,
        "SCARD_SHARE_SHARED",
        "This application is willing to share the card with other applications (default)",
    ),
    (
        ShareMode::Direct,
        "SCARD_SHARE_DIRECT",
        "This application takes the reader for its private use and controls it directly",
    ),
];

const DISPOSITIONS: [(Disposition, &str, &str); 4] = [
    (Disposition::LeaveCard, "SCARD_LEAVE_CARD", "Do nothing (default)"),
    (Disposition::ResetCard, "SCARD_RESET_CARD", "Reset the card (warm reset)"),
    (Disposition::UnpowerCard, "SCARD_UNPOWER_CARD", "Unpower the card (cold reset)"),
    (Disposition::EjectCard, "SCARD_EJECT_CARD", "Eject the card"),
];

fn share_mode_name(mode: ShareMode) -> &'static str {
    SHARE_MODES
        .iter()
        .find(|(value, _, _)| *value == mode)
        .map_or("unknown", |(_, name, _)| *name)
}

fn disposition_name(disposition: Disposition) -> &'static str {
    DISPOSITIONS
        .iter()
        .find(|(value, _, _)| *value == disposition)
        .map_or("unknown", |(_, name, _)| *name)
}

/// Interactive session over a [`DeviceList`] and a [`CardConnectionManager`].
///
/// Reaching the end of the input behaves like quitting.
pub struct Menu<'a, R> {
    devices: &'a DeviceList,
    manager: CardConnectionManager,
    input: R,
    finished: bool,
}

impl<'a, R: BufRead> Menu<'a, R> {
    pub fn new(devices: &'a DeviceList, manager: CardConnectionManager, input: R) -> Self {
        Self {
            devices,
            manager,
            input,
            finished: false,
        }
    }

    pub fn manager(&self) -> &CardConnectionManager {
        &self.manager
    }

    pub fn run(&mut self) -> Result<()> {
        print_main_menu();
        while !self.finished {
            self.main_menu()?;
        }
        if self.manager.is_connected() {
            self.manager.disconnect(None)?;
        }
        println!("Goodbye!");
        Ok(())
    }

    fn read_choice(&mut self, prompt: &str) -> Result<Option<String>> {
        print!("{prompt}");
        io::stdout().flush().context("Failed to flush stdout")?;

        let mut input = String::new();
        let read = self
            .input
            .read_line(&mut input)
            .context("Failed to read input")?;
        if read == 0 {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(input.trim().to_lowercase()))
    }

    fn main_menu(&mut self) -> Result<()> {
        println!("============= Select action =============");
        println!("(r|s|d|m|c|q|h)");
        let Some(choice) = self.read_choice("> ")? else {
            return Ok(());
        };

        match choice.as_str() {
            "s" => self.print_cards(),
            "r" => self.print_readers(),
            "m" => self.choose_share_mode()?,
            "d" => self.choose_disposition()?,
            "c" => {
                if self.connect()? {
                    print_card_menu();
                    while !self.finished && self.card_menu()? {}
                }
            }
            "h" => print_main_menu(),
            "q" => self.finished = true,
            _ => println!("Wrong value"),
        }
        Ok(())
    }

    fn print_readers(&self) {
        println!("--------- READERS ---------");
        for (i, reader) in self.devices.readers().iter().enumerate() {
            println!("({i}) : {reader}");
        }
        println!("---------------------------");
    }

    fn print_cards(&self) {
        println!("---------- CARDS ----------");
        for (i, card) in self.devices.cards().iter().enumerate() {
            println!("({}) : ATR = {}, Reader = {}", i, format_hex(&card.atr), card.reader);
        }
        println!("---------------------------");
    }

    fn choose_share_mode(&mut self) -> Result<()> {
        println!("Choose a sharing mode for the connection :");
        for (i, (_, name, description)) in SHARE_MODES.iter().enumerate() {
            println!("({}) {:<28} {}", i + 1, name, description);
        }
        let Some(choice) = self.read_choice("> ")? else {
            return Ok(());
        };

        let mode = match choice.parse::<usize>() {
            Ok(index) if (1..=SHARE_MODES.len()).contains(&index) => SHARE_MODES[index - 1].0,
            _ => {
                println!("Error : Unknown share mode (wrong index)");
                ShareMode::Shared
            }
        };
        self.manager.set_share_mode(mode);
        Ok(())
    }

    fn choose_disposition(&mut self) -> Result<()> {
        println!("Choose a disposition mode for the disconnection :");
        for (i, (_, name, description)) in DISPOSITIONS.iter().enumerate() {
            println!("({}) {:<24} {}", i, name, description);
        }
        let Some(choice) = self.read_choice("> ")? else {
            return Ok(());
        };

        let disposition = match choice.parse::<usize>() {
            Ok(index) if index < DISPOSITIONS.len() => DISPOSITIONS[index].0,
            _ => {
                println!("Error : Unknown disposition (wrong index)");
                Disposition::LeaveCard
            }
        };
        self.manager.set_disposition(disposition);
        Ok(())
    }

    /// Returns whether a card session is open.
    fn connect(&mut self) -> Result<bool> {
        if self.devices.no_card_available() || self.devices.no_reader_available() {
            println!("No card available to connect to");
            return Ok(false);
        }

        let settings = self.manager.settings();
        println!(
            "--- share mode : {} --- disposition : {} ---",
            share_mode_name(settings.share_mode),
            disposition_name(settings.disposition)
        );
        println!("Choose a smartcard to connect to :");
        self.print_cards();
        let Some(choice) = self.read_choice("> ")? else {
            return Ok(false);
        };

        let connected = choice
            .parse::<usize>()
            .context("Invalid card index")
            .and_then(|index| Ok(self.devices.atr_for_card_index(index)?))
            .and_then(|atr| Ok(self.manager.connect(Some(CardType::atr(atr)), None)?));
        match connected {
            Ok(()) => Ok(true),
            Err(err) => {
                println!("Error : {err:#}");
                Ok(false)
            }
        }
    }

    /// Drop a session whose card went away.
    fn card_lost(&mut self) {
        println!("Card disconnected");
        if let Err(err) = self.manager.disconnect(None) {
            log::debug!("Closing lost session: {}", err);
        }
    }

    /// One round of the card menu. Returns whether to stay in it.
    fn card_menu(&mut self) -> Result<bool> {
        if self.manager.verify_card_connected().is_err() {
            self.card_lost();
            return Ok(false);
        }

        println!("============= Select action =============");
        println!("(t|i|r|d|w|c|e|h)");
        let Some(choice) = self.read_choice("> ")? else {
            return Ok(false);
        };

        if self.manager.verify_card_connected().is_err() {
            self.card_lost();
            return Ok(false);
        }

        let disposition = self.manager.settings().disposition;
        let outcome = match choice.as_str() {
            "t" => {
                print_transmit_menu();
                while !self.finished && self.transmit_menu()? {}
                Ok(self.manager.is_connected())
            }
            "i" => self.manager.card_info().map(|info| {
                println!("-------- CARD INFO --------");
                println!("\tATR : {}", format_hex_spaced(&info.atr));
                println!("\tReader : {}", info.reader);
                println!("---------------------------");
                true
            }),
            "h" => {
                print_card_menu();
                Ok(true)
            }
            "r" => self.manager.reconnect(Some(disposition)).map(|()| true),
            "d" => self.manager.disconnect(Some(disposition)).map(|()| false),
            "w" => self.manager.warm_reset().map(|()| true),
            "c" => self.manager.cold_reset().map(|()| true),
            "e" => self.manager.eject().map(|()| false),
            _ => {
                println!("Wrong value");
                Ok(true)
            }
        };

        match outcome {
            Ok(stay) => Ok(stay),
            Err(err) if err.is_connectivity_lost() => {
                self.card_lost();
                Ok(false)
            }
            Err(err) => {
                println!("Error : {err}");
                Ok(self.manager.is_connected())
            }
        }
    }

    /// One round of the transmit menu. Returns whether to stay in it.
    fn transmit_menu(&mut self) -> Result<bool> {
        if self.manager.verify_card_connected().is_err() {
            self.card_lost();
            return Ok(false);
        }

        println!("============= Select action =============");
        println!("(1|2|3|4|5|6|7|8|c|q|h)");
        let Some(choice) = self.read_choice("> ")? else {
            return Ok(false);
        };

        let apdu = match choice.as_str() {
            "q" => return Ok(false),
            "h" => {
                print_transmit_menu();
                return Ok(true);
            }
            "c" => {
                let Some(custom) = self.read_choice("APDU CMD : ")? else {
                    return Ok(false);
                };
                match parse_hex(&custom) {
                    Ok(apdu) => apdu,
                    Err(err) => {
                        println!("Error : {err}");
                        return Ok(true);
                    }
                }
            }
            other => {
                let commands = predefined_commands();
                match other.parse::<usize>() {
                    Ok(index) if (1..=commands.len()).contains(&index) => {
                        commands[index - 1].apdu.clone()
                    }
                    _ => {
                        println!("Wrong value");
                        return Ok(true);
                    }
                }
            }
        };

        match self.manager.transmit(&apdu) {
            Ok(response) => {
                println!("{}", describe_response(&response));
                Ok(true)
            }
            Err(SmartcardError::InvalidApdu(reason)) => {
                println!("Error : {reason}");
                Ok(true)
            }
            Err(err) if err.is_connectivity_lost() => {
                self.card_lost();
                Ok(false)
            }
            Err(err) => {
                println!("Error : {err}");
                Ok(true)
            }
        }
    }
}

fn print_main_menu() {
    println!("=============== Main menu ===============");
    println!("(r) : show scanned readers");
    println!("(s) : show scanned smartcards");
    println!("(d) : change default disposition");
    println!("(m) : change connection sharing mode");
    println!("(c) : connect to a card");
    println!("(q) : quit");
    println!("(h) : print help");
}

fn print_card_menu() {
    println!("=============== Card menu ===============");
    println!("(t) : transmit");
    println!("(i) : info about card");
    println!("(r) : reconnect");
    println!("(d) : disconnect");
    println!("(w) : warm reset");
    println!("(c) : cold reset");
    println!("(e) : eject");
    println!("(h) : print help");
}

fn print_transmit_menu() {
    println!("============= Transmit menu =============");
    for (i, command) in predefined_commands().iter().enumerate() {
        println!("({}) : transmit {}", i + 1, command.label);
    }
    println!("(c) : transmit custom command (format : XX XX XX...)");
    println!("(q) : return to card menu");
    println!("(h) : print help");
}
