//! Whole-cartridge read and write workflows.
//!
//! These combine the flash engine with erase cadence, retry policy,
//! progress reporting, and cooperative yielding. Long loops stay
//! responsive without preemption: between banks the orchestration polls
//! the session fault channel, asks the caller's [`Monitor`] whether the
//! cartridge is still present, and gives it an animation tick. A removal
//! or background fault aborts the whole operation, never just the current
//! command, so a reported success always means a fully verified image.

use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::bank::BANK_SIZE;
use crate::error::Error;
use crate::flash::{
    erase_cadence, erase_sector, get_flash_type, read_bank, total_banks, write_bank,
    FlashChipInfo,
};
use crate::session::{Session, REPLY_TIMEOUT};
use crate::wire::{Command, Reply};

/// Write-and-verify attempts per bank before giving up.
pub const WRITE_RETRIES: u32 = 3;
/// Pause between write attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Banks of flash reserved for saves right after the game data under the
/// default in-ROM save convention (32 KiB).
pub const DEFAULT_SAVE_BANKS: usize = 2;

/// ROM header range holding the cartridge title.
const TITLE_RANGE: std::ops::Range<usize> = 0x134..0x144;

/// Caller-supplied hooks for progress, presence polling, and animation.
///
/// All three are invoked between protocol operations on the caller thread;
/// none of them may leave a listener registered when they return.
pub trait Monitor {
    /// Fractional completion, 0 to 100.
    fn progress(&mut self, percent: u8) {
        let _ = percent;
    }

    /// Is the cartridge still seated? Returning false aborts the transfer.
    fn presence(&mut self, session: &Session) -> bool {
        let _ = session;
        true
    }

    /// Cooperative animation tick.
    fn animate(&mut self, session: &Session) {
        let _ = session;
    }
}

/// The no-op monitor.
impl Monitor for () {}

/// Ask the device whether a cartridge is seated in the slot.
pub fn detect_cartridge(session: &Session) -> Result<bool, Error> {
    match session.transact(Command::DetectCart, REPLY_TIMEOUT, "cartridge detect")? {
        Reply::DetectCart { present } => Ok(present),
        _ => Err(Error::Protocol("cartridge detect")),
    }
}

/// Read the cartridge title out of the bank 0 header.
pub fn read_title(session: &Session) -> Result<String, Error> {
    let bank0 = read_bank(session, 0)?;
    Ok(title_from_image(&bank0))
}

/// Extract the title from the header of a ROM image (or its first bank).
pub fn title_from_image(bank0: &[u8]) -> String {
    bank0[TITLE_RANGE]
        .iter()
        .take_while(|&&b| (0x20..0x7F).contains(&b))
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn tick(session: &Session, monitor: &mut dyn Monitor) -> Result<(), Error> {
    if let Some(fault) = session.take_fault() {
        return Err(fault);
    }
    if !monitor.presence(session) {
        return Err(Error::CartridgeRemoved);
    }
    monitor.animate(session);
    Ok(())
}

/// Read the full ROM image off the cartridge.
///
/// The chip size determines the bank count; banks are read sequentially
/// with a cooperative tick before each one and progress after it.
pub fn read_cartridge(session: &Session, monitor: &mut dyn Monitor) -> Result<Vec<u8>, Error> {
    if !detect_cartridge(session)? {
        return Err(Error::NoCartridge);
    }
    let chip = get_flash_type(session)?;
    let banks = total_banks(chip);
    info!("reading {} banks from {} {}", banks, chip.vendor, chip.part);
    let mut rom = Vec::with_capacity(banks * BANK_SIZE);
    for bank in 0..banks {
        tick(session, monitor)?;
        rom.extend_from_slice(&read_bank(session, bank as u16)?);
        monitor.progress(((bank + 1) * 100 / banks) as u8);
    }
    Ok(rom)
}

/// Write and verify one bank, retrying verification failures.
///
/// Only address and data mismatches are retried; structural failures
/// (timeouts, transport faults) propagate immediately. The final mismatch
/// propagates once the retry budget is spent.
pub fn write_single_flash_bank(session: &Session, bank: u16, data: &[u8]) -> Result<(), Error> {
    let mut attempt = 1;
    loop {
        match write_bank(session, bank, data) {
            Ok(_) => return Ok(()),
            Err(e) if matches!(e, Error::AddressMismatch { .. } | Error::DataMismatch { .. }) => {
                if attempt >= WRITE_RETRIES {
                    return Err(e);
                }
                warn!("bank {} verify failed on attempt {}/{}: {}", bank, attempt, WRITE_RETRIES, e);
                attempt += 1;
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

/// How a title keeps its save data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSettings {
    /// The title stores its save in ROM flash rather than FRAM.
    pub saves_to_rom: bool,
    pub layout: SaveLayout,
}

/// Flash the full ROM image onto the cartridge.
///
/// Validates shape before any I/O, then walks the banks: cooperative tick,
/// sector erase on cadence boundaries, write-and-verify. Banks at or past
/// the in-ROM save boundary are never erased when `save.saves_to_rom`
/// holds. Any erase or verify failure aborts the whole write.
pub fn write_cartridge(
    session: &Session,
    rom: &[u8],
    save: &SaveSettings,
    monitor: &mut dyn Monitor,
) -> Result<(), Error> {
    if rom.is_empty() || rom.len() % BANK_SIZE != 0 {
        return Err(Error::NotBankAligned { len: rom.len() });
    }
    if !detect_cartridge(session)? {
        return Err(Error::NoCartridge);
    }
    let chip = get_flash_type(session)?;
    let cadence = erase_cadence(chip)? as usize;
    let chip_banks = total_banks(chip);
    let game_banks = rom.len() / BANK_SIZE;
    if game_banks > chip_banks {
        return Err(Error::RomTooLarge { rom: rom.len(), chip: chip_banks * BANK_SIZE });
    }
    let erase_limit = if save.saves_to_rom { game_banks } else { chip_banks };
    info!(
        "writing {} banks to {} {} (erase every {} banks)",
        game_banks, chip.vendor, chip.part, cadence
    );

    for bank in 0..game_banks {
        tick(session, monitor)?;
        if bank % cadence == 0 && bank < erase_limit {
            erase_sector(session, chip, bank as u16)?;
        }
        let chunk = &rom[bank * BANK_SIZE..(bank + 1) * BANK_SIZE];
        write_single_flash_bank(session, bank as u16, chunk)?;
        monitor.progress(((bank + 1) * 100 / game_banks) as u8);
    }
    Ok(())
}

/// Where a title's in-ROM save data lives on the cartridge.
///
/// Almost every title follows the default convention: 32 KiB immediately
/// after the game data. The exceptions are known per title and selected
/// once from the detected header title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveLayout {
    /// 32 KiB immediately following the ROM data.
    Default,
    /// Save data split across five non-contiguous regions near the end of
    /// the cartridge.
    Tetris,
}

/// `(bank, offset, length)` of each Tetris save region.
const TETRIS_SAVE_REGIONS: [(u16, usize, usize); 5] = [
    (124, 0x0000, 0x2000),
    (124, 0x3000, 0x0800),
    (125, 0x0000, 0x1000),
    (126, 0x2000, 0x0400),
    (127, 0x3C00, 0x0400),
];

impl SaveLayout {
    /// Pick the layout for a detected cartridge title.
    pub fn for_title(title: &str) -> SaveLayout {
        match title {
            "TETRIS" => SaveLayout::Tetris,
            _ => SaveLayout::Default,
        }
    }

    /// Size of the extracted save image in bytes.
    pub fn save_size(&self) -> usize {
        match self {
            SaveLayout::Default => DEFAULT_SAVE_BANKS * BANK_SIZE,
            SaveLayout::Tetris => TETRIS_SAVE_REGIONS.iter().map(|r| r.2).sum(),
        }
    }

    /// Extract the save image from the cartridge. `rom_banks` is the game
    /// bank count, which anchors the default layout.
    pub fn get_save(&self, session: &Session, rom_banks: usize) -> Result<Vec<u8>, Error> {
        match self {
            SaveLayout::Default => {
                let mut out = Vec::with_capacity(self.save_size());
                for bank in rom_banks..rom_banks + DEFAULT_SAVE_BANKS {
                    out.extend_from_slice(&read_bank(session, bank as u16)?);
                }
                Ok(out)
            }
            SaveLayout::Tetris => {
                let mut out = Vec::with_capacity(self.save_size());
                let mut cache: Option<(u16, Vec<u8>)> = None;
                for &(bank, offset, len) in TETRIS_SAVE_REGIONS.iter() {
                    let stale = match &cache {
                        Some((cached, _)) => *cached != bank,
                        None => true,
                    };
                    if stale {
                        cache = Some((bank, read_bank(session, bank)?));
                    }
                    if let Some((_, image)) = &cache {
                        out.extend_from_slice(&image[offset..offset + len]);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Write a previously extracted save image back. The target sectors
    /// must have been erased by [`SaveLayout::erase_save`] first.
    pub fn restore_save(
        &self,
        session: &Session,
        rom_banks: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.len() != self.save_size() {
            return Err(Error::BadLength { expect: self.save_size(), got: data.len() });
        }
        match self {
            SaveLayout::Default => {
                for (i, chunk) in data.chunks(BANK_SIZE).enumerate() {
                    write_single_flash_bank(session, (rom_banks + i) as u16, chunk)?;
                }
                Ok(())
            }
            SaveLayout::Tetris => {
                let mut cursor = 0;
                let mut pending: Option<(u16, Vec<u8>)> = None;
                for &(bank, offset, len) in TETRIS_SAVE_REGIONS.iter() {
                    let chunk = &data[cursor..cursor + len];
                    cursor += len;
                    let start_new = match &pending {
                        Some((b, _)) => *b != bank,
                        None => true,
                    };
                    if start_new {
                        if let Some((b, image)) = pending.take() {
                            write_single_flash_bank(session, b, &image)?;
                        }
                        pending = Some((bank, vec![0xFF; BANK_SIZE]));
                    }
                    if let Some((_, image)) = pending.as_mut() {
                        image[offset..offset + len].copy_from_slice(chunk);
                    }
                }
                if let Some((b, image)) = pending.take() {
                    write_single_flash_bank(session, b, &image)?;
                }
                Ok(())
            }
        }
    }

    /// Erase the sectors holding the save region.
    ///
    /// The default layout erases the cadence-aligned sectors covering the
    /// 32 KiB after the game data. The Tetris layout's regions sit among
    /// other data, so it sweeps every sector from the save region to the
    /// end of the cartridge.
    pub fn erase_save(
        &self,
        session: &Session,
        chip: &FlashChipInfo,
        rom_banks: usize,
    ) -> Result<(), Error> {
        let cadence = erase_cadence(chip)? as usize;
        match self {
            SaveLayout::Default => {
                let first = rom_banks - rom_banks % cadence;
                let end = rom_banks + DEFAULT_SAVE_BANKS;
                let mut bank = first;
                while bank < end {
                    erase_sector(session, chip, bank as u16)?;
                    bank += cadence;
                }
                Ok(())
            }
            SaveLayout::Tetris => {
                let first_save = TETRIS_SAVE_REGIONS
                    .iter()
                    .map(|r| r.0 as usize)
                    .min()
                    .unwrap_or(0);
                let first = first_save - first_save % cadence;
                let end = total_banks(chip);
                let mut bank = first;
                while bank < end {
                    erase_sector(session, chip, bank as u16)?;
                    bank += cadence;
                }
                Ok(())
            }
        }
    }
}
