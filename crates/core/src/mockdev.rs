//! In-memory device double for protocol tests.
//!
//! Behaves like the real peripheral on the other end of the serial link:
//! it parses 4-byte command frames, walks the flash unlock state machine
//! (identification, reset, sector and chip erase), models banked flash and
//! FRAM storage, and queues 3-byte reply frames for the session reader.
//! Tests hold a [`DeviceHandle`] to inspect state and inject faults after
//! the transport has moved into the session's I/O thread.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::bank::BANK_SIZE;
use crate::transport::Transport;
use crate::wire::{
    TAG_AUDIO, TAG_DETECT_CART, TAG_LOOPBACK, TAG_READ_BYTE, TAG_READ_PSRAM, TAG_WRITE_BYTE,
    TAG_WRITE_FLASH_BYTE, TAG_WRITE_PIXEL, TAG_WRITE_PSRAM,
};

const PSRAM_SIZE: usize = 64 * 1024;
const FRAM_SIZE: usize = 32 * 1024;
const FRAM_BANK_SIZE: usize = 8 * 1024;
const ID_LEN: usize = 32;

/// Unlock handshake progress, in the order the writes must arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unlock {
    Idle,
    GotAa,
    Got55,
}

/// Everything the fake peripheral remembers between frames.
pub struct DeviceState {
    pub flash: Vec<u8>,
    pub fram: Vec<u8>,
    pub psram: Vec<u8>,
    pub id_bytes: [u8; ID_LEN],
    /// Bytes cleared by one sector-erase command outside the boot region.
    pub erase_size: usize,
    /// First 64 KiB erases in 8 KiB sub-sectors when set.
    pub boot_8k: bool,

    rom_bank: u16,
    ram_bank: u8,
    ram_enabled: bool,
    unlock: Unlock,
    id_mode: bool,
    /// Reads return a busy pattern this many more times after an erase.
    erase_busy: u8,

    pub present: bool,
    pub pixels: u32,
    pub audio: u16,

    /// Ignore FRAM writes, as an absent chip would (detection tests).
    pub fram_stuck: bool,
    /// Swallow all commands without replying (timeout tests).
    pub mute: bool,
    /// Fail the next transport call with this error kind.
    pub fail_io: Option<io::ErrorKind>,
    /// Echo this value instead of the stored byte for flash writes at the
    /// given absolute address.
    pub force_flash_value: Option<(usize, u8)>,
    /// Echo this offset byte for flash writes at the given absolute address.
    pub force_echo_offset: Option<(usize, u8)>,
    /// How many flash writes hit a forced address.
    pub force_hits: u32,

    out: VecDeque<u8>,
}

impl DeviceState {
    /// Absolute flash index for a raw bus address, if it lands in the flash
    /// window. Bank 0 is visible directly; the upper window half goes
    /// through the latched bank.
    fn flash_index(&self, raw: u16) -> Option<usize> {
        let raw = raw as usize;
        if raw < 0x4000 {
            Some(raw % self.flash.len())
        } else if raw < 0x8000 {
            Some((self.rom_bank as usize * BANK_SIZE + (raw & 0x3FFF)) % self.flash.len())
        } else {
            None
        }
    }

    fn fram_index(&self, raw: u16) -> Option<usize> {
        let raw = raw as usize;
        if (0xA000..0xC000).contains(&raw) {
            Some((self.ram_bank as usize * FRAM_BANK_SIZE + (raw - 0xA000)) % self.fram.len())
        } else {
            None
        }
    }

    fn erase_at(&mut self, raw: u16) {
        if let Some(abs) = self.flash_index(raw) {
            let unit = if self.boot_8k && abs < 64 * 1024 {
                8 * 1024
            } else {
                self.erase_size
            };
            let start = abs - abs % unit;
            let end = (start + unit).min(self.flash.len());
            for b in &mut self.flash[start..end] {
                *b = 0xFF;
            }
            self.erase_busy = 2;
        }
    }

    fn write_byte(&mut self, raw: u16, value: u8) {
        // Unlock handshake tracking comes first: the third write selects
        // identification, reset, or an erase at its own address.
        match (self.unlock, raw, value) {
            (Unlock::Idle, 0x0AAA, 0xAA) => {
                self.unlock = Unlock::GotAa;
                return;
            }
            (Unlock::GotAa, 0x0555, 0x55) => {
                self.unlock = Unlock::Got55;
                return;
            }
            (Unlock::Got55, _, 0x90) => {
                self.unlock = Unlock::Idle;
                self.id_mode = true;
                return;
            }
            (Unlock::Got55, _, 0xF0) => {
                self.unlock = Unlock::Idle;
                self.id_mode = false;
                return;
            }
            (Unlock::Got55, _, 0x30) => {
                self.unlock = Unlock::Idle;
                self.erase_at(raw);
                return;
            }
            (Unlock::Got55, _, 0x10) => {
                self.unlock = Unlock::Idle;
                for b in &mut self.flash {
                    *b = 0xFF;
                }
                self.erase_busy = 2;
                return;
            }
            _ => self.unlock = Unlock::Idle,
        }

        match raw {
            0x0000..=0x1FFF => self.ram_enabled = value == 0x0A,
            0x2000..=0x2FFF => self.rom_bank = (self.rom_bank & 0x100) | value as u16,
            0x3000..=0x3FFF => {
                self.rom_bank = (self.rom_bank & 0x0FF) | (((value & 1) as u16) << 8)
            }
            0x4000..=0x5FFF => self.ram_bank = value & 0x03,
            0xA000..=0xBFFF => {
                if self.ram_enabled && !self.fram_stuck {
                    if let Some(i) = self.fram_index(raw) {
                        self.fram[i] = value;
                    }
                }
            }
            _ => {}
        }
    }

    fn read_byte(&mut self, raw: u16) -> u8 {
        if self.id_mode {
            return self.id_bytes[raw as usize % ID_LEN];
        }
        if let Some(i) = self.flash_index(raw) {
            if self.erase_busy > 0 {
                self.erase_busy -= 1;
                return 0x00;
            }
            return self.flash[i];
        }
        if let Some(i) = self.fram_index(raw) {
            if self.ram_enabled {
                return self.fram[i];
            }
        }
        0xFF
    }

    fn write_flash_byte(&mut self, raw: u16, value: u8) -> u8 {
        match self.flash_index(raw) {
            Some(abs) => {
                // Programming can only clear bits, like the real chip.
                self.flash[abs] &= value;
                if let Some((at, forced)) = self.force_flash_value {
                    if at == abs {
                        self.force_hits += 1;
                        return forced;
                    }
                }
                self.flash[abs]
            }
            None => 0xFF,
        }
    }

    fn reply(&mut self, frame: [u8; 3]) {
        if !self.mute {
            self.out.extend(frame);
        }
    }

    /// Act on one complete 4-byte command frame.
    fn process(&mut self, cmd: [u8; 4]) {
        if self.mute {
            return;
        }
        let raw = u16::from_le_bytes([cmd[1], cmd[2]]);
        match cmd[0] {
            TAG_LOOPBACK => self.reply([TAG_LOOPBACK, 0, cmd[1]]),
            TAG_READ_BYTE => {
                let value = self.read_byte(raw);
                self.reply([TAG_READ_BYTE, cmd[1], value]);
            }
            TAG_WRITE_BYTE => {
                self.write_byte(raw, cmd[3]);
                self.reply([TAG_WRITE_BYTE, cmd[1], cmd[3]]);
            }
            TAG_WRITE_FLASH_BYTE => {
                let echo = self.write_flash_byte(raw, cmd[3]);
                let mut offset = cmd[1];
                if let (Some((at, forced)), Some(abs)) =
                    (self.force_echo_offset, self.flash_index(raw))
                {
                    if at == abs {
                        offset = forced;
                        self.force_hits += 1;
                    }
                }
                self.reply([TAG_WRITE_FLASH_BYTE, offset, echo]);
            }
            TAG_DETECT_CART => {
                let present = self.present as u8;
                self.reply([TAG_DETECT_CART, 0, present]);
            }
            TAG_WRITE_PIXEL => {
                // Fire-and-forget: count it, reply with nothing.
                self.pixels += 1;
            }
            TAG_READ_PSRAM => {
                let value = self.psram[raw as usize % PSRAM_SIZE];
                self.reply([TAG_READ_PSRAM, cmd[1], value]);
            }
            TAG_WRITE_PSRAM => {
                self.psram[raw as usize % PSRAM_SIZE] = cmd[3];
                self.reply([TAG_WRITE_PSRAM, cmd[1], cmd[3]]);
            }
            TAG_AUDIO => {
                self.audio = raw;
                self.reply([TAG_AUDIO, cmd[1], cmd[2]]);
            }
            _ => {}
        }
    }
}

/// Test-side view of the shared device state.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Mutex<DeviceState>>,
}

impl DeviceHandle {
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.inner.lock().unwrap()
    }
}

/// The [`Transport`] half handed to the session under test.
pub struct MockDevice {
    inner: Arc<Mutex<DeviceState>>,
    partial: Vec<u8>,
}

impl MockDevice {
    fn with_chip(
        id_pairs: &[(usize, u8)],
        total: usize,
        erase_size: usize,
        boot_8k: bool,
    ) -> (MockDevice, DeviceHandle) {
        let mut id_bytes = [0u8; ID_LEN];
        for &(offset, byte) in id_pairs {
            id_bytes[offset] = byte;
        }
        let state = DeviceState {
            flash: vec![0xFF; total],
            fram: vec![0x00; FRAM_SIZE],
            psram: vec![0x00; PSRAM_SIZE],
            id_bytes,
            erase_size,
            boot_8k,
            rom_bank: 0,
            ram_bank: 0,
            ram_enabled: false,
            unlock: Unlock::Idle,
            id_mode: false,
            erase_busy: 0,
            present: true,
            pixels: 0,
            audio: 0,
            fram_stuck: false,
            mute: false,
            fail_io: None,
            force_flash_value: None,
            force_echo_offset: None,
            force_hits: 0,
            out: VecDeque::new(),
        };
        let inner = Arc::new(Mutex::new(state));
        (
            MockDevice { inner: Arc::clone(&inner), partial: Vec::new() },
            DeviceHandle { inner },
        )
    }

    /// 4 MiB uniform-sector chip with the Infineon signature.
    pub fn infineon() -> (MockDevice, DeviceHandle) {
        Self::with_chip(
            &[(0, 0x01), (2, 0x53), (4, 0x00), (6, 0x02)],
            4 * 1024 * 1024,
            64 * 1024,
            false,
        )
    }

    /// 2 MiB chip with 16 KiB sectors (one bank per sector).
    pub fn sst() -> (MockDevice, DeviceHandle) {
        Self::with_chip(
            &[(0, 0xBF), (2, 0xC8), (4, 0x00), (6, 0x01)],
            2 * 1024 * 1024,
            16 * 1024,
            false,
        )
    }

    /// 4 MiB boot-sector chip: first 64 KiB erases in 8 KiB sub-sectors.
    pub fn macronix() -> (MockDevice, DeviceHandle) {
        Self::with_chip(
            &[(0, 0xC2), (2, 0xA8), (4, 0x00), (6, 0x01)],
            4 * 1024 * 1024,
            64 * 1024,
            true,
        )
    }

    /// A chip whose identification bytes match nothing in the table.
    pub fn unknown() -> (MockDevice, DeviceHandle) {
        Self::with_chip(&[], 2 * 1024 * 1024, 64 * 1024, false)
    }
}

impl Transport for MockDevice {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(kind) = state.fail_io {
            return Err(io::Error::new(kind, "injected transport fault"));
        }
        self.partial.extend_from_slice(bytes);
        while self.partial.len() >= 4 {
            let mut frame = [0u8; 4];
            frame.copy_from_slice(&self.partial[..4]);
            self.partial.drain(..4);
            state.process(frame);
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.inner.lock().unwrap();
            if let Some(kind) = state.fail_io {
                return Err(io::Error::new(kind, "injected transport fault"));
            }
            if !state.out.is_empty() {
                let n = buf.len().min(state.out.len());
                for slot in buf[..n].iter_mut() {
                    *slot = state.out.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
        }
        thread::yield_now();
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}
