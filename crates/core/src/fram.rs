//! Battery-backed FRAM save memory.
//!
//! The save memory is 4 banks of 8 KiB behind its own bank-select register,
//! mapped at a fixed base above the flash window. FRAM cells complete
//! writes instantly, so transfers use the plain byte-write command and skip
//! per-byte verification; presence is probed by a write/read/restore round
//! trip on the very last byte of the map.

use log::debug;

use crate::bank::{CartAddr, BLOCK_SIZE};
use crate::error::Error;
use crate::session::{Session, REPLY_TIMEOUT};
use crate::wire::{Command, TAG_READ_BYTE, TAG_WRITE_BYTE};

/// FRAM geometry: 4 banks of 8 KiB.
pub const FRAM_BANKS: usize = 4;
pub const FRAM_BANK_SIZE: usize = 8 * 1024;
/// Total save memory: 32 KiB.
pub const FRAM_SIZE: usize = FRAM_BANKS * FRAM_BANK_SIZE;
const FRAM_BLOCKS_PER_BANK: usize = FRAM_BANK_SIZE / BLOCK_SIZE;

/// Base bus address of the FRAM window.
const FRAM_BASE: u16 = 0xA000;
/// RAM access enable register and its magic value.
const REG_RAM_ENABLE: u16 = 0x0000;
const RAM_ENABLE_MAGIC: u8 = 0x0A;
const RAM_DISABLE: u8 = 0x00;
/// FRAM bank-select register, distinct from the ROM banking registers.
const REG_RAM_BANK: u16 = 0x4000;

fn write_reg(session: &Session, raw: u16, value: u8, op: &'static str) -> Result<(), Error> {
    session.transact(
        Command::WriteByte { addr: CartAddr::from_raw(raw), value },
        REPLY_TIMEOUT,
        op,
    )?;
    Ok(())
}

fn read_byte(session: &Session, raw: u16, op: &'static str) -> Result<u8, Error> {
    let reply = session.transact(
        Command::ReadByte { addr: CartAddr::from_raw(raw) },
        REPLY_TIMEOUT,
        op,
    )?;
    let (_, value) = reply.byte_echo().ok_or(Error::Protocol("fram read"))?;
    Ok(value)
}

fn enable_ram(session: &Session) -> Result<(), Error> {
    write_reg(session, REG_RAM_ENABLE, RAM_ENABLE_MAGIC, "fram enable")
}

fn disable_ram(session: &Session) -> Result<(), Error> {
    write_reg(session, REG_RAM_ENABLE, RAM_DISABLE, "fram disable")
}

fn select_bank(session: &Session, bank: usize) -> Result<(), Error> {
    write_reg(session, REG_RAM_BANK, bank as u8, "fram bank select")
}

/// Probe for save memory.
///
/// Writes an incremented probe byte to the last byte of the last bank,
/// reads it back, restores the original byte, and reports presence only if
/// the round trip returned the probe value. Absent FRAM leaves the bus
/// floating and the original byte comes back unchanged.
pub fn detect_fram(session: &Session) -> Result<bool, Error> {
    enable_ram(session)?;
    select_bank(session, FRAM_BANKS - 1)?;
    let last = FRAM_BASE + (FRAM_BANK_SIZE as u16 - 1);

    let original = read_byte(session, last, "fram probe")?;
    let probe = original.wrapping_add(1);
    write_reg(session, last, probe, "fram probe")?;
    let echoed = read_byte(session, last, "fram probe")?;
    write_reg(session, last, original, "fram probe")?;
    disable_ram(session)?;

    let present = echoed == probe;
    debug!("fram probe: wrote 0x{:02X}, read 0x{:02X}, present={}", probe, echoed, present);
    Ok(present)
}

/// Read all 32 KiB of save memory.
pub fn read_fram(session: &Session) -> Result<Vec<u8>, Error> {
    enable_ram(session)?;
    let mut out = vec![0u8; FRAM_SIZE];
    for bank in 0..FRAM_BANKS {
        select_bank(session, bank)?;
        let listener = session.listen(TAG_READ_BYTE)?;
        for block in 0..FRAM_BLOCKS_PER_BANK {
            let base = FRAM_BASE + (block * BLOCK_SIZE) as u16;
            let reads: Vec<Command> = (0..BLOCK_SIZE)
                .map(|i| Command::ReadByte { addr: CartAddr::from_raw(base + i as u16) })
                .collect();
            session.send(&reads)?;
            for _ in 0..BLOCK_SIZE {
                let reply = listener.recv(REPLY_TIMEOUT, "fram read")?;
                let (offset, value) = reply.byte_echo().ok_or(Error::Protocol("fram read"))?;
                out[bank * FRAM_BANK_SIZE + block * BLOCK_SIZE + offset as usize] = value;
            }
        }
    }
    disable_ram(session)?;
    Ok(out)
}

/// Write all 32 KiB of save memory.
///
/// FRAM writes are not self-polling, so the echoes are drained but not
/// compared; callers wanting certainty read the image back.
pub fn write_fram(session: &Session, data: &[u8]) -> Result<(), Error> {
    if data.len() != FRAM_SIZE {
        return Err(Error::BadLength { expect: FRAM_SIZE, got: data.len() });
    }
    enable_ram(session)?;
    for bank in 0..FRAM_BANKS {
        select_bank(session, bank)?;
        let listener = session.listen(TAG_WRITE_BYTE)?;
        for block in 0..FRAM_BLOCKS_PER_BANK {
            let base = bank * FRAM_BANK_SIZE + block * BLOCK_SIZE;
            let writes: Vec<Command> = (0..BLOCK_SIZE)
                .map(|i| Command::WriteByte {
                    addr: CartAddr::from_raw(FRAM_BASE + (block * BLOCK_SIZE + i) as u16),
                    value: data[base + i],
                })
                .collect();
            session.send(&writes)?;
            for _ in 0..BLOCK_SIZE {
                listener.recv(REPLY_TIMEOUT, "fram write")?;
            }
        }
    }
    disable_ram(session)?;
    Ok(())
}
