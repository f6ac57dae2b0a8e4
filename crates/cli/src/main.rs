//! Command-line frontend for the cartridge flasher.
//!
//! Thin consumer of `cartflash-core`: opens the serial session, runs one
//! operation, and renders progress. All protocol logic lives in the core.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use cartflash_core::cartridge::{self, Monitor, SaveLayout, SaveSettings};
use cartflash_core::{flash, fram, Patch, Session, SerialTransport};

#[derive(Parser)]
#[command(name = "cartflash", version, about = "Read, write, and patch cartridges")]
struct Cli {
    /// Serial device of the flasher (e.g. /dev/ttyUSB0)
    #[arg(short, long, global = true)]
    port: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Probe the cartridge slot, flash chip, and save memory
    Detect,
    /// Read the full ROM image into a file
    ReadRom {
        out: PathBuf,
    },
    /// Flash a ROM image onto the cartridge
    WriteRom {
        input: PathBuf,
        /// Protect the in-ROM save region from erasure
        #[arg(long)]
        saves_to_rom: bool,
    },
    /// Read the 32 KiB FRAM save image into a file
    ReadSave {
        out: PathBuf,
    },
    /// Write a 32 KiB FRAM save image
    WriteSave {
        input: PathBuf,
    },
    /// Erase the entire flash chip
    Erase,
    /// Apply an IPS patch to a ROM image
    PatchApply {
        rom: PathBuf,
        patch: PathBuf,
        out: PathBuf,
    },
    /// Create an IPS patch from two ROM images
    PatchCreate {
        original: PathBuf,
        modified: PathBuf,
        out: PathBuf,
    },
}

/// Progress bar plus presence polling and a screen animation tick.
struct CliMonitor {
    bar: pbr::ProgressBar<std::io::Stdout>,
    hue: u8,
}

impl CliMonitor {
    fn new() -> CliMonitor {
        let mut bar = pbr::ProgressBar::new(100);
        bar.show_speed = false;
        bar.show_time_left = false;
        CliMonitor { bar, hue: 0 }
    }

    fn finish(&mut self, msg: &str) {
        self.bar.finish_print(msg);
    }
}

impl Monitor for CliMonitor {
    fn progress(&mut self, percent: u8) {
        self.bar.set(percent as u64);
    }

    fn presence(&mut self, session: &Session) -> bool {
        cartridge::detect_cartridge(session).unwrap_or(false)
    }

    fn animate(&mut self, session: &Session) {
        // Sweep a color across the device screen while the transfer runs.
        self.hue = self.hue.wrapping_add(8);
        let _ = session.write_pixel(self.hue, 0x40, 0xFF - self.hue);
    }
}

fn open_session(port: &Option<String>) -> Result<Session> {
    let port = port
        .as_deref()
        .context("a serial --port is required for device commands")?;
    let transport =
        SerialTransport::open(port).with_context(|| format!("opening serial port {}", port))?;
    let session = Session::open(transport);
    if !session.loopback(0xA5)? {
        bail!("device loopback failed; is {} the right port?", port);
    }
    Ok(session)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Cmd::Detect => {
            let session = open_session(&cli.port)?;
            if !cartridge::detect_cartridge(&session)? {
                println!("no cartridge detected");
                return Ok(());
            }
            let chip = flash::get_flash_type(&session)?;
            let title = cartridge::read_title(&session)?;
            let has_fram = fram::detect_fram(&session)?;
            println!(
                "cartridge : {}",
                if title.is_empty() { "(untitled)" } else { title.as_str() }
            );
            println!(
                "flash     : {} {} ({} KiB, {} KiB sectors)",
                chip.vendor, chip.part, chip.total_size_kb, chip.sector_size_kb
            );
            println!("save FRAM : {}", if has_fram { "present" } else { "not present" });
        }

        Cmd::ReadRom { out } => {
            let session = open_session(&cli.port)?;
            let mut monitor = CliMonitor::new();
            let rom = cartridge::read_cartridge(&session, &mut monitor)?;
            monitor.finish("read complete");
            fs::write(&out, &rom).with_context(|| format!("writing {}", out.display()))?;
            info!("wrote {} bytes to {}", rom.len(), out.display());
        }

        Cmd::WriteRom { input, saves_to_rom } => {
            let rom = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let title = cartridge::title_from_image(&rom);
            let settings = SaveSettings {
                saves_to_rom,
                layout: SaveLayout::for_title(&title),
            };
            let session = open_session(&cli.port)?;
            let mut monitor = CliMonitor::new();
            cartridge::write_cartridge(&session, &rom, &settings, &mut monitor)?;
            monitor.finish("write complete, fully verified");
        }

        Cmd::ReadSave { out } => {
            let session = open_session(&cli.port)?;
            if !fram::detect_fram(&session)? {
                bail!("no save memory detected on this cartridge");
            }
            let save = fram::read_fram(&session)?;
            fs::write(&out, &save).with_context(|| format!("writing {}", out.display()))?;
            println!("saved {} bytes to {}", save.len(), out.display());
        }

        Cmd::WriteSave { input } => {
            let save = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let session = open_session(&cli.port)?;
            if !fram::detect_fram(&session)? {
                bail!("no save memory detected on this cartridge");
            }
            fram::write_fram(&session, &save)?;
            println!("save written");
        }

        Cmd::Erase => {
            let session = open_session(&cli.port)?;
            let chip = flash::get_flash_type(&session)?;
            println!("erasing {} {}...", chip.vendor, chip.part);
            flash::erase_flash_all(&session, chip)?;
            println!("chip blank");
        }

        Cmd::PatchApply { rom, patch, out } => {
            let rom_bytes = fs::read(&rom).with_context(|| format!("reading {}", rom.display()))?;
            let patch_bytes =
                fs::read(&patch).with_context(|| format!("reading {}", patch.display()))?;
            let patch = Patch::load(&patch_bytes)?;
            let patched = patch.apply(&rom_bytes);
            fs::write(&out, &patched).with_context(|| format!("writing {}", out.display()))?;
            println!("patched {} -> {} bytes", rom_bytes.len(), patched.len());
        }

        Cmd::PatchCreate { original, modified, out } => {
            let original_bytes =
                fs::read(&original).with_context(|| format!("reading {}", original.display()))?;
            let modified_bytes =
                fs::read(&modified).with_context(|| format!("reading {}", modified.display()))?;
            let patch = Patch::create(&original_bytes, &modified_bytes)?;
            let encoded = patch.encode();
            fs::write(&out, &encoded).with_context(|| format!("writing {}", out.display()))?;
            println!(
                "{} records{} ({} bytes)",
                patch.records.len(),
                if patch.truncate.is_some() { ", truncating" } else { "" },
                encoded.len()
            );
        }
    }

    Ok(())
}
