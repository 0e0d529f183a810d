use anyhow::{Context, Result};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::info;

use super::banked::BankedMemory;
use super::mapper::{Mapper, Nrom, create_mapper, mapper_name};
use super::mirroring::{Mirroring, nametable_memory};

const HEADER_SIZE: usize = 16;
const TRAINER_SIZE: usize = 512;
const PRG_UNIT: usize = 16 * 1024;
const CHR_UNIT: usize = 8 * 1024;
const PRG_WINDOW: usize = 0x8000;
const CHR_WINDOW: usize = 0x2000;
const PRG_RAM_DEFAULT: usize = 8 * 1024;
const PRG_RAM_MAX_SHIFT: u8 = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartridgeError {
    #[error("header should be at least 16 bytes, was {len} bytes")]
    HeaderTooShort { len: usize },
    #[error("invalid iNES magic {found:02X?}, expected NES<EOF>")]
    BadMagic { found: [u8; 4] },
    #[error("PRG ROM declares {declared} bytes but {available} are present")]
    BadPrgSize { declared: usize, available: usize },
    #[error("CHR ROM declares {declared} bytes but {available} are present")]
    BadChrSize { declared: usize, available: usize },
    #[error("PRG RAM size shift {shift} is out of range")]
    BadRamSize { shift: u8 },
    #[error("exponent-multiplier size encoding for {section} is not supported")]
    UnsupportedSizeEncoding { section: &'static str },
    #[error("mapper {mapper_id} exceeds the documented mapper range")]
    UnsupportedMapper { mapper_id: u16 },
    #[error("invalid header flag combination: flags6=${flags6:02X} flags7=${flags7:02X}")]
    BadFlags { flags6: u8, flags7: u8 },
}

/// Decoded iNES / NES 2.0 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomHeader {
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub trainer_present: bool,
    pub is_nes2: bool,
    pub prg_rom_size: usize,
    pub chr_rom_size: usize,
    pub prg_ram_size: usize,
}

impl RomHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CartridgeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CartridgeError::HeaderTooShort { len: bytes.len() });
        }
        if &bytes[0..4] != b"NES\x1A" {
            let mut found = [0u8; 4];
            found.copy_from_slice(&bytes[0..4]);
            return Err(CartridgeError::BadMagic { found });
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        if (flags7 & 0x0C) == 0x0C {
            return Err(CartridgeError::BadFlags { flags6, flags7 });
        }
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mapper_id_low = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        let mapper_id = if is_nes2 {
            mapper_id_low | (((bytes[8] as u16) & 0x0F) << 8)
        } else {
            mapper_id_low
        };
        let submapper_id = if is_nes2 { bytes[8] >> 4 } else { 0 };
        let mirroring = if (flags6 & 0x08) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let (prg_units, chr_units, prg_ram_size) = if is_nes2 {
            let prg_msb = (bytes[9] & 0x0F) as usize;
            let chr_msb = (bytes[9] >> 4) as usize;
            if prg_msb == 0x0F {
                return Err(CartridgeError::UnsupportedSizeEncoding { section: "PRG ROM" });
            }
            if chr_msb == 0x0F {
                return Err(CartridgeError::UnsupportedSizeEncoding { section: "CHR ROM" });
            }

            let volatile_shift = bytes[10] & 0x0F;
            let battery_shift = bytes[10] >> 4;
            let shift = volatile_shift.max(battery_shift);
            if shift > PRG_RAM_MAX_SHIFT {
                return Err(CartridgeError::BadRamSize { shift });
            }
            let prg_ram = if shift == 0 { 0 } else { 64usize << shift };

            (
                (prg_msb << 8) | bytes[4] as usize,
                (chr_msb << 8) | bytes[5] as usize,
                prg_ram,
            )
        } else {
            let prg_ram_units = if bytes[8] == 0 { 1 } else { bytes[8] as usize };
            (
                bytes[4] as usize,
                bytes[5] as usize,
                prg_ram_units * PRG_RAM_DEFAULT,
            )
        };

        if prg_units == 0 {
            return Err(CartridgeError::BadPrgSize {
                declared: 0,
                available: bytes.len().saturating_sub(HEADER_SIZE),
            });
        }

        Ok(Self {
            mapper_id,
            submapper_id,
            mirroring,
            has_battery_backed_ram,
            trainer_present,
            is_nes2,
            prg_rom_size: prg_units * PRG_UNIT,
            chr_rom_size: chr_units * CHR_UNIT,
            prg_ram_size,
        })
    }
}

/// What the board physically provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub chr_ram: bool,
    pub prg_ram: bool,
}

/// The storage a mapper is allowed to re-point.
#[derive(Debug, Clone)]
pub struct CartridgeBanks {
    pub prg: BankedMemory,
    pub chr: BankedMemory,
    pub nametables: BankedMemory,
}

pub struct Cartridge {
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub has_battery_backed_ram: bool,
    capabilities: Capabilities,
    header_mirroring: Mirroring,
    mirroring: Mirroring,
    banks: CartridgeBanks,
    prg_ram: Vec<u8>,
    mapper: Box<dyn Mapper>,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("invalid ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CartridgeError> {
        let header = RomHeader::parse(bytes)?;

        let mut cursor = HEADER_SIZE;
        if header.trainer_present {
            cursor += TRAINER_SIZE;
        }

        let prg_end = cursor + header.prg_rom_size;
        if bytes.len() < prg_end {
            return Err(CartridgeError::BadPrgSize {
                declared: header.prg_rom_size,
                available: bytes.len().saturating_sub(cursor),
            });
        }
        let prg_rom = bytes[cursor..prg_end].to_vec();
        cursor = prg_end;

        let (chr_data, chr_ram) = if header.chr_rom_size == 0 {
            (vec![0; CHR_WINDOW], true)
        } else {
            let chr_end = cursor + header.chr_rom_size;
            if bytes.len() < chr_end {
                return Err(CartridgeError::BadChrSize {
                    declared: header.chr_rom_size,
                    available: bytes.len().saturating_sub(cursor),
                });
            }
            (bytes[cursor..chr_end].to_vec(), false)
        };

        let mapper = create_mapper(&header)?;
        info!(
            mapper_id = header.mapper_id,
            mapper = mapper_name(header.mapper_id),
            prg_bytes = header.prg_rom_size,
            chr_bytes = chr_data.len(),
            chr_ram,
            prg_ram_bytes = header.prg_ram_size,
            "cartridge loaded"
        );

        let capabilities = Capabilities {
            chr_ram,
            prg_ram: header.prg_ram_size > 0,
        };
        Ok(Self::assemble(
            &header,
            capabilities,
            prg_rom,
            chr_data,
            mapper,
        ))
    }

    /// Zeroed NROM board with `prg_banks` 16K PRG banks, 8K CHR-RAM and 8K PRG-RAM.
    pub fn blank(prg_banks: usize) -> Self {
        let header = RomHeader {
            mapper_id: 0,
            submapper_id: 0,
            mirroring: Mirroring::Horizontal,
            has_battery_backed_ram: false,
            trainer_present: false,
            is_nes2: false,
            prg_rom_size: prg_banks.max(1) * PRG_UNIT,
            chr_rom_size: 0,
            prg_ram_size: PRG_RAM_DEFAULT,
        };
        let capabilities = Capabilities {
            chr_ram: true,
            prg_ram: true,
        };
        Self::assemble(
            &header,
            capabilities,
            vec![0; header.prg_rom_size],
            vec![0; CHR_WINDOW],
            Box::new(Nrom),
        )
    }

    fn assemble(
        header: &RomHeader,
        capabilities: Capabilities,
        prg_rom: Vec<u8>,
        chr_data: Vec<u8>,
        mapper: Box<dyn Mapper>,
    ) -> Self {
        let banks = CartridgeBanks {
            prg: BankedMemory::new(prg_rom, PRG_UNIT, PRG_WINDOW),
            chr: BankedMemory::new(chr_data, CHR_WINDOW, CHR_WINDOW),
            nametables: nametable_memory(header.mirroring),
        };
        let mut cart = Self {
            mapper_id: header.mapper_id,
            submapper_id: header.submapper_id,
            has_battery_backed_ram: header.has_battery_backed_ram,
            capabilities,
            header_mirroring: header.mirroring,
            mirroring: header.mirroring,
            banks,
            prg_ram: vec![0; header.prg_ram_size],
            mapper,
        };
        cart.reset();
        cart
    }

    pub fn reset(&mut self) {
        self.mapper.reset(&mut self.banks);
        self.mirroring = self.header_mirroring;
        self.mirroring.apply(&mut self.banks.nametables);
        self.sync_mirroring();
    }

    fn sync_mirroring(&mut self) {
        if let Some(mode) = self.mapper.mirroring() {
            if mode != self.mirroring {
                self.mirroring = mode;
                mode.apply(&mut self.banks.nametables);
            }
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    /// `None` when nothing on the board answers, leaving the bus floating.
    pub fn cpu_read(&self, addr: u16) -> Option<u8> {
        match addr {
            0x6000..=0x7FFF if self.capabilities.prg_ram => {
                let idx = (addr as usize - 0x6000) % self.prg_ram.len();
                Some(self.prg_ram[idx])
            }
            0x8000..=0xFFFF => Some(self.banks.prg.read(addr as usize - 0x8000)),
            _ => None,
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF if self.capabilities.prg_ram => {
                let idx = (addr as usize - 0x6000) % self.prg_ram.len();
                self.prg_ram[idx] = value;
            }
            0x8000..=0xFFFF => {
                self.mapper.on_cpu_write(addr, value, &mut self.banks);
                self.sync_mirroring();
            }
            _ => {}
        }
    }

    pub fn chr_read(&self, addr: u16) -> u8 {
        self.banks.chr.read((addr as usize) & 0x1FFF)
    }

    /// Dropped unless the board carries CHR-RAM.
    pub fn chr_write(&mut self, addr: u16, value: u8) {
        if self.capabilities.chr_ram {
            self.banks.chr.write((addr as usize) & 0x1FFF, value);
        }
    }

    pub fn nametable_read(&self, addr: u16) -> u8 {
        self.banks.nametables.read((addr as usize) & 0x0FFF)
    }

    pub fn nametable_write(&mut self, addr: u16, value: u8) {
        self.banks.nametables.write((addr as usize) & 0x0FFF, value);
    }

    /// Re-points one 1KB nametable window.
    pub fn swap_nametable(&mut self, bank_index: usize, pool_index: isize) {
        self.banks.nametables.swap(bank_index, pool_index);
    }

    pub fn prg_ram(&self) -> &[u8] {
        &self.prg_ram
    }

    pub fn prg_ram_mut(&mut self) -> &mut [u8] {
        &mut self.prg_ram
    }

    pub fn nametables(&self) -> &BankedMemory {
        &self.banks.nametables
    }

    pub fn nametables_mut(&mut self) -> &mut BankedMemory {
        &mut self.banks.nametables
    }

    pub fn chr(&self) -> &BankedMemory {
        &self.banks.chr
    }

    pub fn debug_mapper_state(&self) -> String {
        let state = self.mapper.debug_state();
        if state.is_empty() {
            mapper_name(self.mapper_id).to_string()
        } else {
            state
        }
    }
}
