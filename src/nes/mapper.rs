use tracing::warn;

use super::cartridge::{CartridgeBanks, CartridgeError, RomHeader};
use super::mirroring::Mirroring;

pub const DOCUMENTED_MAPPER_COUNT: u16 = 560;
pub const DOCUMENTED_MAPPER_MAX_ID: u16 = DOCUMENTED_MAPPER_COUNT - 1;

/// Board logic. A mapper never owns cartridge storage: each call borrows the
/// cartridge's banks and re-points them with `swap`/`set_bank_size`.
pub trait Mapper {
    fn reset(&mut self, banks: &mut CartridgeBanks);
    fn on_cpu_write(&mut self, addr: u16, value: u8, banks: &mut CartridgeBanks);
    /// `None` keeps the layout the cartridge header declared.
    fn mirroring(&self) -> Option<Mirroring> {
        None
    }
    fn debug_state(&self) -> String {
        String::new()
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        5 => "MMC5",
        7 => "AxROM",
        9 => "MMC2",
        66 => "GxROM",
        _ if mapper_id <= DOCUMENTED_MAPPER_MAX_ID => "Documented Mapper (generic)",
        _ => "Unsupported",
    }
}

pub fn create_mapper(header: &RomHeader) -> Result<Box<dyn Mapper>, CartridgeError> {
    let mapper: Box<dyn Mapper> = match header.mapper_id {
        0 => Box::new(Nrom),
        2 => Box::new(Uxrom::default()),
        3 => Box::new(Cnrom::default()),
        7 => Box::new(Axrom::default()),
        id if id <= DOCUMENTED_MAPPER_MAX_ID => {
            warn!(
                mapper_id = id,
                name = mapper_name(id),
                "mapper not implemented, falling back to NROM"
            );
            Box::new(Nrom)
        }
        id => return Err(CartridgeError::UnsupportedMapper { mapper_id: id }),
    };
    Ok(mapper)
}

/// Mapper 0: no bank switching. 16K images appear twice in the PRG window.
pub struct Nrom;

impl Mapper for Nrom {
    fn reset(&mut self, _banks: &mut CartridgeBanks) {}

    fn on_cpu_write(&mut self, _addr: u16, _value: u8, _banks: &mut CartridgeBanks) {}
}

/// Mapper 2: switchable 16K at $8000, last 16K fixed at $C000.
#[derive(Default)]
pub struct Uxrom {
    prg_bank: u8,
}

impl Mapper for Uxrom {
    fn reset(&mut self, banks: &mut CartridgeBanks) {
        self.prg_bank = 0;
        banks.prg.swap(0, 0);
        banks.prg.swap(1, -1);
    }

    fn on_cpu_write(&mut self, addr: u16, value: u8, banks: &mut CartridgeBanks) {
        if addr >= 0x8000 {
            self.prg_bank = value & 0x0F;
            banks.prg.swap(0, self.prg_bank as isize);
        }
    }

    fn debug_state(&self) -> String {
        format!("UxROM prg_bank=${:02X}", self.prg_bank)
    }
}

/// Mapper 3: 8K CHR bank select.
#[derive(Default)]
pub struct Cnrom {
    chr_bank: u8,
}

impl Mapper for Cnrom {
    fn reset(&mut self, banks: &mut CartridgeBanks) {
        self.chr_bank = 0;
        banks.chr.swap(0, 0);
    }

    fn on_cpu_write(&mut self, addr: u16, value: u8, banks: &mut CartridgeBanks) {
        if addr >= 0x8000 {
            self.chr_bank = value & 0x03;
            banks.chr.swap(0, self.chr_bank as isize);
        }
    }

    fn debug_state(&self) -> String {
        format!("CNROM chr_bank=${:02X}", self.chr_bank)
    }
}

/// Mapper 7: 32K PRG switch and single-screen nametable select.
pub struct Axrom {
    prg_bank: u8,
    mirroring: Mirroring,
}

impl Default for Axrom {
    fn default() -> Self {
        Self {
            prg_bank: 0,
            mirroring: Mirroring::OneScreenLower,
        }
    }
}

impl Mapper for Axrom {
    fn reset(&mut self, banks: &mut CartridgeBanks) {
        if banks.prg.bank_size() != 0x8000 {
            banks.prg.set_bank_size(0x8000);
        }
        self.prg_bank = 0;
        self.mirroring = Mirroring::OneScreenLower;
        banks.prg.swap(0, 0);
    }

    fn on_cpu_write(&mut self, addr: u16, value: u8, banks: &mut CartridgeBanks) {
        if addr < 0x8000 {
            return;
        }
        self.prg_bank = value & 0x07;
        banks.prg.swap(0, self.prg_bank as isize);
        self.mirroring = if (value & 0x10) != 0 {
            Mirroring::OneScreenUpper
        } else {
            Mirroring::OneScreenLower
        };
    }

    fn mirroring(&self) -> Option<Mirroring> {
        Some(self.mirroring)
    }

    fn debug_state(&self) -> String {
        format!(
            "AxROM prg_bank=${:02X} mirroring={:?}",
            self.prg_bank, self.mirroring
        )
    }
}
