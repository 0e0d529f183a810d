use serde::{Deserialize, Serialize};
use tracing::trace;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

pub const REGISTER_WINDOW_START: u16 = 0x4000;
pub const REGISTER_WINDOW_LEN: usize = 0x18;

const STATUS_CHANNEL_MASK: u8 = 0x1F;

/// Audio unit as seen from the bus: it stores register writes and answers
/// `$4015`. No samples are produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Apu {
    registers: [u8; REGISTER_WINDOW_LEN],
    enabled: u8,
    length_counters: [u8; 4],
    dmc_bytes_remaining: u16,
}

impl Apu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Last value written to a register in `$4000-$4017`.
    pub fn register(&self, addr: u16) -> u8 {
        let index = addr.wrapping_sub(REGISTER_WINDOW_START) as usize;
        self.registers.get(index).copied().unwrap_or(0)
    }

    /// Returns false when the address is outside the audio register file.
    pub fn write_register(&mut self, addr: u16, value: u8) -> bool {
        let index = addr.wrapping_sub(REGISTER_WINDOW_START) as usize;
        if index >= REGISTER_WINDOW_LEN || addr == 0x4014 || addr == 0x4016 {
            return false;
        }
        trace!(addr = format_args!("${addr:04X}"), value, "apu register write");
        self.registers[index] = value;

        match addr {
            0x4003 | 0x4007 | 0x400B | 0x400F => {
                let channel = ((addr - 0x4003) / 4) as usize;
                if (self.enabled & (1 << channel)) != 0 {
                    self.length_counters[channel] = LENGTH_TABLE[(value >> 3) as usize];
                }
            }
            0x4013 => {
                if (self.enabled & 0x10) != 0 {
                    self.dmc_bytes_remaining = ((value as u16) << 4) | 1;
                }
            }
            0x4015 => self.write_status(value),
            _ => {}
        }
        true
    }

    fn write_status(&mut self, value: u8) {
        self.enabled = value & STATUS_CHANNEL_MASK;
        for (channel, counter) in self.length_counters.iter_mut().enumerate() {
            if (self.enabled & (1 << channel)) == 0 {
                *counter = 0;
            }
        }
        if (self.enabled & 0x10) == 0 {
            self.dmc_bytes_remaining = 0;
        } else if self.dmc_bytes_remaining == 0 {
            self.dmc_bytes_remaining = ((self.registers[0x13] as u16) << 4) | 1;
        }
    }

    pub fn read_status(&self) -> u8 {
        let mut status = 0u8;
        for (channel, counter) in self.length_counters.iter().enumerate() {
            if *counter > 0 {
                status |= 1 << channel;
            }
        }
        if self.dmc_bytes_remaining > 0 {
            status |= 0x10;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_enabled_channels_with_loaded_lengths() {
        let mut apu = Apu::new();
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.read_status(), 0x00);

        apu.write_register(0x4015, 0x05);
        apu.write_register(0x4003, 0x08);
        apu.write_register(0x400B, 0x08);
        assert_eq!(apu.read_status(), 0x05);

        apu.write_register(0x4015, 0x01);
        assert_eq!(apu.read_status(), 0x01);
    }

    #[test]
    fn register_window_excludes_dma_and_controller_ports() {
        let mut apu = Apu::new();
        assert!(apu.write_register(0x4000, 0x3F));
        assert!(!apu.write_register(0x4014, 0x02));
        assert!(!apu.write_register(0x4016, 0x01));
        assert!(!apu.write_register(0x4018, 0x01));
        assert_eq!(apu.register(0x4000), 0x3F);
    }
}
