//! Bit-packed picture-processor registers.
//!
//! Every register keeps its raw byte and exposes named views onto the bits it
//! owns. Writing `set_value(v)` and reading `value()` back always returns `v`.

use serde::{Deserialize, Serialize};

const CTRL_NAMETABLE: u8 = 0x03;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;
const MASK_EMPHASIZE_RED: u8 = 0x20;
const MASK_EMPHASIZE_GREEN: u8 = 0x40;
const MASK_EMPHASIZE_BLUE: u8 = 0x80;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;
pub const STATUS_OWNED_BITS: u8 = 0xE0;

fn set_bit(bits: &mut u8, mask: u8, on: bool) {
    if on {
        *bits |= mask;
    } else {
        *bits &= !mask;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    bits: u8,
    pub data_latch: u8,
}

impl Control {
    pub fn value(&self) -> u8 {
        self.bits
    }

    pub fn set_value(&mut self, value: u8) {
        self.bits = value;
    }

    pub fn nametable(&self) -> u8 {
        self.bits & CTRL_NAMETABLE
    }

    pub fn set_nametable(&mut self, index: u8) {
        self.bits = (self.bits & !CTRL_NAMETABLE) | (index & CTRL_NAMETABLE);
    }

    pub fn increment(&self) -> u16 {
        if (self.bits & CTRL_VRAM_INC_32) != 0 {
            32
        } else {
            1
        }
    }

    pub fn set_increment(&mut self, amount: u16) {
        set_bit(&mut self.bits, CTRL_VRAM_INC_32, amount == 32);
    }

    pub fn sprite_table(&self) -> u16 {
        if (self.bits & CTRL_SPRITE_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        }
    }

    pub fn set_sprite_table(&mut self, base: u16) {
        set_bit(&mut self.bits, CTRL_SPRITE_TABLE, base >= 0x1000);
    }

    pub fn background_table(&self) -> u16 {
        if (self.bits & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        }
    }

    pub fn set_background_table(&mut self, base: u16) {
        set_bit(&mut self.bits, CTRL_BG_TABLE, base >= 0x1000);
    }

    pub fn sprite_size(&self) -> u8 {
        if (self.bits & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    pub fn set_sprite_size(&mut self, height: u8) {
        set_bit(&mut self.bits, CTRL_SPRITE_SIZE_16, height == 16);
    }

    pub fn nmi_enabled(&self) -> bool {
        (self.bits & CTRL_NMI_ENABLE) != 0
    }

    pub fn set_nmi_enabled(&mut self, on: bool) {
        set_bit(&mut self.bits, CTRL_NMI_ENABLE, on);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    bits: u8,
}

macro_rules! mask_flag {
    ($get:ident, $set:ident, $bit:expr) => {
        pub fn $get(&self) -> bool {
            (self.bits & $bit) != 0
        }

        pub fn $set(&mut self, on: bool) {
            set_bit(&mut self.bits, $bit, on);
        }
    };
}

impl Mask {
    pub fn value(&self) -> u8 {
        self.bits
    }

    pub fn set_value(&mut self, value: u8) {
        self.bits = value;
    }

    mask_flag!(grayscale, set_grayscale, MASK_GRAYSCALE);
    mask_flag!(show_background_left, set_show_background_left, MASK_SHOW_BG_LEFT);
    mask_flag!(show_sprites_left, set_show_sprites_left, MASK_SHOW_SPRITE_LEFT);
    mask_flag!(show_background, set_show_background, MASK_SHOW_BG);
    mask_flag!(show_sprites, set_show_sprites, MASK_SHOW_SPRITES);
    mask_flag!(emphasize_red, set_emphasize_red, MASK_EMPHASIZE_RED);
    mask_flag!(emphasize_green, set_emphasize_green, MASK_EMPHASIZE_GREEN);
    mask_flag!(emphasize_blue, set_emphasize_blue, MASK_EMPHASIZE_BLUE);

    pub fn rendering_enabled(&self) -> bool {
        (self.bits & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    pub fn palette_mask(&self) -> u8 {
        if self.grayscale() { 0x30 } else { 0x3F }
    }

    /// Emphasis bits as `0bBGR`.
    pub fn emphasis(&self) -> u8 {
        self.bits >> 5
    }
}

/// `$2002`. The raw byte is stored verbatim; port reads combine the three
/// owned bits with the live open-bus latch instead of the stored low bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    bits: u8,
}

impl Status {
    pub fn value(&self) -> u8 {
        self.bits
    }

    pub fn set_value(&mut self, value: u8) {
        self.bits = value;
    }

    pub fn owned_bits(&self) -> u8 {
        self.bits & STATUS_OWNED_BITS
    }

    pub fn sprite_overflow(&self) -> bool {
        (self.bits & STATUS_SPRITE_OVERFLOW) != 0
    }

    pub fn set_sprite_overflow(&mut self, on: bool) {
        set_bit(&mut self.bits, STATUS_SPRITE_OVERFLOW, on);
    }

    pub fn sprite_zero_hit(&self) -> bool {
        (self.bits & STATUS_SPRITE_ZERO_HIT) != 0
    }

    pub fn set_sprite_zero_hit(&mut self, on: bool) {
        set_bit(&mut self.bits, STATUS_SPRITE_ZERO_HIT, on);
    }

    pub fn vblank(&self) -> bool {
        (self.bits & STATUS_VBLANK) != 0
    }

    pub fn set_vblank(&mut self, on: bool) {
        set_bit(&mut self.bits, STATUS_VBLANK, on);
    }
}

/// Which half of a two-write port (`$2005`/`$2006`) the next write fills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteLatch {
    #[default]
    AwaitingHigh,
    AwaitingLow,
}

impl WriteLatch {
    fn flip(self) -> Self {
        match self {
            Self::AwaitingHigh => Self::AwaitingLow,
            Self::AwaitingLow => Self::AwaitingHigh,
        }
    }
}

const VRAM_COARSE_X: u16 = 0x001F;
const VRAM_COARSE_Y: u16 = 0x03E0;
const VRAM_NAMETABLE_X: u16 = 0x0400;
const VRAM_NAMETABLE_Y: u16 = 0x0800;
const VRAM_FINE_Y: u16 = 0x7000;
const VRAM_HORIZONTAL: u16 = VRAM_COARSE_X | VRAM_NAMETABLE_X;

/// Loopy register: `yyy NN YYYYY XXXXX` plus fine X and the write latch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramAddress {
    addr: u16,
    fine_x: u8,
    latch: WriteLatch,
    a12_toggled: bool,
}

impl VramAddress {
    pub fn address(&self) -> u16 {
        self.addr
    }

    // Fine Y's low bit rising raises a12_toggled.
    pub fn set_address(&mut self, value: u16) {
        let value = value & 0x7FFF;
        let old_low = (self.addr >> 12) & 0x01;
        let new_low = (value >> 12) & 0x01;
        if old_low == 0 && new_low == 1 {
            self.a12_toggled = true;
        }
        self.addr = value;
    }

    pub fn memory_address(&self) -> u16 {
        self.addr & 0x3FFF
    }

    pub fn coarse_x(&self) -> u8 {
        (self.addr & VRAM_COARSE_X) as u8
    }

    pub fn set_coarse_x(&mut self, value: u8) {
        self.set_address((self.addr & !VRAM_COARSE_X) | (value as u16 & 0x1F));
    }

    pub fn coarse_y(&self) -> u8 {
        ((self.addr & VRAM_COARSE_Y) >> 5) as u8
    }

    pub fn set_coarse_y(&mut self, value: u8) {
        self.set_address((self.addr & !VRAM_COARSE_Y) | ((value as u16 & 0x1F) << 5));
    }

    pub fn nametable_x(&self) -> u8 {
        ((self.addr & VRAM_NAMETABLE_X) >> 10) as u8
    }

    pub fn nametable_y(&self) -> u8 {
        ((self.addr & VRAM_NAMETABLE_Y) >> 11) as u8
    }

    pub fn set_nametable(&mut self, index: u8) {
        let bits = ((index as u16) & 0x03) << 10;
        self.set_address((self.addr & !(VRAM_NAMETABLE_X | VRAM_NAMETABLE_Y)) | bits);
    }

    pub fn fine_y(&self) -> u8 {
        ((self.addr & VRAM_FINE_Y) >> 12) as u8
    }

    pub fn set_fine_y(&mut self, value: u8) {
        self.set_address((self.addr & !VRAM_FINE_Y) | ((value as u16 & 0x07) << 12));
    }

    pub fn fine_x(&self) -> u8 {
        self.fine_x
    }

    pub fn set_fine_x(&mut self, value: u8) {
        self.fine_x = value & 0x07;
    }

    pub fn latch(&self) -> WriteLatch {
        self.latch
    }

    pub fn set_latch(&mut self, latch: WriteLatch) {
        self.latch = latch;
    }

    pub fn reset_latch(&mut self) {
        self.latch = WriteLatch::AwaitingHigh;
    }

    pub fn a12_toggled(&self) -> bool {
        self.a12_toggled
    }

    pub fn clear_a12_toggled(&mut self) {
        self.a12_toggled = false;
    }

    pub fn write_scroll(&mut self, value: u8) {
        match self.latch {
            WriteLatch::AwaitingHigh => {
                self.set_fine_x(value & 0x07);
                self.set_coarse_x(value >> 3);
            }
            WriteLatch::AwaitingLow => {
                self.set_fine_y(value & 0x07);
                self.set_coarse_y(value >> 3);
            }
        }
        self.latch = self.latch.flip();
    }

    /// `$2006`: high six bits first, then the low byte. Returns true once the
    /// low byte lands, which is when the address is ready to be copied live.
    pub fn write_address(&mut self, value: u8) -> bool {
        let completed = match self.latch {
            WriteLatch::AwaitingHigh => {
                self.set_address((self.addr & 0x00FF) | (((value as u16) & 0x3F) << 8));
                false
            }
            WriteLatch::AwaitingLow => {
                self.set_address((self.addr & 0x7F00) | value as u16);
                true
            }
        };
        self.latch = self.latch.flip();
        completed
    }

    pub fn increment(&mut self, amount: u16) {
        self.set_address(self.addr.wrapping_add(amount));
    }

    pub fn increment_coarse_x(&mut self) {
        if self.coarse_x() == 31 {
            self.set_address((self.addr & !VRAM_COARSE_X) ^ VRAM_NAMETABLE_X);
        } else {
            self.set_address(self.addr + 1);
        }
    }

    // Coarse Y 29 wraps into the other vertical nametable; 31 wraps without switching.
    pub fn increment_y(&mut self) {
        if self.fine_y() < 7 {
            self.set_fine_y(self.fine_y() + 1);
            return;
        }

        let mut addr = self.addr & !VRAM_FINE_Y;
        let coarse_y = ((addr & VRAM_COARSE_Y) >> 5) as u8;
        let next_y = match coarse_y {
            29 => {
                addr ^= VRAM_NAMETABLE_Y;
                0
            }
            31 => 0,
            y => y + 1,
        };
        addr = (addr & !VRAM_COARSE_Y) | ((next_y as u16) << 5);
        self.set_address(addr);
    }

    pub fn copy_horizontal_from(&mut self, other: &VramAddress) {
        self.set_address((self.addr & !VRAM_HORIZONTAL) | (other.addr & VRAM_HORIZONTAL));
        self.fine_x = other.fine_x;
    }

    pub fn copy_from(&mut self, other: &VramAddress) {
        self.set_address(other.addr);
        self.fine_x = other.fine_x;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_and_mask_round_trip_every_byte() {
        for v in 0..=255u8 {
            let mut ctrl = Control::default();
            ctrl.set_value(v);
            assert_eq!(ctrl.value(), v);

            let mut mask = Mask::default();
            mask.set_value(v);
            assert_eq!(mask.value(), v);
        }
    }

    #[test]
    fn status_owned_bits_round_trip_and_open_bus_bits_echo() {
        for v in 0..=255u8 {
            let mut status = Status::default();
            status.set_value(v);
            assert_eq!(status.owned_bits(), v & 0xE0);
            assert_eq!(status.sprite_overflow(), (v & 0x20) != 0);
            assert_eq!(status.sprite_zero_hit(), (v & 0x40) != 0);
            assert_eq!(status.vblank(), (v & 0x80) != 0);
            // Low five bits are echoed back verbatim.
            assert_eq!(status.value(), v);
        }
    }

    #[test]
    fn status_flag_setters_leave_other_bits_alone() {
        let mut status = Status::default();
        status.set_value(0x15);
        status.set_vblank(true);
        status.set_sprite_zero_hit(true);
        status.set_sprite_overflow(false);
        assert_eq!(status.value(), 0xD5);
    }

    #[test]
    fn control_magnitude_fields_map_back_to_bits() {
        let mut ctrl = Control::default();
        ctrl.set_increment(32);
        ctrl.set_sprite_size(16);
        assert_eq!(ctrl.value(), 0x24);
        assert_eq!(ctrl.increment(), 32);
        assert_eq!(ctrl.sprite_size(), 16);

        ctrl.set_increment(1);
        ctrl.set_sprite_size(8);
        assert_eq!(ctrl.value(), 0x00);

        ctrl.set_value(0x18);
        assert_eq!(ctrl.sprite_table(), 0x1000);
        assert_eq!(ctrl.background_table(), 0x1000);
    }

    #[test]
    fn mask_palette_mask_follows_grayscale() {
        let mut mask = Mask::default();
        assert_eq!(mask.palette_mask(), 0x3F);
        mask.set_grayscale(true);
        assert_eq!(mask.palette_mask(), 0x30);
        mask.set_value(0xA0);
        assert_eq!(mask.emphasis(), 0b101);
    }

    #[test]
    fn address_port_needs_two_writes() {
        let mut next = VramAddress::default();
        assert!(!next.write_address(0x21));
        assert_eq!(next.latch(), WriteLatch::AwaitingLow);
        assert!(next.write_address(0x08));
        assert_eq!(next.address(), 0x2108);
        assert_eq!(next.latch(), WriteLatch::AwaitingHigh);
    }

    #[test]
    fn scroll_port_splits_fine_and_coarse() {
        let mut next = VramAddress::default();
        next.write_scroll(0x7D);
        next.write_scroll(0x5E);
        assert_eq!(next.fine_x(), 0x05);
        assert_eq!(next.coarse_x(), 0x0F);
        assert_eq!(next.fine_y(), 0x06);
        assert_eq!(next.coarse_y(), 0x0B);
    }

    #[test]
    fn increment_y_wraps_nametable_at_row_thirty() {
        let mut v = VramAddress::default();
        v.set_coarse_y(29);
        v.set_fine_y(7);
        v.increment_y();
        assert_eq!(v.coarse_y(), 0);
        assert_eq!(v.nametable_y(), 1);

        v.set_coarse_y(31);
        v.set_fine_y(7);
        v.increment_y();
        assert_eq!(v.coarse_y(), 0);
        assert_eq!(v.nametable_y(), 1);
    }

    #[test]
    fn increment_coarse_x_switches_horizontal_nametable() {
        let mut v = VramAddress::default();
        v.set_coarse_x(31);
        v.increment_coarse_x();
        assert_eq!(v.coarse_x(), 0);
        assert_eq!(v.nametable_x(), 1);
    }

    #[test]
    fn fine_y_rising_low_bit_flags_a12() {
        let mut v = VramAddress::default();
        v.set_fine_y(2);
        assert!(!v.a12_toggled());
        v.set_fine_y(3);
        assert!(v.a12_toggled());
        v.clear_a12_toggled();
        v.set_fine_y(1);
        assert!(!v.a12_toggled());
    }
}
