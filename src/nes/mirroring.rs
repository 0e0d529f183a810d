use serde::{Deserialize, Serialize};

use super::banked::BankedMemory;

pub const NAMETABLE_SIZE: usize = 0x400;

/// Nametable layout.
///
/// Each discriminant packs the four quadrant assignments, two bits per
/// quadrant with quadrant 0 in the low bits. The two-bit value is the pool
/// entry backing that 1KB window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mirroring {
    Horizontal = 0b01_01_00_00,
    Vertical = 0b01_00_01_00,
    OneScreenLower = 0b00_00_00_00,
    OneScreenUpper = 0b01_01_01_01,
    FourScreen = 0b11_10_01_00,
}

impl Mirroring {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn quadrants(self) -> [usize; 4] {
        let bits = self.bits();
        [0, 1, 2, 3].map(|quadrant| ((bits >> (quadrant * 2)) & 0x03) as usize)
    }

    /// Re-points the four nametable windows. Applying the same mode twice is a no-op.
    pub fn apply(self, nametables: &mut BankedMemory) {
        for (window, pool) in self.quadrants().into_iter().enumerate() {
            nametables.swap(window, pool as isize);
        }
    }
}

/// Four 1KB windows over two physical pages, or four for four-screen boards.
pub fn nametable_memory(mirroring: Mirroring) -> BankedMemory {
    let pool = if mirroring == Mirroring::FourScreen { 4 } else { 2 };
    let mut memory = BankedMemory::zeroed(pool, NAMETABLE_SIZE, 4);
    mirroring.apply(&mut memory);
    memory
}
