use serde::{Deserialize, Serialize};

/// Bank-switched byte storage. Windows hold pool indices, so windows sharing
/// a pool bank see each other's writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankedMemory {
    pool: Vec<Vec<u8>>,
    active: Vec<usize>,
    bank_size: usize,
}

impl BankedMemory {
    pub fn new(data: Vec<u8>, bank_size: usize, window_size: usize) -> Self {
        if bank_size == 0 {
            return Self::empty();
        }
        let pool: Vec<Vec<u8>> = data
            .chunks_exact(bank_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let active = cyclic_handles(window_size / bank_size, pool.len());
        Self {
            pool,
            active,
            bank_size,
        }
    }

    pub fn zeroed(pool_banks: usize, bank_size: usize, window_banks: usize) -> Self {
        Self::new(
            vec![0; pool_banks * bank_size],
            bank_size,
            window_banks * bank_size,
        )
    }

    pub fn empty() -> Self {
        Self {
            pool: Vec::new(),
            active: Vec::new(),
            bank_size: 0,
        }
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn window_len(&self) -> usize {
        self.active.len()
    }

    pub fn address_space(&self) -> usize {
        self.active.len() * self.bank_size
    }

    pub fn active_banks(&self) -> &[usize] {
        &self.active
    }

    pub fn pool_bank(&self, index: usize) -> Option<&[u8]> {
        self.pool.get(index).map(Vec::as_slice)
    }

    pub fn pool_bank_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.pool.get_mut(index).map(Vec::as_mut_slice)
    }

    fn locate(&self, address: usize) -> Option<(usize, usize)> {
        if self.bank_size == 0 {
            return None;
        }
        let window = address / self.bank_size;
        let offset = address % self.bank_size;
        let bank = *self.active.get(window)?;
        Some((bank, offset))
    }

    pub fn read(&self, address: usize) -> u8 {
        match self.locate(address) {
            Some((bank, offset)) => self.pool[bank][offset],
            None => 0,
        }
    }

    pub fn write(&mut self, address: usize, value: u8) {
        if let Some((bank, offset)) = self.locate(address) {
            self.pool[bank][offset] = value;
        }
    }

    /// Re-chunks the pool at `new_size`, dropping any trailing remainder, and
    /// rebuilds the windows to cover the previous address space. A size of 0
    /// only clears the size; the next resize then keeps the window count.
    pub fn set_bank_size(&mut self, new_size: usize) {
        if new_size == 0 {
            self.bank_size = 0;
            return;
        }

        let windows = if self.bank_size == 0 {
            self.active.len()
        } else {
            self.address_space() / new_size
        };
        let flat: Vec<u8> = self.pool.drain(..).flatten().collect();
        self.pool = flat
            .chunks_exact(new_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        self.bank_size = new_size;
        self.active = cyclic_handles(windows, self.pool.len());
    }

    /// Negative pool indices count from the end; the result wraps modulo the
    /// pool length.
    pub fn swap(&mut self, bank_index: usize, pool_index: isize) {
        if bank_index >= self.active.len() || self.pool.is_empty() {
            return;
        }
        let len = self.pool.len() as isize;
        let mut index = pool_index;
        if index < 0 {
            index += len;
        }
        self.active[bank_index] = index.rem_euclid(len) as usize;
    }
}

fn cyclic_handles(windows: usize, pool_len: usize) -> Vec<usize> {
    if pool_len == 0 {
        return Vec::new();
    }
    (0..windows).map(|i| i % pool_len).collect()
}
