use tracing::debug;

use super::apu::Apu;
use super::cartridge::Cartridge;
use super::ppu::{OAM_SIZE, Ppu, TimingProfile};

pub const RAM_SIZE: usize = 2048;

const OAM_DMA_CYCLES: u32 = 513;

#[derive(Debug, Clone, Copy, Default)]
pub struct BusDebugCounters {
    pub reads: u64,
    pub writes: u64,
    pub reads_ram: u64,
    pub reads_ppu_regs: u64,
    pub reads_apu_io: u64,
    pub reads_cart: u64,
    pub reads_open_bus: u64,
    pub writes_ram: u64,
    pub writes_ppu_regs: u64,
    pub writes_apu_io: u64,
    pub writes_cart: u64,
    pub dma_transfers: u64,
    pub last_read_addr: u16,
    pub last_write_addr: u16,
    pub last_write_value: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct ControllerPort {
    state: u8,
    shift: u8,
}

/// Processor address space. Owns the picture engine, audio stub and
/// cartridge, and lends the cartridge to the engine for each port access.
pub struct Bus {
    ram: [u8; RAM_SIZE],
    ppu: Ppu,
    apu: Apu,
    cartridge: Cartridge,
    controllers: [ControllerPort; 2],
    controller_strobe: bool,
    open_bus: u8,
    dma_page: Option<u8>,
    debug: BusDebugCounters,
}

impl Bus {
    pub fn new(cartridge: Cartridge) -> Self {
        Self::with_profile(cartridge, TimingProfile::Ntsc)
    }

    pub fn with_profile(cartridge: Cartridge, profile: TimingProfile) -> Self {
        Self {
            ram: [0; RAM_SIZE],
            ppu: Ppu::new(profile),
            apu: Apu::new(),
            cartridge,
            controllers: [ControllerPort::default(); 2],
            controller_strobe: false,
            open_bus: 0,
            dma_page: None,
            debug: BusDebugCounters::default(),
        }
    }

    pub fn reset(&mut self) {
        self.ppu.reset();
        self.apu.reset();
        self.cartridge.reset();
        self.controller_strobe = false;
        self.open_bus = 0;
        self.dma_page = None;
        self.debug = BusDebugCounters::default();
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut Ppu {
        &mut self.ppu
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.cartridge
    }

    pub fn cartridge_mut(&mut self) -> &mut Cartridge {
        &mut self.cartridge
    }

    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8; RAM_SIZE] {
        &mut self.ram
    }

    pub fn open_bus(&self) -> u8 {
        self.open_bus
    }

    pub fn debug_counters(&self) -> BusDebugCounters {
        self.debug
    }

    pub fn dma_pending(&self) -> bool {
        self.dma_page.is_some()
    }

    /// Advances the picture engine one pixel clock.
    pub fn step_ppu(&mut self) {
        self.ppu.step(&mut self.cartridge);
    }

    fn set_open_bus(&mut self, value: u8) {
        self.open_bus = value;
        self.ppu.set_open_bus(value);
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        self.debug.reads = self.debug.reads.wrapping_add(1);
        self.debug.last_read_addr = addr;
        let value = match addr {
            0x0000..=0x1FFF => {
                self.debug.reads_ram = self.debug.reads_ram.wrapping_add(1);
                self.ram[(addr as usize) & (RAM_SIZE - 1)]
            }
            0x2000..=0x3FFF => {
                self.debug.reads_ppu_regs = self.debug.reads_ppu_regs.wrapping_add(1);
                self.ppu.read_port(addr, &self.cartridge)
            }
            0x4015 => {
                self.debug.reads_apu_io = self.debug.reads_apu_io.wrapping_add(1);
                self.apu.read_status() | (self.open_bus & 0x20)
            }
            0x4016 => {
                self.debug.reads_apu_io = self.debug.reads_apu_io.wrapping_add(1);
                self.read_controller(0)
            }
            0x4017 => {
                self.debug.reads_apu_io = self.debug.reads_apu_io.wrapping_add(1);
                self.read_controller(1)
            }
            0x4000..=0x40FF => {
                self.debug.reads_open_bus = self.debug.reads_open_bus.wrapping_add(1);
                self.open_bus
            }
            _ => match self.cartridge.cpu_read(addr) {
                Some(value) => {
                    self.debug.reads_cart = self.debug.reads_cart.wrapping_add(1);
                    value
                }
                None => {
                    self.debug.reads_open_bus = self.debug.reads_open_bus.wrapping_add(1);
                    self.open_bus
                }
            },
        };
        self.set_open_bus(value);
        value
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        self.debug.writes = self.debug.writes.wrapping_add(1);
        self.debug.last_write_addr = addr;
        self.debug.last_write_value = value;
        self.set_open_bus(value);
        match addr {
            0x0000..=0x1FFF => {
                self.debug.writes_ram = self.debug.writes_ram.wrapping_add(1);
                self.ram[(addr as usize) & (RAM_SIZE - 1)] = value;
            }
            0x2000..=0x3FFF => {
                self.debug.writes_ppu_regs = self.debug.writes_ppu_regs.wrapping_add(1);
                self.ppu.write_port(addr, value, &mut self.cartridge);
            }
            0x4014 => {
                self.debug.writes_apu_io = self.debug.writes_apu_io.wrapping_add(1);
                self.dma_page = Some(value);
            }
            0x4016 => {
                self.debug.writes_apu_io = self.debug.writes_apu_io.wrapping_add(1);
                self.write_controller_strobe(value);
            }
            0x4000..=0x40FF => {
                self.debug.writes_apu_io = self.debug.writes_apu_io.wrapping_add(1);
                self.apu.write_register(addr, value);
            }
            _ => {
                self.debug.writes_cart = self.debug.writes_cart.wrapping_add(1);
                self.cartridge.cpu_write(addr, value);
            }
        }
    }

    /// Performs an armed `$4014` transfer. Returns the processor stall in
    /// cycles, or `None` when no transfer was armed.
    pub fn run_oam_dma(&mut self, cpu_cycles: u64) -> Option<u32> {
        let page = self.dma_page.take()?;
        let base = (page as u16) << 8;
        let mut bytes = [0u8; OAM_SIZE];
        for (idx, slot) in bytes.iter_mut().enumerate() {
            *slot = self.read(base.wrapping_add(idx as u16));
        }
        self.ppu.write_oam_dma(&bytes);
        self.debug.dma_transfers = self.debug.dma_transfers.wrapping_add(1);

        // One extra alignment cycle when the transfer starts on an odd cycle.
        let stall = OAM_DMA_CYCLES + (cpu_cycles & 0x01) as u32;
        debug!(page = format_args!("${page:02X}"), stall, "oam dma");
        Some(stall)
    }

    pub fn set_controller_state(&mut self, port: usize, state: u8) {
        let Some(controller) = self.controllers.get_mut(port) else {
            return;
        };
        controller.state = state;
        if self.controller_strobe {
            controller.shift = state;
        }
    }

    fn read_controller(&mut self, port: usize) -> u8 {
        let controller = &mut self.controllers[port];
        let bit = if self.controller_strobe {
            controller.state & 0x01
        } else {
            let out = controller.shift & 0x01;
            controller.shift = (controller.shift >> 1) | 0x80;
            out
        };
        0x40 | bit
    }

    fn write_controller_strobe(&mut self, value: u8) {
        self.controller_strobe = (value & 0x01) != 0;
        if self.controller_strobe {
            for controller in &mut self.controllers {
                controller.shift = controller.state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Bus {
        Bus::new(Cartridge::blank(1))
    }

    #[test]
    fn audio_window_write_shows_up_in_status_low_bits() {
        let mut bus = bus();
        bus.write(0x4018, 0xA5);
        assert_eq!(bus.read(0x2002) & 0x1F, 0xA5 & 0x1F);
    }

    #[test]
    fn ram_is_mirrored_every_2k() {
        let mut bus = bus();
        bus.write(0x0123, 0x42);
        assert_eq!(bus.read(0x0923), 0x42);
        assert_eq!(bus.read(0x1923), 0x42);
    }

    #[test]
    fn ppu_ports_repeat_every_eight_bytes() {
        let mut bus = bus();
        bus.write(0x3FFE, 0x21);
        bus.write(0x2006, 0x08);
        assert_eq!(bus.ppu().current_address().address(), 0x2108);
    }

    #[test]
    fn unmapped_reads_return_last_bus_value() {
        let mut bus = bus();
        bus.write(0x0000, 0x5C);
        assert_eq!(bus.read(0x0000), 0x5C);
        assert_eq!(bus.read(0x5000), 0x5C);
        assert_eq!(bus.read(0x4000), 0x5C);
    }

    #[test]
    fn missing_cartridge_ram_reads_open_bus() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(b"NES\x1A");
        bytes[4] = 1;
        bytes[7] = 0x08;
        bytes.resize(16 + 0x4000, 0xEA);
        let mut bus = Bus::new(Cartridge::from_bytes(&bytes).unwrap());

        assert_eq!(bus.read(0x8000), 0xEA);
        bus.write(0x6000, 0x11);
        assert_eq!(bus.read(0x6000), 0x11);
        assert_eq!(bus.cartridge().prg_ram().len(), 0);
    }

    #[test]
    fn oam_dma_copies_page_and_reports_stall() {
        let mut bus = bus();
        for i in 0..256u16 {
            bus.write(0x0200 + i, i as u8);
        }
        assert_eq!(bus.run_oam_dma(0), None);

        bus.write(0x4014, 0x02);
        assert!(bus.dma_pending());
        assert_eq!(bus.run_oam_dma(10), Some(513));
        assert!(bus.ppu().oam().iter().enumerate().all(|(i, &b)| b == i as u8));

        bus.write(0x4014, 0x02);
        assert_eq!(bus.run_oam_dma(11), Some(514));
    }

    #[test]
    fn controller_shifts_out_buttons_then_ones() {
        let mut bus = bus();
        bus.set_controller_state(0, 0b0000_0101);
        bus.write(0x4016, 1);
        bus.write(0x4016, 0);

        let bits: Vec<u8> = (0..9).map(|_| bus.read(0x4016) & 0x01).collect();
        assert_eq!(bits, vec![1, 0, 1, 0, 0, 0, 0, 0, 1]);
        assert_eq!(bus.read(0x4017), 0x40);
    }

    #[test]
    fn cartridge_ram_round_trips_when_present() {
        let mut bus = bus();
        bus.write(0x6010, 0x99);
        assert_eq!(bus.read(0x6010), 0x99);
        assert_eq!(bus.cartridge().prg_ram()[0x10], 0x99);
    }
}
