pub mod apu;
pub mod banked;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod mapper;
pub mod mirroring;
pub mod palette;
pub mod ppu;
pub mod registers;

use anyhow::Result;
use std::{collections::VecDeque, path::Path};
use tracing::{info, warn};

use crate::config::Config;
use bus::{Bus, BusDebugCounters};
use cartridge::Cartridge;
use cpu::{IdleCpu, Processor};
use mapper::mapper_name;
use ppu::{PpuDebugCounters, TimingProfile};

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleDebugCounters {
    pub frame_count: u64,
    pub cpu_steps: u64,
    pub ppu_cycles: u64,
    pub nmi_edges: u64,
    pub dma_transfers: u64,
    pub dma_stall_cycles: u64,
    pub frame_guard_trips: u64,
}

/// Drives a processor and the picture engine in lockstep at the timing
/// profile's clock ratio.
pub struct Console {
    processor: Box<dyn Processor>,
    bus: Bus,
    config: Config,
    clock_carry: u32,
    mapper_name: String,
    loaded_rom_name: Option<String>,
    debug: ConsoleDebugCounters,
    debug_events: VecDeque<String>,
}

impl Console {
    pub fn new(cartridge: Cartridge, config: Config) -> Self {
        Self::with_processor(cartridge, Box::new(IdleCpu::new()), config)
    }

    pub fn with_processor(
        cartridge: Cartridge,
        processor: Box<dyn Processor>,
        config: Config,
    ) -> Self {
        let mut console = Self {
            processor,
            bus: Bus::with_profile(cartridge, config.timing),
            debug_events: VecDeque::with_capacity(config.debug_event_capacity),
            config,
            clock_carry: 0,
            mapper_name: String::new(),
            loaded_rom_name: None,
            debug: ConsoleDebugCounters::default(),
        };
        console.describe_cartridge();
        console.reset();
        console
    }

    pub fn from_rom_path(path: &Path, config: Config) -> Result<Self> {
        let cartridge = Cartridge::from_file(path)?;
        let mut console = Self::new(cartridge, config);
        console.loaded_rom_name = rom_name(path);
        Ok(console)
    }

    /// Swaps in a new cartridge and resets. The processor is kept.
    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cartridge = Cartridge::from_file(path)?;
        self.loaded_rom_name = rom_name(path);
        self.bus = Bus::with_profile(cartridge, self.config.timing);
        self.describe_cartridge();
        self.reset();
        Ok(())
    }

    fn describe_cartridge(&mut self) {
        let cart = self.bus.cartridge();
        let mapper_id = cart.mapper_id;
        let name = mapper_name(mapper_id);
        self.mapper_name = if cart.submapper_id != 0 {
            format!("{name} (mapper {mapper_id}, submapper {})", cart.submapper_id)
        } else {
            format!("{name} (mapper {mapper_id})")
        };
        info!(mapper = %self.mapper_name, mirroring = ?cart.mirroring(), "cartridge inserted");
    }

    pub fn reset(&mut self) {
        self.bus.reset();
        self.processor.reset(&mut self.bus);
        self.clock_carry = 0;
        self.debug = ConsoleDebugCounters::default();
        self.debug_events.clear();
        self.push_debug_event(format!("Reset: {}", self.mapper_name));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile(&self) -> TimingProfile {
        self.config.timing
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn loaded_rom_name(&self) -> Option<&str> {
        self.loaded_rom_name.as_deref()
    }

    pub fn frame_buffer(&self) -> &[u8] {
        self.bus.ppu().frame_buffer()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    pub fn set_controller_state(&mut self, port: usize, state: u8) {
        self.bus.set_controller_state(port, state);
    }

    /// Runs until the picture engine finishes a frame. Returns false if the
    /// frame guard tripped first.
    pub fn run_frame(&mut self) -> bool {
        self.bus.ppu_mut().clear_frame_complete();

        let mut frame_cycles: u64 = 0;
        loop {
            self.debug.cpu_steps = self.debug.cpu_steps.wrapping_add(1);
            let mut cycles = self.processor.step(&mut self.bus);

            if let Some(stall) = self.bus.run_oam_dma(self.processor.cycles()) {
                self.processor.stall(stall);
                cycles += stall;
                self.debug.dma_transfers = self.debug.dma_transfers.wrapping_add(1);
                self.debug.dma_stall_cycles =
                    self.debug.dma_stall_cycles.wrapping_add(stall as u64);
                self.push_debug_event(format!("OAM DMA stall_cycles={stall}"));
            }

            if self.clock_ppu(cycles) {
                break;
            }

            frame_cycles += cycles as u64;
            if frame_cycles > self.config.frame_guard_cycles {
                self.debug.frame_guard_trips = self.debug.frame_guard_trips.wrapping_add(1);
                warn!(
                    cycles = frame_cycles,
                    "frame guard tripped before frame completed"
                );
                self.push_debug_event(format!(
                    "Frame guard tripped at {} CPU cycles",
                    self.config.frame_guard_cycles
                ));
                return false;
            }
        }

        self.debug.frame_count = self.debug.frame_count.wrapping_add(1);
        true
    }

    /// Feeds the picture engine for `cpu_cycles` processor cycles and returns
    /// true if a frame completed along the way.
    fn clock_ppu(&mut self, cpu_cycles: u32) -> bool {
        let (numerator, denominator) = self.config.timing.clock_ratio();
        self.clock_carry += cpu_cycles * numerator;
        let dots = self.clock_carry / denominator;
        self.clock_carry %= denominator;

        let mut frame_done = false;
        for _ in 0..dots {
            self.bus.step_ppu();
            self.debug.ppu_cycles = self.debug.ppu_cycles.wrapping_add(1);

            if self.bus.ppu_mut().take_nmi() {
                self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
                let position = self.bus.ppu().scan_position();
                self.push_debug_event(format!(
                    "NMI edge at scanline/dot ({}, {})",
                    position.y, position.x
                ));
                self.processor.signal_nmi();
            }
            if self.bus.ppu().frame_complete() {
                frame_done = true;
            }
        }
        frame_done
    }

    pub fn debug_counters(&self) -> ConsoleDebugCounters {
        self.debug
    }

    pub fn debug_ppu_counters(&self) -> PpuDebugCounters {
        self.bus.ppu().debug_counters()
    }

    pub fn debug_bus_counters(&self) -> BusDebugCounters {
        self.bus.debug_counters()
    }

    pub fn debug_mapper_state(&self) -> String {
        self.bus.cartridge().debug_mapper_state()
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        let capacity = self.config.debug_event_capacity;
        if capacity == 0 {
            return;
        }
        while self.debug_events.len() >= capacity {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }
}

fn rom_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
}
