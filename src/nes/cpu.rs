use super::bus::Bus;

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;

const INTERRUPT_CYCLES: u32 = 7;
const IDLE_CYCLES: u32 = 2;

/// What the console needs from a processor core: bus-driven stepping, a
/// monotonic cycle counter and edge-triggered interrupt inputs.
pub trait Processor {
    fn reset(&mut self, bus: &mut Bus);
    /// Runs one instruction (or interrupt entry) and returns the cycles it took.
    fn step(&mut self, bus: &mut Bus) -> u32;
    fn cycles(&self) -> u64;
    /// Adds cycles the processor spends halted, e.g. during OAM DMA.
    fn stall(&mut self, cycles: u32);
    fn signal_nmi(&mut self);
    fn signal_irq(&mut self, _asserted: bool) {}
}

/// Processor that spins at its reset vector. It enters the NMI vector when
/// signalled and otherwise burns two cycles per step without touching the bus,
/// which is enough to clock the picture engine from the console loop.
#[derive(Debug, Clone, Default)]
pub struct IdleCpu {
    pc: u16,
    total_cycles: u64,
    pending_nmi: bool,
    nmi_serviced_count: u64,
}

impl IdleCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn nmi_serviced_count(&self) -> u64 {
        self.nmi_serviced_count
    }
}

fn read_u16(bus: &mut Bus, addr: u16) -> u16 {
    let lo = bus.read(addr) as u16;
    let hi = bus.read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

impl Processor for IdleCpu {
    fn reset(&mut self, bus: &mut Bus) {
        self.pc = read_u16(bus, RESET_VECTOR);
        self.total_cycles = 0;
        self.pending_nmi = false;
        self.nmi_serviced_count = 0;
    }

    fn step(&mut self, bus: &mut Bus) -> u32 {
        if self.pending_nmi {
            self.pending_nmi = false;
            self.pc = read_u16(bus, NMI_VECTOR);
            self.nmi_serviced_count = self.nmi_serviced_count.wrapping_add(1);
            self.total_cycles += INTERRUPT_CYCLES as u64;
            return INTERRUPT_CYCLES;
        }

        self.total_cycles += IDLE_CYCLES as u64;
        IDLE_CYCLES
    }

    fn cycles(&self) -> u64 {
        self.total_cycles
    }

    fn stall(&mut self, cycles: u32) {
        self.total_cycles += cycles as u64;
    }

    fn signal_nmi(&mut self) {
        self.pending_nmi = true;
    }
}
