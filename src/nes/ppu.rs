use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::cartridge::Cartridge;
use super::palette::{NES_PALETTE, apply_emphasis};
use super::registers::{Control, Mask, Status, VramAddress};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
pub const DOTS_PER_LINE: u32 = 341;
pub const OAM_SIZE: usize = 256;

const VISIBLE_LINES: i16 = 240;
const VBLANK_LINE: i16 = 241;
const SPRITE_COUNT: usize = 64;
const SPRITES_PER_LINE: usize = 8;
const SPRITE_INDEX_LINES: usize = 256;
const OAM_ATTRIBUTE_MASK: u8 = 0xE3;

/// Video standard. Decides the last scanline and the picture/processor clock ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingProfile {
    #[default]
    Ntsc,
    Pal,
}

impl TimingProfile {
    pub fn max_y(self) -> i16 {
        match self {
            Self::Ntsc => 260,
            Self::Pal => 310,
        }
    }

    /// Picture clocks per processor cycle as `(numerator, denominator)`.
    pub fn clock_ratio(self) -> (u32, u32) {
        match self {
            Self::Ntsc => (3, 1),
            Self::Pal => (16, 5),
        }
    }

    pub fn dots_per_frame(self) -> u32 {
        DOTS_PER_LINE * (self.max_y() as u32 + 2)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PpuDebugCounters {
    pub ticks: u64,
    pub transitions: u64,
    pub frames: u64,
    pub vblank_entries: u64,
    pub vblank_suppressed: u64,
    pub nmi_edges: u64,
    pub sprite_overflow_events: u64,
    pub sprite_overflow_last_scanline: i16,
    pub sprite0_hit_events: u64,
    pub sprite0_hit_last_scanline: i16,
    pub sprite0_hit_last_column: u8,
    pub pattern_reads: u64,
    pub nametable_reads: u64,
    pub palette_reads: u64,
    pub pattern_writes: u64,
    pub nametable_writes: u64,
    pub palette_writes: u64,
    pub status_reads: u64,
    pub status_read_last_scanline: i16,
    pub status_read_last_cycle: i16,
    pub scroll_writes: u64,
    pub addr_writes: u64,
    pub oam_dma_transfers: u64,
    pub last_read_addr: u16,
    pub last_write_addr: u16,
}

/// Where the state machine stands. `pending_clocks` are pixel clocks still
/// owed by the last transition before the next one fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPosition {
    pub y: i16,
    pub x: i16,
    pub pending_clocks: u16,
}

/// One OAM record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpriteRecord {
    pub oam_index: u8,
    pub y: u8,
    pub tile: u8,
    pub attributes: u8,
    pub x: u8,
}

impl SpriteRecord {
    /// Byte as seen on the secondary-OAM bus: y, tile, attributes, then x repeated.
    fn bus_byte(&self, cycle: usize) -> u8 {
        match cycle {
            0 => self.y,
            1 => self.tile,
            2 => self.attributes,
            _ => self.x,
        }
    }
}

/// Opaque sprite pixel cached for the line being drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpritePixel {
    pub pattern: u8,
    pub palette: u8,
    pub behind_background: bool,
    pub oam_index: u8,
}

impl SpritePixel {
    pub fn is_sprite_zero(&self) -> bool {
        self.oam_index == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TileRow {
    palette: u8,
    low: u8,
    high: u8,
}

impl TileRow {
    /// Two-bit pattern value of column `bit` (0 is leftmost).
    fn pattern(&self, bit: u8) -> u8 {
        let shift = 7 - (bit & 0x07);
        ((self.low >> shift) & 0x01) | (((self.high >> shift) & 0x01) << 1)
    }
}

/// `buffer` receives each fetch, which then rotates through `next`, `active`
/// and `prev`. Drawing reads `prev` and `active`.
#[derive(Debug, Clone, Copy, Default)]
struct TilePipeline {
    buffer: TileRow,
    prev: TileRow,
    active: TileRow,
    next: TileRow,
}

impl TilePipeline {
    fn rotate(&mut self) {
        self.prev = self.active;
        self.active = self.next;
        self.next = self.buffer;
    }
}

pub struct Ppu {
    profile: TimingProfile,

    ctrl: Control,
    mask: Mask,
    status: Status,

    oam_addr: u8,
    oam: [u8; OAM_SIZE],
    palette_ram: [u8; 32],

    current: VramAddress,
    next: VramAddress,
    frame_scroll: VramAddress,
    open_bus: u8,

    scan_y: i16,
    scan_x: i16,
    pending_clocks: u16,
    odd_frame: bool,
    frame_complete: bool,
    vbl_suppress: bool,
    nmi_line: bool,
    nmi_pending: bool,

    tiles: TilePipeline,
    sprite_index: Vec<Vec<u8>>,
    line_sprites: Vec<SpriteRecord>,
    sprite_cache: [Option<SpritePixel>; FRAME_WIDTH],

    frame_buffer: Box<[u8; FRAME_WIDTH * FRAME_HEIGHT * 4]>,
    debug: PpuDebugCounters,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new(TimingProfile::Ntsc)
    }
}

impl Ppu {
    pub fn new(profile: TimingProfile) -> Self {
        Self {
            profile,
            ctrl: Control::default(),
            mask: Mask::default(),
            status: Status::default(),
            oam_addr: 0,
            oam: [0; OAM_SIZE],
            palette_ram: [0x0F; 32],
            current: VramAddress::default(),
            next: VramAddress::default(),
            frame_scroll: VramAddress::default(),
            open_bus: 0,
            scan_y: -1,
            scan_x: 0,
            pending_clocks: 0,
            odd_frame: false,
            frame_complete: false,
            vbl_suppress: false,
            nmi_line: false,
            nmi_pending: false,
            tiles: TilePipeline::default(),
            sprite_index: vec![Vec::new(); SPRITE_INDEX_LINES],
            line_sprites: Vec::with_capacity(SPRITES_PER_LINE),
            sprite_cache: [None; FRAME_WIDTH],
            frame_buffer: Box::new([0; FRAME_WIDTH * FRAME_HEIGHT * 4]),
            debug: PpuDebugCounters::default(),
        }
    }

    pub fn reset(&mut self) {
        self.ctrl = Control::default();
        self.mask = Mask::default();
        self.status = Status::default();
        self.oam_addr = 0;
        self.current = VramAddress::default();
        self.next = VramAddress::default();
        self.frame_scroll = VramAddress::default();
        self.open_bus = 0;
        self.scan_y = -1;
        self.scan_x = 0;
        self.pending_clocks = 0;
        self.odd_frame = false;
        self.frame_complete = false;
        self.vbl_suppress = false;
        self.nmi_line = false;
        self.nmi_pending = false;
        self.tiles = TilePipeline::default();
        for bucket in &mut self.sprite_index {
            bucket.clear();
        }
        self.line_sprites.clear();
        self.sprite_cache = [None; FRAME_WIDTH];
        self.debug = PpuDebugCounters::default();

        // Startup backdrop stays black.
        self.palette_ram = [0x0F; 32];
    }

    pub fn profile(&self) -> TimingProfile {
        self.profile
    }

    pub fn set_profile(&mut self, profile: TimingProfile) {
        self.profile = profile;
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer[..]
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    pub fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn take_nmi(&mut self) -> bool {
        let pending = self.nmi_pending;
        self.nmi_pending = false;
        pending
    }

    // Snapshot surface.

    pub fn control(&self) -> Control {
        self.ctrl
    }

    pub fn set_control(&mut self, ctrl: Control) {
        self.ctrl = ctrl;
    }

    pub fn mask(&self) -> Mask {
        self.mask
    }

    pub fn set_mask(&mut self, mask: Mask) {
        self.mask = mask;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn oam_addr(&self) -> u8 {
        self.oam_addr
    }

    pub fn set_oam_addr(&mut self, addr: u8) {
        self.oam_addr = addr;
    }

    pub fn oam(&self) -> &[u8; OAM_SIZE] {
        &self.oam
    }

    pub fn oam_mut(&mut self) -> &mut [u8; OAM_SIZE] {
        &mut self.oam
    }

    pub fn palette_ram(&self) -> &[u8; 32] {
        &self.palette_ram
    }

    pub fn palette_ram_mut(&mut self) -> &mut [u8; 32] {
        &mut self.palette_ram
    }

    pub fn current_address(&self) -> VramAddress {
        self.current
    }

    pub fn set_current_address(&mut self, address: VramAddress) {
        self.current = address;
    }

    pub fn next_address(&self) -> VramAddress {
        self.next
    }

    pub fn set_next_address(&mut self, address: VramAddress) {
        self.next = address;
    }

    /// Scroll captured when vertical blank began.
    pub fn frame_scroll(&self) -> VramAddress {
        self.frame_scroll
    }

    pub fn scan_position(&self) -> ScanPosition {
        ScanPosition {
            y: self.scan_y,
            x: self.scan_x,
            pending_clocks: self.pending_clocks,
        }
    }

    pub fn set_scan_position(&mut self, position: ScanPosition) {
        self.scan_y = position.y;
        self.scan_x = position.x;
        self.pending_clocks = position.pending_clocks;
    }

    pub fn odd_frame(&self) -> bool {
        self.odd_frame
    }

    pub fn set_odd_frame(&mut self, odd: bool) {
        self.odd_frame = odd;
    }

    pub fn open_bus(&self) -> u8 {
        self.open_bus
    }

    /// The bus pushes every value it carries so port reads see the live latch.
    pub fn set_open_bus(&mut self, value: u8) {
        self.open_bus = value;
    }

    pub fn sprite_cache(&self) -> &[Option<SpritePixel>; FRAME_WIDTH] {
        &self.sprite_cache
    }

    /// Sprites selected by the last scanline evaluation, in OAM order.
    pub fn line_sprites(&self) -> &[SpriteRecord] {
        &self.line_sprites
    }

    pub fn sprite_record(&self, oam_index: u8) -> SpriteRecord {
        let base = (oam_index as usize % SPRITE_COUNT) * 4;
        SpriteRecord {
            oam_index: oam_index % SPRITE_COUNT as u8,
            y: self.oam[base],
            tile: self.oam[base + 1],
            attributes: self.oam[base + 2],
            x: self.oam[base + 3],
        }
    }

    // Register ports.

    pub fn read_port(&mut self, addr: u16, cart: &Cartridge) -> u8 {
        self.debug.last_read_addr = addr;
        let value = match addr & 0x0007 {
            2 => self.read_status(),
            4 => self.read_oam_data(),
            7 => self.read_data(cart),
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn write_port(&mut self, addr: u16, value: u8, cart: &mut Cartridge) {
        self.open_bus = value;
        self.debug.last_write_addr = addr;
        let port = addr & 0x0007;
        trace!(port, value, y = self.scan_y, x = self.scan_x, "ppu port write");
        match port {
            0 => {
                self.ctrl.set_value(value);
                self.next.set_nametable(self.ctrl.nametable());
                self.update_nmi_line();
            }
            1 => self.mask.set_value(value),
            3 => self.oam_addr = value,
            4 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            5 => {
                self.debug.scroll_writes = self.debug.scroll_writes.wrapping_add(1);
                self.next.write_scroll(value);
            }
            6 => {
                self.debug.addr_writes = self.debug.addr_writes.wrapping_add(1);
                if self.next.write_address(value) {
                    let next = self.next;
                    self.current.copy_from(&next);
                }
            }
            7 => {
                let addr = self.current.memory_address();
                self.vram_write(addr, value, cart);
                self.current.increment(self.ctrl.increment());
            }
            _ => {}
        }
    }

    pub fn write_oam_dma(&mut self, bytes: &[u8; OAM_SIZE]) {
        self.debug.oam_dma_transfers = self.debug.oam_dma_transfers.wrapping_add(1);
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    fn read_status(&mut self) -> u8 {
        self.debug.status_reads = self.debug.status_reads.wrapping_add(1);
        self.debug.status_read_last_scanline = self.scan_y;
        self.debug.status_read_last_cycle = self.scan_x;

        // A read on the dot that would raise VBL keeps it from being raised.
        if self.scan_y == VBLANK_LINE && self.scan_x == 0 && self.pending_clocks == 0 {
            self.vbl_suppress = true;
        }

        let value = self.status.owned_bits() | (self.open_bus & 0x1F);
        self.status.set_vblank(false);
        self.next.reset_latch();
        self.update_nmi_line();
        value
    }

    fn read_oam_data(&self) -> u8 {
        let (y, x) = self.effective_dot();
        let in_fetch_window = (0..VISIBLE_LINES).contains(&y) && (256..320).contains(&x);
        let value = if self.mask.show_sprites() && in_fetch_window {
            // The per-line index is fixed for the frame, so this is valid on dot 256
            // before that line's evaluation has run.
            let offset = (x - 256) as usize;
            self.sprite_index[y as usize]
                .get(offset / 8)
                .map_or(0xFF, |&index| self.sprite_record(index).bus_byte(offset % 8))
        } else {
            self.oam[self.oam_addr as usize]
        };

        if self.oam_addr % 4 == 2 {
            value & OAM_ATTRIBUTE_MASK
        } else {
            value
        }
    }

    fn read_data(&mut self, cart: &Cartridge) -> u8 {
        let addr = self.current.memory_address();
        let result = if addr >= 0x3F00 {
            // Palette bypasses the buffer; the buffer picks up the nametable underneath.
            let value = self.palette_read(addr);
            self.ctrl.data_latch = self.vram_read(addr - 0x1000, cart);
            value
        } else {
            let buffered = self.ctrl.data_latch;
            self.ctrl.data_latch = self.vram_read(addr, cart);
            buffered
        };
        self.current.increment(self.ctrl.increment());
        result
    }

    fn vram_read(&mut self, addr: u16, cart: &Cartridge) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.pattern_reads = self.debug.pattern_reads.wrapping_add(1);
                cart.chr_read(addr)
            }
            0x2000..=0x3EFF => {
                self.debug.nametable_reads = self.debug.nametable_reads.wrapping_add(1);
                cart.nametable_read(addr)
            }
            _ => self.palette_read(addr),
        }
    }

    fn vram_write(&mut self, addr: u16, value: u8, cart: &mut Cartridge) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.pattern_writes = self.debug.pattern_writes.wrapping_add(1);
                cart.chr_write(addr, value);
            }
            0x2000..=0x3EFF => {
                self.debug.nametable_writes = self.debug.nametable_writes.wrapping_add(1);
                cart.nametable_write(addr, value);
            }
            _ => {
                self.debug.palette_writes = self.debug.palette_writes.wrapping_add(1);
                self.palette_ram[palette_index(addr)] = value & 0x3F;
            }
        }
    }

    fn palette_read(&mut self, addr: u16) -> u8 {
        self.debug.palette_reads = self.debug.palette_reads.wrapping_add(1);
        (self.palette_ram[palette_index(addr)] & 0x3F) | (self.open_bus & 0xC0)
    }

    fn update_nmi_line(&mut self) {
        let line = self.ctrl.nmi_enabled() && self.status.vblank();
        if line && !self.nmi_line {
            self.nmi_pending = true;
            self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
        }
        self.nmi_line = line;
    }

    // Scanline state machine.

    fn linear_position(&self) -> i32 {
        (self.scan_y as i32 + 1) * DOTS_PER_LINE as i32 + self.scan_x as i32
    }

    /// Dot the next pixel clock lands on, accounting for clocks still pending.
    pub fn effective_dot(&self) -> (i16, i16) {
        let position = self.linear_position() - self.pending_clocks as i32;
        let line = DOTS_PER_LINE as i32;
        (
            (position.div_euclid(line) - 1) as i16,
            position.rem_euclid(line) as i16,
        )
    }

    /// Advances one pixel clock.
    pub fn step(&mut self, cart: &mut Cartridge) {
        self.debug.ticks = self.debug.ticks.wrapping_add(1);
        if self.pending_clocks > 0 {
            self.pending_clocks -= 1;
            return;
        }

        let from = self.linear_position();
        self.advance(cart);
        let to = self.linear_position();
        self.pending_clocks = if to > from { (to - from - 1) as u16 } else { 0 };
    }

    fn advance(&mut self, cart: &mut Cartridge) {
        self.debug.transitions = self.debug.transitions.wrapping_add(1);
        let (y, x) = (self.scan_y, self.scan_x);
        let rendering = self.mask.rendering_enabled();
        let max_y = self.profile.max_y();

        match (y, x) {
            (0..=239, 0..=255) if x % 8 == 0 => {
                if rendering {
                    if x == 0 {
                        self.current.clear_a12_toggled();
                    }
                    self.fetch_tile(cart);
                }
                self.draw_tile_line(y as usize, x as usize);
                self.scan_x += 8;
            }
            (0..=239, 256) => {
                if rendering {
                    self.current.increment_y();
                    let next = self.next;
                    self.current.copy_horizontal_from(&next);
                    self.evaluate_sprite_scanline(y as usize, cart);
                } else {
                    self.sprite_cache = [None; FRAME_WIDTH];
                    self.line_sprites.clear();
                }
                self.scan_x = 320;
            }
            (-1..=239, 320..=335) => {
                if rendering {
                    self.fetch_tile(cart);
                }
                self.scan_x += 8;
            }
            (-1, 256) => {
                if rendering {
                    let next = self.next;
                    self.current.copy_from(&next);
                    self.index_sprites();
                    self.sprite_cache = [None; FRAME_WIDTH];
                    self.line_sprites.clear();
                }
                self.scan_x = 320;
            }
            (0..=239, _) => {
                self.scan_y += 1;
                self.scan_x = 0;
            }
            (-1, 0) => {
                self.status.set_sprite_zero_hit(false);
                self.status.set_sprite_overflow(false);
                self.status.set_vblank(false);
                self.vbl_suppress = false;
                self.frame_complete = false;
                self.update_nmi_line();
                self.scan_x = 256;
            }
            (-1, 336) => self.scan_x = 337,
            (-1, 337) => {
                self.scan_y = 0;
                self.scan_x = 0;
            }
            (240, _) => {
                self.scan_y = VBLANK_LINE;
                self.scan_x = -1;
            }
            (VBLANK_LINE, 0) => {
                self.frame_scroll = self.current;
                if self.vbl_suppress {
                    self.debug.vblank_suppressed = self.debug.vblank_suppressed.wrapping_add(1);
                } else {
                    self.status.set_vblank(true);
                    self.debug.vblank_entries = self.debug.vblank_entries.wrapping_add(1);
                    self.update_nmi_line();
                }
                self.scan_x += 1;
            }
            (VBLANK_LINE, 2) => {
                self.scan_y = max_y + 1;
                self.scan_x = -1;
            }
            (VBLANK_LINE, _) => self.scan_x += 1,
            (y, _) if y > max_y => {
                self.frame_complete = true;
                self.odd_frame = !self.odd_frame;
                self.debug.frames = self.debug.frames.wrapping_add(1);
                debug!(frame = self.debug.frames, odd = self.odd_frame, "frame complete");
                self.scan_y = -1;
                self.scan_x = 0;
            }
            _ => panic!("picture state machine has no transition at scanline {y}, dot {x}"),
        }
    }

    fn fetch_tile(&mut self, cart: &Cartridge) {
        let v = self.current.address();
        let id = self.vram_read(0x2000 | (v & 0x0FFF), cart);
        let attr_addr = 0x23C0 | (v & 0x0C00) | ((v >> 4) & 0x38) | ((v >> 2) & 0x07);
        let attr = self.vram_read(attr_addr, cart);
        let shift = ((self.current.coarse_y() & 0x02) << 1) | (self.current.coarse_x() & 0x02);
        let pattern_addr =
            self.ctrl.background_table() + (id as u16) * 16 + self.current.fine_y() as u16;

        self.tiles.buffer = TileRow {
            palette: (attr >> shift) & 0x03,
            low: self.vram_read(pattern_addr, cart),
            high: self.vram_read(pattern_addr + 8, cart),
        };
        self.tiles.rotate();
        self.current.increment_coarse_x();
    }

    fn draw_tile_line(&mut self, y: usize, x: usize) {
        if y >= FRAME_HEIGHT || x >= FRAME_WIDTH {
            return;
        }

        if !self.mask.show_background() && !self.mask.show_sprites() {
            let rgba = self.color(0);
            for column in x..(x + 8).min(FRAME_WIDTH) {
                self.put_pixel(column, y, rgba);
            }
            return;
        }

        let fine_x = self.current.fine_x();
        for i in 0..8u8 {
            let column = x + i as usize;
            if column >= FRAME_WIDTH {
                break;
            }

            let (bg_pattern, bg_palette) = if self.mask.show_background()
                && (column >= 8 || self.mask.show_background_left())
            {
                let bit = i + fine_x;
                let tile = if bit < 8 {
                    self.tiles.prev
                } else {
                    self.tiles.active
                };
                (tile.pattern(bit & 0x07), tile.palette)
            } else {
                (0, 0)
            };

            let sprite = if self.mask.show_sprites()
                && (column >= 8 || self.mask.show_sprites_left())
            {
                self.sprite_cache[column]
            } else {
                None
            };

            let mut palette_addr = if bg_pattern != 0 {
                (bg_palette << 2) | bg_pattern
            } else {
                0
            };
            if let Some(sprite) = sprite {
                if sprite.is_sprite_zero() && bg_pattern != 0 && column != 255 {
                    if !self.status.sprite_zero_hit() {
                        self.debug.sprite0_hit_events =
                            self.debug.sprite0_hit_events.wrapping_add(1);
                        self.debug.sprite0_hit_last_scanline = y as i16;
                        self.debug.sprite0_hit_last_column = column as u8;
                    }
                    self.status.set_sprite_zero_hit(true);
                }
                if !sprite.behind_background || bg_pattern == 0 {
                    palette_addr = 0x10 | (sprite.palette << 2) | sprite.pattern;
                }
            }

            let rgba = self.color(palette_addr);
            self.put_pixel(column, y, rgba);
        }
    }

    fn color(&self, palette_addr: u8) -> [u8; 4] {
        let entry = self.palette_ram[palette_index(palette_addr as u16)] & self.mask.palette_mask();
        let rgb = apply_emphasis(NES_PALETTE[(entry & 0x3F) as usize], self.mask.emphasis());
        [rgb[0], rgb[1], rgb[2], 0xFF]
    }

    fn put_pixel(&mut self, x: usize, y: usize, rgba: [u8; 4]) {
        let pixel = (y * FRAME_WIDTH + x) * 4;
        self.frame_buffer[pixel..pixel + 4].copy_from_slice(&rgba);
    }

    // Sprites.

    /// Buckets every OAM entry under each scanline its vertical extent covers.
    pub fn index_sprites(&mut self) {
        for bucket in &mut self.sprite_index {
            bucket.clear();
        }
        let height = self.ctrl.sprite_size() as usize;
        for index in 0..SPRITE_COUNT {
            let top = self.oam[index * 4] as usize;
            for line in top..(top + height).min(SPRITE_INDEX_LINES) {
                self.sprite_index[line].push(index as u8);
            }
        }
    }

    /// Picks the sprites covering `line` and renders them into the cache used
    /// for the following output line.
    pub fn evaluate_sprite_scanline(&mut self, line: usize, cart: &Cartridge) {
        self.sprite_cache = [None; FRAME_WIDTH];
        self.line_sprites.clear();

        let total = self.sprite_index.get(line).map_or(0, Vec::len);
        if total > SPRITES_PER_LINE {
            self.status.set_sprite_overflow(true);
            self.debug.sprite_overflow_events = self.debug.sprite_overflow_events.wrapping_add(1);
            self.debug.sprite_overflow_last_scanline = line as i16;
        }

        for slot in 0..total.min(SPRITES_PER_LINE) {
            let record = self.sprite_record(self.sprite_index[line][slot]);
            self.line_sprites.push(record);
        }

        for slot in 0..self.line_sprites.len() {
            let record = self.line_sprites[slot];
            self.cache_sprite(record, line, cart);
        }
    }

    fn cache_sprite(&mut self, sprite: SpriteRecord, line: usize, cart: &Cartridge) {
        let height = self.ctrl.sprite_size() as usize;
        let mut row = line.saturating_sub(sprite.y as usize);
        if row >= height {
            return;
        }
        if (sprite.attributes & 0x80) != 0 {
            row = height - 1 - row;
        }

        let pattern_addr = if height == 16 {
            let table = ((sprite.tile & 0x01) as u16) * 0x1000;
            let mut tile = (sprite.tile & 0xFE) as u16;
            if row >= 8 {
                tile += 1;
                row -= 8;
            }
            table + tile * 16 + row as u16
        } else {
            self.ctrl.sprite_table() + (sprite.tile as u16) * 16 + row as u16
        };

        let mut low = self.vram_read(pattern_addr, cart);
        let mut high = self.vram_read(pattern_addr + 8, cart);
        if (sprite.attributes & 0x40) != 0 {
            low = low.reverse_bits();
            high = high.reverse_bits();
        }

        for column in 0..8usize {
            let x = sprite.x as usize + column;
            if x >= FRAME_WIDTH {
                break;
            }
            let shift = 7 - column;
            let pattern = ((low >> shift) & 0x01) | (((high >> shift) & 0x01) << 1);
            if pattern == 0 || self.sprite_cache[x].is_some() {
                continue;
            }
            self.sprite_cache[x] = Some(SpritePixel {
                pattern,
                palette: sprite.attributes & 0x03,
                behind_background: (sprite.attributes & 0x20) != 0,
                oam_index: sprite.oam_index,
            });
        }
    }
}

/// Palette RAM cell for a `$3F00-$3FFF` address. Every entry whose low two
/// bits are clear shares the universal backdrop cell.
pub fn palette_index(addr: u16) -> usize {
    let index = (addr & 0x1F) as usize;
    if index & 0x03 == 0 { 0 } else { index }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::registers::WriteLatch;

    fn set_address(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16) {
        ppu.write_port(0x2006, (addr >> 8) as u8, cart);
        ppu.write_port(0x2006, addr as u8, cart);
    }

    fn write_vram(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16, value: u8) {
        set_address(ppu, cart, addr);
        ppu.write_port(0x2007, value, cart);
    }

    fn read_palette(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16) -> u8 {
        set_address(ppu, cart, addr);
        ppu.read_port(0x2007, cart)
    }

    fn solid_tile(cart: &mut Cartridge, tile: u16) {
        for row in 0..16 {
            cart.chr_write(tile * 16 + row, 0xFF);
        }
    }

    fn step_until(ppu: &mut Ppu, cart: &mut Cartridge, y: i16, x: i16) {
        for _ in 0..TimingProfile::Pal.dots_per_frame() * 2 {
            let pos = ppu.scan_position();
            if pos.y == y && pos.x == x && pos.pending_clocks == 0 {
                return;
            }
            ppu.step(cart);
        }
        panic!("never reached scanline {y}, dot {x}");
    }

    #[test]
    fn backdrop_entries_share_one_cell() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();

        write_vram(&mut ppu, &mut cart, 0x3F0C, 0x21);
        for addr in [0x3F00, 0x3F04, 0x3F08, 0x3F0C, 0x3F10] {
            assert_eq!(read_palette(&mut ppu, &mut cart, addr) & 0x3F, 0x21);
        }

        write_vram(&mut ppu, &mut cart, 0x3F01, 0x05);
        write_vram(&mut ppu, &mut cart, 0x3F11, 0x06);
        assert_eq!(read_palette(&mut ppu, &mut cart, 0x3F01) & 0x3F, 0x05);
        assert_eq!(read_palette(&mut ppu, &mut cart, 0x3F11) & 0x3F, 0x06);
    }

    #[test]
    fn palette_reads_carry_open_bus_top_bits() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        write_vram(&mut ppu, &mut cart, 0x3F02, 0xFF);
        assert_eq!(ppu.palette_ram()[2], 0x3F);

        set_address(&mut ppu, &mut cart, 0x3F02);
        ppu.set_open_bus(0xC0);
        assert_eq!(ppu.read_port(0x2007, &cart), 0xFF);
    }

    #[test]
    fn address_port_sets_current_and_status_read_resets_latch() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2006, 0x21, &mut cart);
        ppu.write_port(0x2006, 0x08, &mut cart);
        assert_eq!(ppu.current_address().address(), 0x2108);

        ppu.write_port(0x2006, 0x3F, &mut cart);
        assert_eq!(ppu.next_address().latch(), WriteLatch::AwaitingLow);
        ppu.read_port(0x2002, &cart);
        assert_eq!(ppu.next_address().latch(), WriteLatch::AwaitingHigh);
    }

    #[test]
    fn control_write_selects_nametable_in_next_address() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2000, 0x03, &mut cart);
        assert_eq!(ppu.next_address().nametable_x(), 1);
        assert_eq!(ppu.next_address().nametable_y(), 1);
    }

    #[test]
    fn data_reads_are_buffered_below_palette() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        write_vram(&mut ppu, &mut cart, 0x2005, 0x55);
        write_vram(&mut ppu, &mut cart, 0x2006, 0x66);

        set_address(&mut ppu, &mut cart, 0x2005);
        let _stale = ppu.read_port(0x2007, &cart);
        assert_eq!(ppu.read_port(0x2007, &cart), 0x55);
        assert_eq!(ppu.read_port(0x2007, &cart), 0x66);
    }

    #[test]
    fn data_port_honours_increment_of_32() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2000, 0x04, &mut cart);
        write_vram(&mut ppu, &mut cart, 0x2000, 0x01);
        assert_eq!(ppu.current_address().address(), 0x2020);
    }

    #[test]
    fn oam_attribute_byte_reads_masked() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2003, 0x02, &mut cart);
        ppu.write_port(0x2004, 0xFF, &mut cart);
        ppu.write_port(0x2003, 0x02, &mut cart);
        assert_eq!(ppu.read_port(0x2004, &cart), 0xE3);

        ppu.write_port(0x2003, 0x01, &mut cart);
        ppu.write_port(0x2004, 0xFF, &mut cart);
        ppu.write_port(0x2003, 0x01, &mut cart);
        assert_eq!(ppu.read_port(0x2004, &cart), 0xFF);
    }

    #[test]
    fn full_ntsc_frame_completes_once() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2001, 0x18, &mut cart);

        let start_odd = ppu.odd_frame();
        let mut completions = 0;
        let steps = 341 * 262;
        for step in 1..=steps {
            ppu.step(&mut cart);
            if ppu.frame_complete() {
                completions += 1;
                assert_eq!(step, steps);
                ppu.clear_frame_complete();
            }
        }
        assert_eq!(completions, 1);
        assert_ne!(ppu.odd_frame(), start_odd);
        assert_eq!(
            ppu.scan_position(),
            ScanPosition {
                y: -1,
                x: 0,
                pending_clocks: 0,
            }
        );
    }

    #[test]
    fn pal_frame_is_longer() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::new(TimingProfile::Pal);
        let steps = TimingProfile::Pal.dots_per_frame();
        assert_eq!(steps, 341 * 312);
        for _ in 0..steps - 1 {
            ppu.step(&mut cart);
        }
        assert!(!ppu.frame_complete());
        ppu.step(&mut cart);
        assert!(ppu.frame_complete());
    }

    #[test]
    fn ninth_sprite_on_a_line_sets_overflow() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        solid_tile(&mut cart, 1);

        for index in 0..SPRITE_COUNT {
            let base = index * 4;
            let record = if index < 9 {
                [5, 1, 0, (index * 10) as u8]
            } else {
                [0xFF, 0, 0, 0]
            };
            ppu.oam_mut()[base..base + 4].copy_from_slice(&record);
        }

        ppu.index_sprites();
        ppu.evaluate_sprite_scanline(10, &cart);

        assert!(ppu.status().sprite_overflow());
        assert_eq!(ppu.line_sprites().len(), 8);
        let cache = ppu.sprite_cache();
        for index in 0..8usize {
            let pixel = cache[index * 10].expect("sprite pixel cached");
            assert_eq!(pixel.oam_index as usize, index);
        }
        assert!(cache[80..88].iter().all(Option::is_none));
    }

    #[test]
    fn lower_oam_index_wins_overlapping_columns() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        solid_tile(&mut cart, 1);
        ppu.oam_mut()[..8].copy_from_slice(&[0, 1, 0x01, 4, 0, 1, 0x02, 0]);
        for byte in ppu.oam_mut()[8..].iter_mut() {
            *byte = 0xFF;
        }

        ppu.index_sprites();
        ppu.evaluate_sprite_scanline(3, &cart);
        let cache = ppu.sprite_cache();
        assert_eq!(cache[0].map(|p| p.oam_index), Some(1));
        assert_eq!(cache[4].map(|p| p.oam_index), Some(0));
        assert_eq!(cache[4].map(|p| p.palette), Some(1));
        assert!(!ppu.status().sprite_overflow());
    }

    #[test]
    fn flipped_sprite_rows_and_columns() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        // Tile 2: only the top row, leftmost pixel.
        cart.chr_write(0x20, 0x80);
        ppu.oam_mut()[..4].copy_from_slice(&[10, 2, 0xC0, 100]);
        for byte in ppu.oam_mut()[4..].iter_mut() {
            *byte = 0xFF;
        }
        ppu.index_sprites();

        ppu.evaluate_sprite_scanline(10, &cart);
        assert!(ppu.sprite_cache().iter().all(Option::is_none));

        ppu.evaluate_sprite_scanline(17, &cart);
        assert!(ppu.sprite_cache()[107].is_some());
        assert!(ppu.sprite_cache()[100].is_none());
    }

    #[test]
    fn sprite_zero_hit_over_opaque_background() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        solid_tile(&mut cart, 1);
        for addr in 0x2000..0x23C0u16 {
            cart.nametable_write(addr, 1);
        }
        ppu.oam_mut()[..4].copy_from_slice(&[20, 1, 0, 50]);
        for byte in ppu.oam_mut()[4..].iter_mut() {
            *byte = 0xFF;
        }
        ppu.write_port(0x2001, 0x1E, &mut cart);

        for _ in 0..TimingProfile::Ntsc.dots_per_frame() {
            ppu.step(&mut cart);
        }
        assert!(ppu.frame_complete());
        assert!(ppu.status().sprite_zero_hit());
        assert_eq!(ppu.debug_counters().sprite0_hit_last_scanline, 21);
    }

    #[test]
    fn disabled_rendering_fills_backdrop() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        write_vram(&mut ppu, &mut cart, 0x3F00, 0x30);
        for _ in 0..TimingProfile::Ntsc.dots_per_frame() {
            ppu.step(&mut cart);
        }

        let white = NES_PALETTE[0x30];
        let frame = ppu.frame_buffer();
        for pixel in [0usize, 128 * 256 + 77, FRAME_WIDTH * FRAME_HEIGHT - 1] {
            assert_eq!(&frame[pixel * 4..pixel * 4 + 3], &white);
            assert_eq!(frame[pixel * 4 + 3], 0xFF);
        }
    }

    const BACKDROP: u8 = 0x21;
    const BG_COLOUR: u8 = 0x16;
    const SPRITE_COLOUR: u8 = 0x2A;

    /// Solid tile 1, backdrop/background/sprite colours, and tile 1 in every
    /// nametable column matching `columns`. Leaves the scroll at 0.
    fn compositor_scene(cart: &mut Cartridge, ppu: &mut Ppu, columns: impl Fn(u16) -> bool) {
        solid_tile(cart, 1);
        for addr in 0x2000..0x23C0u16 {
            cart.nametable_write(addr, u8::from(columns(addr & 0x1F)));
        }
        write_vram(ppu, cart, 0x3F00, BACKDROP);
        write_vram(ppu, cart, 0x3F03, BG_COLOUR);
        write_vram(ppu, cart, 0x3F13, SPRITE_COLOUR);
        set_address(ppu, cart, 0x0000);
        for byte in ppu.oam_mut().iter_mut() {
            *byte = 0xFF;
        }
    }

    fn render_frame(ppu: &mut Ppu, cart: &mut Cartridge) {
        for _ in 0..ppu.profile().dots_per_frame() {
            ppu.step(cart);
        }
        assert!(ppu.frame_complete());
    }

    fn pixel(ppu: &Ppu, x: usize, y: usize) -> [u8; 3] {
        let offset = (y * FRAME_WIDTH + x) * 4;
        let frame = ppu.frame_buffer();
        [frame[offset], frame[offset + 1], frame[offset + 2]]
    }

    fn colour(index: u8) -> [u8; 3] {
        NES_PALETTE[index as usize]
    }

    #[test]
    fn background_left_column_follows_its_mask_bit() {
        for (mask, left) in [(0x08, colour(BACKDROP)), (0x0A, colour(BG_COLOUR))] {
            let mut cart = Cartridge::blank(1);
            let mut ppu = Ppu::default();
            compositor_scene(&mut cart, &mut ppu, |_| true);
            ppu.write_port(0x2001, mask, &mut cart);
            render_frame(&mut ppu, &mut cart);

            assert_eq!(pixel(&ppu, 0, 30), left);
            assert_eq!(pixel(&ppu, 7, 30), left);
            assert_eq!(pixel(&ppu, 8, 30), colour(BG_COLOUR));
        }
    }

    #[test]
    fn sprite_left_column_follows_its_mask_bit() {
        for (mask, left) in [(0x10, colour(BACKDROP)), (0x14, colour(SPRITE_COLOUR))] {
            let mut cart = Cartridge::blank(1);
            let mut ppu = Ppu::default();
            compositor_scene(&mut cart, &mut ppu, |_| false);
            ppu.oam_mut()[..8].copy_from_slice(&[20, 1, 0, 0, 20, 1, 0, 8]);
            ppu.write_port(0x2001, mask, &mut cart);
            render_frame(&mut ppu, &mut cart);

            assert_eq!(pixel(&ppu, 3, 24), left);
            assert_eq!(pixel(&ppu, 10, 24), colour(SPRITE_COLOUR));
        }
    }

    #[test]
    fn behind_background_sprite_shows_only_over_transparent_pixels() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        compositor_scene(&mut cart, &mut ppu, |column| column % 2 == 0);
        ppu.oam_mut()[..4].copy_from_slice(&[20, 1, 0x20, 4]);
        ppu.write_port(0x2001, 0x1E, &mut cart);
        render_frame(&mut ppu, &mut cart);

        assert_eq!(pixel(&ppu, 5, 24), colour(BG_COLOUR));
        assert_eq!(pixel(&ppu, 9, 24), colour(SPRITE_COLOUR));
        assert_eq!(pixel(&ppu, 13, 24), colour(BACKDROP));
        assert!(ppu.status().sprite_zero_hit());
    }

    #[test]
    fn fine_x_shifts_background_by_pixels() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        compositor_scene(&mut cart, &mut ppu, |column| column % 2 == 0);
        ppu.write_port(0x2005, 0x01, &mut cart);
        ppu.write_port(0x2005, 0x00, &mut cart);
        ppu.write_port(0x2001, 0x0A, &mut cart);
        render_frame(&mut ppu, &mut cart);

        for x in 0..7 {
            assert_eq!(pixel(&ppu, x, 50), colour(BG_COLOUR), "column {x}");
        }
        for x in 7..15 {
            assert_eq!(pixel(&ppu, x, 50), colour(BACKDROP), "column {x}");
        }
        assert_eq!(pixel(&ppu, 15, 50), colour(BG_COLOUR));
    }

    #[test]
    fn backdrop_fill_matches_transparent_background() {
        let frame_with_mask = |mask: u8| {
            let mut cart = Cartridge::blank(1);
            let mut ppu = Ppu::default();
            compositor_scene(&mut cart, &mut ppu, |_| false);
            ppu.write_port(0x2001, mask, &mut cart);
            render_frame(&mut ppu, &mut cart);
            ppu.frame_buffer().to_vec()
        };

        assert_eq!(frame_with_mask(0x20), frame_with_mask(0x2A));
        assert_eq!(frame_with_mask(0x00), frame_with_mask(0x1E));
    }

    #[test]
    fn oam_read_on_dot_256_sees_the_line_being_evaluated() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.oam_mut()[..4].copy_from_slice(&[5, 0x33, 0x01, 0x44]);
        for byte in ppu.oam_mut()[4..].iter_mut() {
            *byte = 0xFF;
        }
        ppu.write_port(0x2001, 0x10, &mut cart);

        step_until(&mut ppu, &mut cart, 5, 256);
        assert_eq!(ppu.effective_dot(), (5, 256));
        assert!(ppu.line_sprites().is_empty());
        assert_eq!(ppu.read_port(0x2004, &cart), 5);
    }

    #[test]
    fn sprite_cache_clears_when_rendering_is_off() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        solid_tile(&mut cart, 1);
        ppu.oam_mut()[..4].copy_from_slice(&[10, 1, 0, 0]);
        for byte in ppu.oam_mut()[4..].iter_mut() {
            *byte = 0xFF;
        }
        ppu.write_port(0x2001, 0x10, &mut cart);

        step_until(&mut ppu, &mut cart, 10, 256);
        ppu.step(&mut cart);
        assert!(ppu.sprite_cache()[0].is_some());

        ppu.write_port(0x2001, 0x00, &mut cart);
        step_until(&mut ppu, &mut cart, 11, 256);
        ppu.step(&mut cart);
        assert!(ppu.sprite_cache().iter().all(Option::is_none));
        assert!(ppu.line_sprites().is_empty());
    }

    #[test]
    fn vblank_raises_nmi_when_enabled() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2000, 0x80, &mut cart);
        step_until(&mut ppu, &mut cart, VBLANK_LINE, 0);
        assert!(!ppu.status().vblank());

        ppu.step(&mut cart);
        assert!(ppu.status().vblank());
        assert!(ppu.take_nmi());
        assert!(!ppu.take_nmi());
    }

    #[test]
    fn enabling_nmi_during_vblank_raises_edge() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        step_until(&mut ppu, &mut cart, VBLANK_LINE, 0);
        ppu.step(&mut cart);
        assert!(!ppu.take_nmi());

        ppu.write_port(0x2000, 0x80, &mut cart);
        assert!(ppu.take_nmi());
    }

    #[test]
    fn status_read_on_vblank_dot_suppresses_flag() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.write_port(0x2000, 0x80, &mut cart);
        step_until(&mut ppu, &mut cart, VBLANK_LINE, 0);

        let status = ppu.read_port(0x2002, &cart);
        assert_eq!(status & 0x80, 0);
        for _ in 0..100 {
            ppu.step(&mut cart);
        }
        assert!(!ppu.status().vblank());
        assert!(!ppu.take_nmi());
        assert_eq!(ppu.debug_counters().vblank_suppressed, 1);
    }

    #[test]
    fn status_read_combines_owned_bits_with_open_bus() {
        let cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        let mut status = Status::default();
        status.set_vblank(true);
        status.set_sprite_zero_hit(true);
        ppu.set_status(status);
        ppu.set_open_bus(0xA5);

        assert_eq!(ppu.read_port(0x2002, &cart), 0xC5);
        assert!(!ppu.status().vblank());
    }

    #[test]
    fn oam_reads_expose_secondary_oam_during_fetch_window() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.oam_mut()[..4].copy_from_slice(&[4, 0x33, 0x01, 0x44]);
        for byte in ppu.oam_mut()[4..].iter_mut() {
            *byte = 0xFF;
        }
        ppu.write_port(0x2001, 0x10, &mut cart);

        step_until(&mut ppu, &mut cart, 5, 256);
        ppu.step(&mut cart);
        // Effective dot 257: sprite 0, tile byte.
        assert_eq!(ppu.effective_dot(), (5, 257));
        assert_eq!(ppu.read_port(0x2004, &cart), 0x33);

        for _ in 0..7 {
            ppu.step(&mut cart);
        }
        assert_eq!(ppu.effective_dot(), (5, 264));
        assert_eq!(ppu.read_port(0x2004, &cart), 0xFF);
    }

    #[test]
    #[should_panic(expected = "no transition")]
    fn impossible_position_panics() {
        let mut cart = Cartridge::blank(1);
        let mut ppu = Ppu::default();
        ppu.set_scan_position(ScanPosition {
            y: -1,
            x: 100,
            pending_clocks: 0,
        });
        ppu.step(&mut cart);
    }
}
