use anyhow::{Context, Result};
use raster8::nes::ppu::OAM_SIZE;
use raster8::{Config, Console};
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const NAMETABLE_COLUMNS: u16 = 32;
const NAMETABLE_ROWS: u16 = 30;

fn print_commands() {
    println!("Commands:");
    println!("  frame [n]  - Run n frames (default 1)");
    println!("  ppu        - Show picture engine registers and position");
    println!("  oam        - Dump the 64 sprite entries");
    println!("  nt <n>     - Dump nametable n (0-3) tile ids");
    println!("  palette    - Dump palette RAM");
    println!("  events     - Show recent console events");
    println!("  quit, q    - Exit debugger");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("raster8 picture debugger");
    println!("========================");
    println!();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("Usage: raster8_debug <rom.nes> [config.json]");
        println!();
        print_commands();
        return Ok(());
    }

    let config = match args.get(2) {
        Some(path) => Config::from_json_file(Path::new(path))?,
        None => Config::default(),
    };

    let rom_path = &args[1];
    println!("Loading ROM: {rom_path}");
    let mut console = Console::from_rom_path(Path::new(rom_path), config)
        .with_context(|| format!("failed to load ROM {rom_path}"))?;

    println!("Mapper: {}", console.mapper_name());
    println!("Timing: {:?}", console.profile());
    println!();
    println!("Type 'help' for commands");

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            continue;
        };

        match command {
            "help" => print_commands(),
            "frame" | "f" => {
                let count = parts
                    .get(1)
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(1);
                for _ in 0..count {
                    if !console.run_frame() {
                        println!("Frame guard tripped");
                        break;
                    }
                }
                let counters = console.debug_counters();
                println!(
                    "Frames: {}  PPU cycles: {}  NMI edges: {}",
                    counters.frame_count, counters.ppu_cycles, counters.nmi_edges
                );
            }
            "ppu" => show_ppu(&console),
            "oam" => show_oam(&console),
            "nt" => match parts.get(1).and_then(|v| v.parse::<u16>().ok()) {
                Some(index) if index < 4 => show_nametable(&console, index),
                _ => println!("Usage: nt <0-3>"),
            },
            "palette" => show_palette(&console),
            "events" => {
                for event in console.debug_recent_events(16).iter().rev() {
                    println!("  {event}");
                }
            }
            "mapper" => println!("Mapper: {}", console.debug_mapper_state()),
            "quit" | "q" => {
                println!("Goodbye!");
                break;
            }
            _ => {
                println!("Unknown command: {command}. Type 'help' for available commands.");
            }
        }
    }

    Ok(())
}

fn show_ppu(console: &Console) {
    let ppu = console.bus().ppu();
    let position = ppu.scan_position();
    let counters = ppu.debug_counters();
    println!("PPU State:");
    println!(
        "  Scanline: {}, Dot: {}, Pending: {}",
        position.y, position.x, position.pending_clocks
    );
    println!("  $2000 (ctrl):   {:08b}", ppu.control().value());
    println!("  $2001 (mask):   {:08b}", ppu.mask().value());
    println!("  $2002 (status): {:08b}", ppu.status().value());
    println!(
        "  v=${:04X} t=${:04X} fine_x={} latch={:?}",
        ppu.current_address().address(),
        ppu.next_address().address(),
        ppu.next_address().fine_x(),
        ppu.next_address().latch()
    );
    println!("  OAM addr: ${:02X}  odd frame: {}", ppu.oam_addr(), ppu.odd_frame());
    println!(
        "  sprite0 hits: {} (last line {})  overflows: {} (last line {})",
        counters.sprite0_hit_events,
        counters.sprite0_hit_last_scanline,
        counters.sprite_overflow_events,
        counters.sprite_overflow_last_scanline
    );
}

fn show_oam(console: &Console) {
    let oam = console.bus().ppu().oam();
    for (index, entry) in oam.chunks_exact(4).enumerate().take(OAM_SIZE / 4) {
        println!(
            "  #{index:02}: y={:3} tile=${:02X} attr=${:02X} x={:3}",
            entry[0], entry[1], entry[2], entry[3]
        );
    }
}

fn show_nametable(console: &Console, index: u16) {
    let cart = console.bus().cartridge();
    let base = 0x2000 + index * 0x400;
    for row in 0..NAMETABLE_ROWS {
        let line: Vec<String> = (0..NAMETABLE_COLUMNS)
            .map(|col| format!("{:02X}", cart.nametable_read(base + row * NAMETABLE_COLUMNS + col)))
            .collect();
        println!("  {:04X}: {}", base + row * NAMETABLE_COLUMNS, line.join(" "));
    }
}

fn show_palette(console: &Console) {
    let palette = console.bus().ppu().palette_ram();
    for (row, chunk) in palette.chunks(16).enumerate() {
        let line: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
        let label = if row == 0 { "bg " } else { "spr" };
        println!("  {label}: {}", line.join(" "));
    }
}
