use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use quick_xml::Reader;
use quick_xml::events::Event;
use raster8::nes::ppu::TimingProfile;
use raster8::{Config, Console};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    tvsha1: String,
}

#[derive(Debug, Clone)]
struct FrameHashes {
    rgba: String,
    rgb: String,
    argb: String,
    bgra: String,
}

impl FrameHashes {
    fn of(frame_rgba: &[u8]) -> Self {
        Self {
            rgba: hash_reordered(frame_rgba, &[0, 1, 2, 3]),
            rgb: hash_reordered(frame_rgba, &[0, 1, 2]),
            argb: hash_reordered(frame_rgba, &[3, 0, 1, 2]),
            bgra: hash_reordered(frame_rgba, &[2, 1, 0, 3]),
        }
    }

    fn matching_order(&self, expected: &str) -> Option<&'static str> {
        [
            ("rgba", &self.rgba),
            ("rgb", &self.rgb),
            ("argb", &self.argb),
            ("bgra", &self.bgra),
        ]
        .into_iter()
        .find(|(_, hash)| hash.as_str() == expected)
        .map(|(order, _)| order)
    }
}

#[derive(Debug, Clone)]
struct Options {
    rom: Option<PathBuf>,
    frames: u32,
    pal: bool,
    config: Option<PathBuf>,
    suite: Option<PathBuf>,
    rom_root: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 60,
            pal: false,
            config: None,
            suite: None,
            rom_root: PathBuf::from("."),
        }
    }
}

fn parse_args() -> Result<Options> {
    let mut opts = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom roms/nestest.nes")?;
                opts.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 120")?;
                opts.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--pal" => opts.pal = true,
            "--config" => {
                let value = args
                    .next()
                    .context("--config requires a path, e.g. --config raster8.json")?;
                opts.config = Some(PathBuf::from(value));
            }
            "--suite" => {
                let value = args
                    .next()
                    .context("--suite requires a path, e.g. --suite nes-test-roms/test_roms.xml")?;
                opts.suite = Some(PathBuf::from(value));
            }
            "--rom-root" => {
                let value = args
                    .next()
                    .context("--rom-root requires a path, e.g. --rom-root nes-test-roms")?;
                opts.rom_root = PathBuf::from(value);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    if opts.rom.is_none() && opts.suite.is_none() {
        anyhow::bail!("nothing to run: pass --rom <path> or --suite <xml>");
    }

    Ok(opts)
}

fn print_help() {
    println!(
        "Headless frame runner for raster8\n\n\
Usage:\n\
  cargo run --bin frame_runner -- [options]\n\n\
Options:\n\
  --rom <path>          Run a single cartridge image\n\
  --frames <n>          Frames to run for --rom (default 60)\n\
  --pal                 Use PAL timing\n\
  --config <path>       Load settings from a JSON file\n\
  --suite <path>        Check frame hashes listed in a test_roms.xml suite\n\
  --rom-root <path>     Directory suite filenames are relative to (default .)\n\
  -h, --help            Show this help\n"
    );
}

fn load_config(opts: &Options) -> Result<Config> {
    let mut config = match &opts.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if opts.pal {
        config.timing = TimingProfile::Pal;
    }
    Ok(config)
}

fn parse_suite_xml(path: &Path) -> Result<Vec<SuiteTest>> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read suite XML: {}", path.display()))?;

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut reading_tvsha1 = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                if name.as_ref() == b"test" {
                    let mut test = SuiteTest {
                        filename: String::new(),
                        system: String::new(),
                        runframes: 0,
                        tvsha1: String::new(),
                    };
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        match attr.key.as_ref() {
                            b"filename" => test.filename = value,
                            b"system" => test.system = value,
                            b"runframes" => test.runframes = value.parse::<u32>().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current = Some(test);
                } else if name.as_ref() == b"tvsha1" {
                    reading_tvsha1 = true;
                }
            }
            Ok(Event::Text(e)) => {
                if let (true, Some(test)) = (reading_tvsha1, current.as_mut()) {
                    test.tvsha1.push_str(&e.decode().map(|v| v.to_string()).unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                if name.as_ref() == b"tvsha1" {
                    reading_tvsha1 = false;
                } else if name.as_ref() == b"test" {
                    if let Some(mut test) = current.take() {
                        test.tvsha1 = test.tvsha1.trim().to_string();
                        tests.push(test);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                anyhow::bail!("failed to parse suite XML: {err}");
            }
            _ => {}
        }
    }

    Ok(tests)
}

fn hash_reordered(frame_rgba: &[u8], order: &[usize]) -> String {
    let mut bytes = Vec::with_capacity(frame_rgba.len() / 4 * order.len());
    for px in frame_rgba.chunks_exact(4) {
        bytes.extend(order.iter().map(|&channel| px[channel]));
    }
    BASE64_STANDARD.encode(Sha1::digest(&bytes))
}

fn run_frames(rom_path: &Path, frames: u32, config: Config) -> Result<Console> {
    let mut console = Console::from_rom_path(rom_path, config)
        .with_context(|| format!("failed to load ROM {}", rom_path.display()))?;
    for frame in 0..frames {
        if !console.run_frame() {
            warn!(frame, "frame guard tripped, continuing with the next frame");
        }
    }
    debug!(
        frames = console.debug_counters().frame_count,
        ppu_cycles = console.debug_counters().ppu_cycles,
        "run finished"
    );
    Ok(console)
}

fn run_single_rom(rom_path: &Path, opts: &Options, config: Config) -> Result<()> {
    let start = Instant::now();
    let console = run_frames(rom_path, opts.frames, config)?;
    let hashes = FrameHashes::of(console.frame_buffer());
    let counters = console.debug_counters();

    println!("ROM:     {}", rom_path.display());
    println!("Mapper:  {}", console.mapper_name());
    println!("Timing:  {:?}", console.profile());
    println!("Frames:  {}", counters.frame_count);
    println!("rgba:    {}", hashes.rgba);
    println!("rgb:     {}", hashes.rgb);
    println!("argb:    {}", hashes.argb);
    println!("bgra:    {}", hashes.bgra);
    println!(
        "nmi_edges={} dma_transfers={} guard_trips={}",
        counters.nmi_edges, counters.dma_transfers, counters.frame_guard_trips
    );
    println!("Runtime: {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}

fn run_suite(suite: &Path, opts: &Options, config: &Config) -> Result<()> {
    let start = Instant::now();
    let tests = parse_suite_xml(suite)?;
    println!("Running {} test(s) from {}", tests.len(), suite.display());

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for (idx, test) in tests.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, tests.len(), test.filename);
        let mut test_config = config.clone();
        if test.system.eq_ignore_ascii_case("pal") {
            test_config.timing = TimingProfile::Pal;
        }

        let rom_path = opts.rom_root.join(&test.filename);
        match run_frames(&rom_path, test.runframes, test_config) {
            Ok(console) => {
                let hashes = FrameHashes::of(console.frame_buffer());
                match hashes.matching_order(&test.tvsha1) {
                    Some(order) => {
                        passed += 1;
                        println!("PASS {label} [{order}]");
                    }
                    None => {
                        failed += 1;
                        println!(
                            "FAIL {label}\n  expected: {}\n  got rgba: {}\n  got rgb : {}\n  got argb: {}\n  got bgra: {}",
                            test.tvsha1, hashes.rgba, hashes.rgb, hashes.argb, hashes.bgra
                        );
                    }
                }
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err:#}");
            }
        }
    }

    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = parse_args()?;
    let config = load_config(&opts)?;

    if let Some(rom) = &opts.rom {
        run_single_rom(rom, &opts, config.clone())?;
    }
    if let Some(suite) = &opts.suite {
        run_suite(suite, &opts, &config)?;
    }
    Ok(())
}
