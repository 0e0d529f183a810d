use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::nes::ppu::TimingProfile;

pub const DEFAULT_DEBUG_EVENT_CAPACITY: usize = 512;
pub const DEFAULT_FRAME_GUARD_CYCLES: u64 = 10_000_000;

/// Runtime settings shared by the console and the tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timing: TimingProfile,
    /// Length of the console's recent-event ring buffer.
    pub debug_event_capacity: usize,
    /// Processor cycles a single frame may take before `run_frame` gives up.
    pub frame_guard_cycles: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timing: TimingProfile::Ntsc,
            debug_event_capacity: DEFAULT_DEBUG_EVENT_CAPACITY,
            frame_guard_cycles: DEFAULT_FRAME_GUARD_CYCLES,
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse config JSON")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("invalid config: {}", path.display()))
    }
}
