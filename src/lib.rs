pub mod config;
pub mod nes;

pub use config::Config;
pub use nes::Console;
