//! Wiring for a two-context frame pipeline: a control context producing layer trees, a raster
//! context drawing them, and a display paced by `present_pacer`.

mod config;
mod display;
mod rasterizer;
mod shell;

pub use config::{ConfigError, PipelineConfig};
pub use display::SimulatedDisplay;
pub use rasterizer::Rasterizer;
pub use shell::{Shell, ShellError, ShellStats};
