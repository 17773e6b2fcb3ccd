//! Directional, regime-aware grid trading engine

pub mod engine;
pub mod levels;
pub mod regime;
pub mod state;

pub use engine::GridEngine;
pub use state::{GridDirection, GridLevel, GridState, LevelSide, LevelState};
