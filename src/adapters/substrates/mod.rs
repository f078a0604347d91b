//! Engine process spawners.

pub mod claude_code;
pub mod mock;

pub use claude_code::EngineProcessSpawner;
pub use mock::{MockScript, MockSpawner, RecordedSpawn};
