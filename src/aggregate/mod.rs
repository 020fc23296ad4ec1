pub mod checkpoint;
pub mod engine;
pub mod runner;
pub mod watermark;
pub mod window;

pub use checkpoint::{AggregationCheckpoint, CheckpointError, CheckpointManager, CheckpointStore};
pub use engine::{EngineSnapshot, EngineStats, FinalizedWindow, IngestOutcome, WindowedAggregator};
pub use runner::AggregationJob;
pub use watermark::Watermark;
pub use window::{WindowAssigner, WindowBounds, WindowState};
