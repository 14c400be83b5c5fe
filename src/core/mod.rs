pub mod detector;
pub mod engine;
pub mod filter;
pub mod propagator;
pub mod scanner;
pub mod watcher;

pub use detector::{ChangeEvent, ChangeKind, Detector, Signal, SignalOrigin};
pub use engine::MirrorEngine;
pub use filter::PathFilter;
pub use propagator::{Outcome, Propagator};
pub use scanner::{PassSummary, Scanner};
pub use watcher::{signals_from_event, FsWatcher};
