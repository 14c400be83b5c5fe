pub mod config;
pub mod core;
pub mod db;
pub mod logging;
pub mod storage;

pub use config::MirrorConfig;
pub use core::{ChangeEvent, ChangeKind, Detector, MirrorEngine, Propagator, Scanner, Signal};
pub use db::{MetadataStore, StoreError};
pub use storage::{ObjectStore, StorageRegistry};
