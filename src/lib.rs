pub mod ad_break;
pub mod boundary_refiner;
pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod models;
pub mod processor;
pub mod scene_grouper;
pub mod shot_grouper;
pub mod similarity;
pub mod smpte;
pub mod storage;

pub use ad_break::{AdBreakReport, AdBreakSearch};
pub use boundary_refiner::{BoundaryRefiner, RefinementProgress, RefinementState};
pub use classifier::StructuralClassifier;
pub use collaborators::{FrameSampler, HttpFrameSampler, HttpStructureAnalyzer, StructureAnalyzer};
pub use config::{ConfigLoader, ConfigOverrides, ExtendedConfig, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use processor::{DocumentLocation, PipelineStatus, StructureProcessor};
pub use scene_grouper::SceneGrouper;
pub use shot_grouper::ShotGrouper;
pub use storage::{DocumentStore, LocalDocumentStore};
