pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod fusion;
pub mod publish;
pub mod scheduler;
pub mod storage;

pub use config::CoordinatorConfig;
pub use coordinator::{CaptureOutcome, ExpireOutcome, MomentCoordinator};
pub use dedup::DeduplicationService;
pub use error::MomentError;
pub use fusion::{FusionConfig, FusionError, OutputFormat, PhotoFusionEngine};
pub use publish::{NullPublisher, TransitionPublisher};
pub use scheduler::ExpirationScheduler;
pub use storage::BlobStore;
