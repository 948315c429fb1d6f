pub mod attempt;
pub mod block;
pub mod event;
pub mod loaders;
pub mod task;

pub use attempt::{Attempt, AttemptOutcome, LadderStep};
pub use block::{
    Block, BlockDescriptor, BlockId, BlockImages, BlockStatus, BlockType, ConfidenceLevel,
    FailureReason, ImageVariant, RecognitionMode, RecognizedContent,
};
pub use event::ProgressEvent;
pub use loaders::{load_all_manifests, load_manifest, TaskManifest};
pub use task::{BlockProgress, Task, TaskFailure, TaskId, TaskStage, TaskStatus};
