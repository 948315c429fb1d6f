pub mod block_processor;
pub mod retry_ladder;

pub use block_processor::{BlockProcessor, BlockRun};
pub use retry_ladder::{LadderJob, LadderOutcome, RetryLadder};
