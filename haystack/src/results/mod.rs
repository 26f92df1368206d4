//! Result records, JSONL streams, and run summaries.

mod stream;
mod summary;
mod types;

pub use stream::{read_questions, read_stream, write_stream, CheckpointWriter};
pub use summary::{CellStat, RunSummary};
pub use types::{fingerprint_source, ParsingStatus, RecoveryInfo, RunMetadata, TestResult};
