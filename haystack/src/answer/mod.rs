//! Answer parsing and scoring.

mod parser;
mod scorer;

pub use parser::{is_valid_answer, parse_answer, ParsedAnswer};
pub use scorer::{score_answer, Score, ScoreMetrics};
