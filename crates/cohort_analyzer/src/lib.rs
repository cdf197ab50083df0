//! Error-log analyzer.
//!
//! Streams a job's `errors.jsonl`, normalizes messages into patterns,
//! classifies retryability with a fixed decision tree, groups records, and
//! emits the retry CSV plus a JSON report. Memory is O(groups), not O(rows):
//! only retryable records are retained (they become the retry CSV).

pub mod analyze;
pub mod classify;
pub mod normalize;
pub mod report;
pub mod retry_csv;

pub use analyze::{analyze_file, Analysis, ErrorGroup};
pub use classify::{classify, Classification, RetryKind, RetryStrategy, Severity};
pub use normalize::Normalizer;
pub use report::{build_report, AnalysisReport, Suggestion};
pub use retry_csv::write_retry_csv;
