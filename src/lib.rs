pub mod config;
pub mod control_flow;
pub mod error;
pub mod fetch_queue;
pub mod log_parser;
pub mod normalize;
pub mod predict;
mod reconcile;
pub mod report;
pub mod scan;
pub mod stall;
pub mod stall_detail;
pub mod summary;

pub use config::ProfileConfig;
pub use error::{Result, TraceError};
pub use scan::{parse_log_directory, parse_trace_file, parse_trace_reader, TraceScanner};
pub use summary::RunSummary;
