pub mod logger;

pub use logger::{AccessLogEntry, Logger, RequestLog};
