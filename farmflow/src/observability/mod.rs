//! Logging setup.

mod logging;

pub use logging::{env_filter, init_tracing, operation_span, LogFormat, DEFAULT_FILTER};
