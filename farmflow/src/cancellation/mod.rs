//! Cooperative cancellation for batch processing.

mod token;

pub use token::CancellationToken;
