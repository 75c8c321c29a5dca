//! Cooperative cancellation.
//!
//! A job owns one [`CancellationToken`]; stages observe a child of it so a
//! failing stage can stop its siblings without touching the caller's token.

mod token;

pub use token::CancellationToken;
