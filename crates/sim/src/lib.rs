//! Validation engine: replays an operation's validation under the bundler
//! tracer and enforces the mempool safety rules on the result.

mod rules;
mod validator;

pub use rules::is_associated_slot;
pub use validator::{SafeValidator, UnsafeValidator, Validator, ValidatorConfig};
