//! CLI command implementations for the pgtenant binary.

pub mod check;
pub mod keys;
pub mod serve;
pub mod token;
