//! Command implementations for the Segtrain CLI.

pub mod history;
pub mod train;
