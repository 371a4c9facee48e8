//! Per-request usage accounting

mod usage;

pub use usage::*;
