//! Upstream API types

mod ollama;

pub use ollama::*;
