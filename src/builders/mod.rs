//! Builders that assemble a whole engine from [`crate::config::Configuration`]
//! plus host-supplied [`CallableRunner`]/[`GeneratorRunner`] implementations.
//!
//! [`CallableRunner`]: crate::core::CallableRunner
//! [`GeneratorRunner`]: crate::core::GeneratorRunner

pub mod engine_builder;

pub use engine_builder::{build_engine, Engine};
