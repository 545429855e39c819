//! Deferred values and resource inputs.
//!
//! This module provides the value cell ([`Output`]) that carries a resource's
//! outputs to its consumers, and the input trees ([`Input`], [`Properties`])
//! that mix literals with cells.

mod cell;
mod input;

pub use cell::{CellError, CellResult, Output, OutputResolver};
pub use input::{value_at_path, Input, Properties};
