//! Cairn Unit
//!
//! This crate defines the boundary between the cairn engine and the steps it
//! runs. A step is a [`UnitOfWork`]: something with a declared set of typed
//! input and output fields and an async `run` that turns a resolved
//! [`ParameterSet`] into an [`OutputSet`].
//!
//! The engine never knows what a unit does. It only reads the declaration
//! ([`UnitSpec`]) to validate and fingerprint inputs, and calls `run` when the
//! cache cannot answer.
//!
//! [`CommandUnit`] is the generic implementation that launches an external
//! program, rendering its arguments from the resolved inputs.

mod coerce;
mod command;
mod error;
mod types;
mod unit;

pub use coerce::{coerce_value, render_template};
pub use command::{CommandUnit, OutputSource};
pub use error::UnitError;
pub use types::{FieldType, InputField, OutputField, OutputSet, ParameterSet, UnitSpec};
pub use unit::{RunContext, UnitOfWork};
