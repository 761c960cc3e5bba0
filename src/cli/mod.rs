//! Terminal front end for compression runs.
//!
//! Renders the controller's event stream either as human-readable lines or
//! as newline-delimited JSON for scripts.

mod interrupt;
mod output;

pub use interrupt::{InterruptAction, InterruptEscalation};
pub use output::{EventPrinter, OutputFormat, render_presets};
