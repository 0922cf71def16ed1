//! Data models shared by every layer of the update pipeline.
//!
//! The descriptor wire format matches the JSON published next to each deployment.

mod descriptor;
mod state;

pub use descriptor::*;
pub use state::*;
