//! Venue protocol: wire types and request builders.

mod requests;
mod types;

pub use requests::*;
pub use types::*;
