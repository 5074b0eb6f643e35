pub mod client;
pub mod sockopt;
pub mod stats;

pub use client::Client;
pub use stats::{FieldKind, FieldValue, Stats, FIELDS};
