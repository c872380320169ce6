//! Observer-facing types.
//!
//! Everything here derives `serde::Serialize` + `serde::Deserialize` so a
//! host can forward it as JSON without an adapter layer.

pub mod events;
