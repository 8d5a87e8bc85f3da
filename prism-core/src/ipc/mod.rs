//! Event types broadcast by the controllers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them to a UI bridge or a log unchanged.

pub mod events;
