//! Event types broadcast to display sinks.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so sinks can
//! forward them over whatever transport they use (stdout JSON lines, an app
//! event bus, a socket).

pub mod events;
