//! Transport contract shared by every chat backend.

pub mod console;
pub mod port;
pub mod stealth;
pub mod types;
