//! Transaction envelopes binding one logical command (or an `EXEC` body) to the shards it
//! touches.

pub mod keys;
pub mod transaction;

pub use keys::{KeyRange, KeySpec, determine_keys};
pub use transaction::{CmdBinding, Transaction};
