//! Device snapshots for quiescent-point checkpointing.
//!
//! A snapshot is a named bag of fields; devices write every architectural
//! register into it under a stable key and read them back on restore. Media
//! contents are deliberately not part of a snapshot — the integration is
//! responsible for pairing a restored device with identical backing storage.

pub mod io;
