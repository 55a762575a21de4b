//! Internal tests module
//!
//! Multi-node scenarios over the in-memory transport, with full access to
//! crate internals.

mod comprehensive;
