//! Utilities for testing code that works with multipath connections. They are used for testing
//!  this crate itself, and they are exported so that applications can exercise their own
//!  [crate::subflow::Subflow] based code without network I/O.

pub mod subflow;
