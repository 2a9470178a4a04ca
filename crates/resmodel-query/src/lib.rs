//! Live collections and request coalescing for ResModel.
//!
//! - [`LiveIndex`]/[`LiveArray`] - collections re-evaluated per changed key
//! - [`FilterPredicate`] - closure, regex and equality membership tests
//! - [`FindCoalescer`] - batches concurrent finds of one type

pub mod coalescer;
pub mod live;

pub use coalescer::{FetchBatch, FetchTicket, FindCoalescer};
pub use live::{FilterPredicate, LiveArray, LiveArrayKind, LiveIndex};
