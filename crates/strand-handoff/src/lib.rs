//! Hint replay toward recovered nodes.
//!
//! When a write cannot reach a segment's primary, the coordinator parks
//! the segment on stand-in nodes together with a durable hint naming the
//! destination it is owed to. This crate drains those hints: the
//! [`HintDrainer`] subscribes to liveness events and, when a destination
//! recovers, forwards each owed segment (or destroy) oldest-first, then
//! purges the stand-in copy and the hint.

mod drainer;
mod error;

pub use drainer::HintDrainer;
pub use error::HandoffError;
