//! Durable hinted-handoff records wrapping Fjall.
//!
//! A [`HandoffHint`](strand_types::HandoffHint) is written when a segment
//! destined for a down node is parked on a stand-in. The repository
//! survives restarts; a hint is removed only after its replay succeeded
//! and the stand-in copy was purged.

mod error;
mod repository;

pub use error::HintError;
pub use repository::HintRepository;
