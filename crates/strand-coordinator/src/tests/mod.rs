//! Tests for the strand-coordinator crate.

mod helpers;

mod handoff;
