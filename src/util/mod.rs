//! Internal utilities for the Contexture runtime.
//!
//! These utilities are intentionally minimal and dependency-free so that
//! the ordering and ownership machinery built on top of them stays
//! deterministic and easy to reason about.

pub mod arena;

pub use arena::{Arena, ArenaIndex};
