//! Booking scheduling & conflict resolution engine.
//!
//! The engine computes available appointment slots, drives reservations
//! through their lifecycle state machine, detects and resolves scheduling
//! conflicts, and relocates reservations safely under concurrent mutation.
//! It has no network surface of its own: an embedding service calls it
//! in-process and supplies the persistence, locking, and payment
//! collaborators.

pub mod cache;
pub mod engine;
pub mod limits;
pub mod lock;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod sweep;

pub use engine::{Engine, EngineError};
