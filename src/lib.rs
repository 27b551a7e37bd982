//! Presence-and-alert reconciliation engine for linked school accounts.
//!
//! The engine continuously answers one question: given a student's weekly
//! timetable and the wall clock, which class sessions are live right now,
//! and does every linked device's alert document reflect exactly that?
//!
//! It is built for a hostile environment: timetables are hand-entered with
//! inconsistent time formats, the document store offers whole-document
//! writes with no transactions, and several writers race on the same alert
//! arrays. Correctness comes from idempotent merge passes rather than
//! locking: every pass computes the full desired state and writes only
//! when the result differs from what is already stored.
//!
//! Structure:
//! - [`time_window`]: tolerant "HH:MM-HH:MM"-ish range evaluation
//! - [`session`]: timetable shapes to active-session extraction
//! - [`reconcile`]: the alert-array merge pass and record-level operations
//! - [`topology`]: link-driven subscription lifecycle and the event loop
//! - [`badges`]: watermark-based unread counting
//! - [`store`]: the document-store, notifier and cache seams
//! - [`config`]: on-disk engine configuration

pub mod badges;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod time_window;
pub mod topology;
pub mod types;

pub use error::{EngineError, Result};
pub use topology::{LinkTopologyManager, TopologyHandle};
pub use types::EngineConfig;
