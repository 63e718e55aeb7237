//! # tandem-core — Replicated text model for Tandem
//!
//! Everything here is synchronous and I/O free; `tandem-collab` owns the
//! networking.
//!
//! ## Modules
//!
//! - [`id`] — Replica ids, operation ids, local clocks and state vectors
//! - [`document`] — Sequence CRDT with tombstones and causal buffering
//! - [`edit`] — Range edits exchanged with the editor widget
//! - [`exec`] — Request/response types for the remote execution service

pub mod id;
pub mod document;
pub mod edit;
pub mod exec;

pub use id::{LocalClock, OperationId, ReplicaId, StateVector};
pub use document::{Anchor, ApplyOutcome, Document, DocumentError, Element, Operation};
pub use edit::{coalesce, TextEdit};
pub use exec::{ExecError, ExecFile, ExecuteRequest, ExecuteResponse, Runtime, StageOutput, DEFAULT_ARGS, RUNTIMES};
