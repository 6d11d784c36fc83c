//! # ginger-core: client data model for ginger
//!
//! Observable documents, unordered collections and ordered sequences, plus the
//! mutation records they emit while kept synced.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  retain/release  ┌──────────────┐
//! │  Collection  │ ───────────────► │   Document   │
//! │  Sequence    │ ◄─────────────── │ (observable) │
//! └──────┬───────┘   changed:/id:   └──────────────┘
//!        │ MutationRecord
//!        ▼
//! ┌──────────────┐
//! │ MutationSink │  (the client queue in ginger-sync)
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`keypath`] : segment paths addressing documents and containers
//! - [`event`] : namespaced event emitter with listener handles
//! - [`document`] : observable reference-counted documents
//! - [`collection`] : unordered collections
//! - [`sequence`] : linked sequences with stable item ids
//! - [`reconcile`] : pure sequence reconciliation planner
//! - [`mutation`] : mutation records and the sink they flow into

pub mod collection;
pub mod document;
pub mod error;
pub mod event;
pub mod keypath;
pub mod mutation;
pub mod reconcile;
pub mod sequence;

pub use collection::{Collection, CollectionEvent};
pub use document::{fields_of, Document, DocumentEvent, DocumentRef, Fields, SetOptions, ID_FIELD};
pub use error::{Result, SyncError};
pub use event::{EventKey, Emitter, ListenerId};
pub use keypath::KeyPath;
pub use mutation::{MutationRecord, MutationSink, Payload, Verb};
pub use reconcile::{Insertion, ReconcilePlan};
pub use sequence::{Sequence, SequenceEvent, SequenceItem};
