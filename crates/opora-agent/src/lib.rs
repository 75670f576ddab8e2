//! The ingestion-and-reasoning pipeline: ingestor, case extractor, answer
//! engine, reaction handler, admin onboarding machine, and the reconciler,
//! all wired through the shared [`Deps`](deps::Deps) record and driven by
//! the job queue's worker pool.

pub mod admin;
pub mod answer;
pub mod deps;
pub mod dispatch;
pub mod error;
pub mod extractor;
pub mod history;
pub mod ingest;
pub mod promote;
pub mod reactions;
pub mod reconciler;
mod strings;

pub use deps::{Deps, GroupLocks, HistoryNotifier, Transport, TransportError};
pub use dispatch::{Dispatcher, HistoryLinkPayload, MessageJobPayload};
pub use error::{AgentError, Result};
