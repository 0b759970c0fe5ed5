//! Storage Module
//!
//! Everything a run keeps: step results, checkpoints of run progress,
//! conversational sessions and a shared file cache.
//!
//! # Components
//!
//! - [`ResultStore`]: Normalized step outputs with schema validation
//! - [`CheckpointStore`]: Dated, versioned snapshots with a latest alias
//! - [`SessionStore`]: Turn-bounded sessions that outlive a run
//! - [`FileCache`]: Path + mtime keyed file contents
//! - [`codec`]: Encoding of non-JSON variable state

pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod result;
pub mod results;
pub mod schema;
pub mod session;

pub use cache::FileCache;
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointInfo, CheckpointStore};
pub use codec::{decode_variables, encode_variables, CodecError, Variable, Variables};
pub use result::{normalize, StepResult, DEFAULT_MAX_TEXT_BYTES};
pub use results::{PromptFormat, PromptOptions, ResultStore, ResultSummary};
pub use schema::{SchemaError, Violation};
pub use session::{Session, SessionError, SessionOptions, SessionStatus, SessionStore, TurnOutcome};
