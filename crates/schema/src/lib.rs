pub mod collections;
pub mod error;
pub mod ghap;
pub mod memory;
pub mod value;

pub use collections::{EmbedRole, CODE_DIM, SEMANTIC_DIM};
pub use error::{CalmError, Result};
pub use ghap::{
    Axis, ConfidenceTier, Domain, GhapCurrent, GhapEntry, GhapOutcome, GhapRevision, Lesson,
    OutcomeStatus, RootCause, Strategy,
};
pub use memory::{MemoryCategory, MemoryRecord};
pub use value::ValueRecord;
