//! Two-phase answer analysis.
//!
//! Instant phase for a sub-second reply, deep phase for the authoritative
//! record, plus the background lanes (vectorization, profile merge) tracked
//! on the record itself.

mod pipeline;
mod record;
mod store;
mod vector;

pub use pipeline::{
    AnalysisInput, AnalysisPipeline, InstantResult, PipelineConfig, PipelineError, ProcessSummary,
};
pub use record::{
    AnalysisRecord, Lane, LaneStatus, SourceRef, SpecialSituation, TraitScores,
    TRAIT_SCORES_VERSION,
};
pub use store::{
    AnalysisError, AnalysisStore, LaneCounts, MemoryAnalysisStore, NewAnalysisRecord,
    PgAnalysisStore, PipelineWindowStats,
};
pub use vector::{MemoryVectorStore, StoredVector, VectorError, VectorStore};
