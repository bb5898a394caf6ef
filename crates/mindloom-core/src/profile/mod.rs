//! Layered personality profiles and trait evolution.
//!
//! The profile is the deep-merge of every accepted deep analysis. Trait
//! values are additionally tracked in an append-only history read as a
//! sliding window for significance detection and pattern tagging.

mod evolution;
mod layers;
pub mod merge;
mod store;
mod writer;

pub use evolution::{
    classify_pattern, EvolutionConfig, EvolutionSignal, TraitEvolutionWriter, TrendPattern,
};
pub use layers::{LayerItems, PersonalityProfile, ProfileItem, ProfileLayer};
pub use merge::{merge_into, ExtractedLayers, MergeOutcome};
pub use store::{
    MemoryProfileStore, MemoryTraitHistoryStore, PgProfileStore, PgTraitHistoryStore,
    ProfileError, ProfileStore, TraitHistoryEntry, TraitHistoryStore,
};
pub use writer::{ProfileWriteListener, ProfileWriter};
