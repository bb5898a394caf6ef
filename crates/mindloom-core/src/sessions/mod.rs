//! Onboarding sessions and question coordination.
//!
//! The coordinator owns session lifecycle and block gating; question choice
//! itself is delegated to the external smart-mix selector over a read-only
//! question catalog.

mod coordinator;
mod store;
mod types;

pub use coordinator::{
    AnswerOutcome, CoordinatorConfig, QuestionCatalog, QuestionSelector, SelectedQuestion,
    SelectorState, SessionCoordinator,
};
pub use store::{
    FlaggedQuestions, MemoryFlaggedQuestions, MemorySessionStore, PgFlaggedQuestions,
    PgSessionStore, SessionError, SessionStore,
};
pub use types::{BlockKind, Cluster, Question, Session, SessionStatus};
