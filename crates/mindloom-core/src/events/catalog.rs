//! The closed catalog of event types the core produces and consumes.

use super::envelope::EventPriority;

/// `user.onboarding.initiated` — a user asked to begin onboarding.
pub const USER_ONBOARDING_INITIATED: &str = "user.onboarding.initiated";
/// `session.created` — a new onboarding session row exists.
pub const SESSION_CREATED: &str = "session.created";
/// `user.session.started` — the session is live and wants a first question.
pub const USER_SESSION_STARTED: &str = "user.session.started";
/// `question.selected` — the coordinator picked the next question.
pub const QUESTION_SELECTED: &str = "question.selected";
/// `user.answer.submitted` — the gateway delivered an answer.
pub const USER_ANSWER_SUBMITTED: &str = "user.answer.submitted";
/// `analysis.instant.completed` — the instant phase produced its quick reply.
pub const ANALYSIS_INSTANT_COMPLETED: &str = "analysis.instant.completed";
/// `analysis.completed` — the deep phase persisted an analysis record.
pub const ANALYSIS_COMPLETED: &str = "analysis.completed";
/// `trait.extracted` — the deep phase extracted one trait value.
pub const TRAIT_EXTRACTED: &str = "trait.extracted";
/// `trait.evolution.detected` — a trait moved past the significance
/// threshold.
pub const TRAIT_EVOLUTION_DETECTED: &str = "trait.evolution.detected";
/// `session.completed` — the session finished all its blocks.
pub const SESSION_COMPLETED: &str = "session.completed";
/// `session.timed_out` — the session expired without completing.
pub const SESSION_TIMED_OUT: &str = "session.timed_out";
/// `insight.generated` — an insight for the coach or the user.
pub const INSIGHT_GENERATED: &str = "insight.generated";

/// Default priority lane for a catalog event type.
///
/// Unknown types fall back to [`EventPriority::Normal`]; the bus accepts
/// them (the catalog is closed for the core, not for collaborators).
pub fn default_priority(event_type: &str) -> EventPriority {
    match event_type {
        USER_ANSWER_SUBMITTED | ANALYSIS_INSTANT_COMPLETED => EventPriority::High,
        USER_ONBOARDING_INITIATED | USER_SESSION_STARTED | QUESTION_SELECTED => EventPriority::High,
        SESSION_TIMED_OUT => EventPriority::Low,
        INSIGHT_GENERATED => EventPriority::Low,
        _ => EventPriority::Normal,
    }
}
