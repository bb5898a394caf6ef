//! Periodic fact validation.
//!
//! Dossier facts age: goals go stale faster than barriers, barriers faster
//! than values. The manager tracks when each fact was last validated and
//! schedules a check-in question once the category window (or a session
//! budget) is exceeded. Negative outcomes mark the fact stale so the next
//! profile update can retire it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::profile::{PersonalityProfile, ProfileLayer};

/// Fact category, ordering the validation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactCategory {
    /// Goals: revalidated most often.
    Goal,
    /// Barriers: slower.
    Barrier,
    /// Values: slowest.
    Value,
}

impl FactCategory {
    /// Name used in check-in records.
    pub fn as_str(&self) -> &'static str {
        match self {
            FactCategory::Goal => "goal",
            FactCategory::Barrier => "barrier",
            FactCategory::Value => "value",
        }
    }

    fn layer(&self) -> ProfileLayer {
        match self {
            FactCategory::Goal => ProfileLayer::Goals,
            FactCategory::Barrier => ProfileLayer::Barriers,
            FactCategory::Value => ProfileLayer::Values,
        }
    }
}

/// Check-in windows. The invariant `goals < barriers < values` mirrors how
/// quickly each category really changes.
#[derive(Debug, Clone)]
pub struct CheckInConfig {
    /// Validation window for goals.
    pub goals_after: Duration,
    /// Validation window for barriers.
    pub barriers_after: Duration,
    /// Validation window for values.
    pub values_after: Duration,
    /// Sessions without validation that force a check-in regardless.
    pub sessions_without_validation: u32,
}

impl Default for CheckInConfig {
    fn default() -> Self {
        Self {
            goals_after: Duration::from_secs(7 * 24 * 3600),
            barriers_after: Duration::from_secs(14 * 24 * 3600),
            values_after: Duration::from_secs(30 * 24 * 3600),
            sessions_without_validation: 5,
        }
    }
}

impl CheckInConfig {
    fn window(&self, category: FactCategory) -> Duration {
        match category {
            FactCategory::Goal => self.goals_after,
            FactCategory::Barrier => self.barriers_after,
            FactCategory::Value => self.values_after,
        }
    }
}

/// A scheduled check-in question.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInRequest {
    /// Fact category.
    pub category: FactCategory,
    /// The fact being validated.
    pub fact_text: String,
    /// The question to ask the user.
    pub question: String,
}

#[derive(Debug, Clone)]
struct FactState {
    first_seen: DateTime<Utc>,
    last_validated: Option<DateTime<Utc>>,
    stale: bool,
}

type FactKey = (i64, FactCategory, String);

/// Tracks validation recency per fact and schedules check-ins.
pub struct CheckInManager {
    config: CheckInConfig,
    facts: Mutex<HashMap<FactKey, FactState>>,
    sessions_since_validation: Mutex<HashMap<i64, u32>>,
}

impl CheckInManager {
    /// Create a manager.
    pub fn new(config: CheckInConfig) -> Self {
        Self {
            config,
            facts: Mutex::new(HashMap::new()),
            sessions_since_validation: Mutex::new(HashMap::new()),
        }
    }

    /// Count a coach session for the user.
    pub fn increment_session(&self, user_id: i64) {
        *self
            .sessions_since_validation
            .lock()
            .entry(user_id)
            .or_insert(0) += 1;
    }

    /// Find the most overdue fact, if any is due.
    ///
    /// Active profile facts are registered on first sight; a fact is due
    /// when its category window has passed since the last validation (or
    /// first sighting), or when the session budget ran out.
    pub fn should_check_in(
        &self,
        user_id: i64,
        profile: &PersonalityProfile,
    ) -> Option<CheckInRequest> {
        let now = Utc::now();
        let sessions = self
            .sessions_since_validation
            .lock()
            .get(&user_id)
            .copied()
            .unwrap_or(0);
        let session_budget_exceeded = sessions >= self.config.sessions_without_validation;

        let mut facts = self.facts.lock();
        let mut best: Option<(ChronoDuration, CheckInRequest)> = None;

        for category in [FactCategory::Goal, FactCategory::Barrier, FactCategory::Value] {
            for item in profile.layer(category.layer()) {
                if item.is_inactive() {
                    continue;
                }
                let key = (user_id, category, item.key.clone());
                let state = facts.entry(key).or_insert_with(|| FactState {
                    first_seen: now,
                    last_validated: None,
                    stale: false,
                });
                if state.stale {
                    continue;
                }

                let reference = state.last_validated.unwrap_or(state.first_seen);
                let age = now - reference;
                let window = ChronoDuration::from_std(self.config.window(category))
                    .unwrap_or(ChronoDuration::zero());

                let due = age > window || (session_budget_exceeded && state.last_validated.is_none());
                if !due {
                    continue;
                }

                let overdue = age - window;
                if best
                    .as_ref()
                    .map(|(best_overdue, _)| overdue > *best_overdue)
                    .unwrap_or(true)
                {
                    best = Some((
                        overdue,
                        CheckInRequest {
                            category,
                            fact_text: item.key.clone(),
                            question: format_question(category, &item.key),
                        },
                    ));
                }
            }
        }

        best.map(|(_, request)| request)
    }

    /// Record a check-in outcome. A negative outcome marks the fact stale
    /// and flags it for a profile update.
    pub fn record_validation(
        &self,
        user_id: i64,
        category: FactCategory,
        fact_text: &str,
        still_relevant: bool,
    ) {
        let mut facts = self.facts.lock();
        let state = facts
            .entry((user_id, category, fact_text.to_string()))
            .or_insert_with(|| FactState {
                first_seen: Utc::now(),
                last_validated: None,
                stale: false,
            });
        state.last_validated = Some(Utc::now());
        state.stale = !still_relevant;

        self.sessions_since_validation.lock().insert(user_id, 0);

        tracing::info!(
            user_id,
            category = category.as_str(),
            fact = fact_text,
            still_relevant,
            "check-in outcome recorded"
        );
    }

    /// Facts flagged stale by negative outcomes, for the profile updater.
    pub fn stale_facts(&self, user_id: i64) -> Vec<(FactCategory, String)> {
        self.facts
            .lock()
            .iter()
            .filter(|((uid, _, _), state)| *uid == user_id && state.stale)
            .map(|((_, category, fact), _)| (*category, fact.clone()))
            .collect()
    }

    /// Test hook: shift a fact's reference time into the past.
    #[cfg(test)]
    fn age_fact(&self, user_id: i64, category: FactCategory, fact: &str, by: Duration) {
        let mut facts = self.facts.lock();
        if let Some(state) = facts.get_mut(&(user_id, category, fact.to_string())) {
            let delta = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
            state.first_seen = state.first_seen - delta;
            if let Some(validated) = state.last_validated.as_mut() {
                *validated = *validated - delta;
            }
        }
    }
}

fn format_question(category: FactCategory, fact: &str) -> String {
    match category {
        FactCategory::Goal => format!("Кстати, цель «{fact}» всё ещё актуальна для тебя?"),
        FactCategory::Barrier => format!("Скажи, «{fact}» всё ещё мешает тебе?"),
        FactCategory::Value => format!("«{fact}» — это по-прежнему важно для тебя?"),
    }
}
