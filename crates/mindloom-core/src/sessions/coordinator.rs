//! Session/question coordination.
//!
//! One active session per user; each answer updates progress and asks the
//! external smart-mix selector for the next question. The coordinator owns
//! block gating (foundation before exploration, integration last) and the
//! resistance pivot; the selector owns everything else about question
//! choice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::events::{catalog as events, EventBus};

use super::store::{FlaggedQuestions, SessionError, SessionStore};
use super::types::{BlockKind, Cluster, Question, Session, SessionStatus};

/// Read-only question catalog collaborator.
#[async_trait]
pub trait QuestionCatalog: Send + Sync {
    /// One question by id.
    async fn get_question(&self, id: &str) -> Option<Question>;

    /// One cluster by id.
    async fn get_cluster(&self, id: &str) -> Option<Cluster>;

    /// Every cluster of the onboarding program, in catalog order.
    async fn program_clusters(&self) -> Vec<Cluster>;
}

/// Everything the external selector sees for one decision.
#[derive(Debug, Clone)]
pub struct SelectorState {
    /// The session being advanced.
    pub session: Session,
    /// Fatigue in [0, 1].
    pub fatigue: f64,
    /// Question ids already answered by this user, across all sessions.
    pub answered_ids: HashSet<String>,
    /// Ids that must not be offered (flagged, gated, pivoted away from).
    pub excluded_ids: HashSet<String>,
    /// Set when the last answer read as resistance.
    pub resistance: bool,
}

/// A selector decision.
#[derive(Debug, Clone)]
pub struct SelectedQuestion {
    /// The question to ask next.
    pub question: Question,
    /// Strategy tag recorded on the session, e.g. `depth_first`.
    pub strategy: String,
}

/// The smart-mix selector collaborator.
#[async_trait]
pub trait QuestionSelector: Send + Sync {
    /// Pick the next question, or `None` when the program is exhausted.
    async fn smart_next(&self, state: &SelectorState) -> Option<SelectedQuestion>;
}

/// Outcome of handling one answer.
#[derive(Debug)]
pub enum AnswerOutcome {
    /// The next question was selected and published.
    QuestionSelected {
        /// The question.
        question: Question,
        /// Selector strategy tag.
        strategy: String,
    },
    /// The program is exhausted; the session completed.
    SessionCompleted {
        /// Final session state.
        session: Session,
    },
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// ACTIVE sessions idle past this are timed out by the sweep.
    pub session_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Resistance markers: short refusals and explicit skips.
const RESISTANCE_MARKERS: &[&str] = &[
    "skip",
    "пропусти",
    "пропустить",
    "не хочу",
    "не буду",
    "дальше",
    "next",
];

/// The session/question coordinator.
pub struct SessionCoordinator {
    store: Arc<dyn SessionStore>,
    catalog: Arc<dyn QuestionCatalog>,
    selector: Arc<dyn QuestionSelector>,
    flags: Arc<dyn FlaggedQuestions>,
    bus: Arc<EventBus>,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    /// Assemble a coordinator from its collaborators.
    pub fn new(
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn QuestionCatalog>,
        selector: Arc<dyn QuestionSelector>,
        flags: Arc<dyn FlaggedQuestions>,
        bus: Arc<EventBus>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            selector,
            flags,
            bus,
            config,
        }
    }

    /// Handle a user asking to begin onboarding: announce it and start the
    /// session.
    pub async fn initiate_onboarding(&self, user_id: i64) -> Result<Session, SessionError> {
        let _ = self
            .bus
            .publish(
                events::USER_ONBOARDING_INITIATED,
                serde_json::json!({"user_id": user_id}),
                None,
            )
            .await;
        self.start_session(user_id).await
    }

    /// Start a session, abandoning any prior ACTIVE one, and select the
    /// first question.
    pub async fn start_session(&self, user_id: i64) -> Result<Session, SessionError> {
        let abandoned = self.store.abandon_active(user_id).await?;
        if abandoned > 0 {
            tracing::info!(user_id, abandoned, "prior active sessions abandoned");
        }

        let mut session = self.store.create_session(user_id).await?;

        let _ = self
            .bus
            .publish(
                events::SESSION_CREATED,
                serde_json::json!({
                    "session_id": session.id,
                    "user_id": user_id,
                    "started_at": session.started_at,
                }),
                None,
            )
            .await;
        let _ = self
            .bus
            .publish(
                events::USER_SESSION_STARTED,
                serde_json::json!({"session_id": session.id, "user_id": user_id}),
                None,
            )
            .await;

        if let Some(selected) = self.select_next(&session, false).await? {
            self.apply_selection(&mut session, &selected, None).await?;
        }
        Ok(session)
    }

    /// Record one answer and advance the session.
    pub async fn handle_answer(
        &self,
        user_id: i64,
        question_id: &str,
        answer_text: &str,
        trace_id: Option<String>,
    ) -> Result<AnswerOutcome, SessionError> {
        let mut session = self
            .store
            .get_active(user_id)
            .await?
            .ok_or(SessionError::NoActiveSession(user_id))?;

        self.store
            .record_answer(session.id, user_id, question_id, answer_text)
            .await?;

        session.questions_answered += 1;
        if let Some(question) = self.catalog.get_question(question_id).await {
            session.domains_covered.insert(question.domain.clone());
            if question.is_heavy() {
                session.heavy_count += 1;
            }
        }

        let resistance = detect_resistance(answer_text);
        if resistance {
            tracing::info!(user_id, session_id = session.id, "resistance marker detected");
        }

        match self.select_next(&session, resistance).await? {
            Some(selected) => {
                self.apply_selection(&mut session, &selected, trace_id).await?;
                Ok(AnswerOutcome::QuestionSelected {
                    question: selected.question,
                    strategy: selected.strategy,
                })
            }
            None => {
                session.status = SessionStatus::Completed;
                session.completed_at = Some(chrono::Utc::now());
                session.current_question = None;
                self.store.update(&session).await?;

                let _ = self
                    .bus
                    .publish(
                        events::SESSION_COMPLETED,
                        serde_json::json!({
                            "session_id": session.id,
                            "user_id": user_id,
                            "questions_answered": session.questions_answered,
                            "heavy_count": session.heavy_count,
                            "domains_covered": session.domains_covered,
                        }),
                        None,
                    )
                    .await;
                Ok(AnswerOutcome::SessionCompleted { session })
            }
        }
    }

    /// Time out stale ACTIVE sessions. Returns how many were swept.
    pub async fn sweep_timeouts(&self) -> Result<u64, SessionError> {
        let stale = self.store.stale_active(self.config.session_ttl).await?;
        let mut swept = 0;
        for mut session in stale {
            session.status = SessionStatus::Abandoned;
            self.store.update(&session).await?;
            swept += 1;

            let _ = self
                .bus
                .publish(
                    events::SESSION_TIMED_OUT,
                    serde_json::json!({
                        "session_id": session.id,
                        "user_id": session.user_id,
                    }),
                    None,
                )
                .await;
        }
        Ok(swept)
    }

    async fn apply_selection(
        &self,
        session: &mut Session,
        selected: &SelectedQuestion,
        trace_id: Option<String>,
    ) -> Result<(), SessionError> {
        session.questions_asked += 1;
        session.current_question = Some(selected.question.id.clone());
        session.last_strategy = Some(selected.strategy.clone());
        self.store.update(session).await?;

        let _ = self
            .bus
            .publish(
                events::QUESTION_SELECTED,
                serde_json::json!({
                    "session_id": session.id,
                    "question_id": selected.question.id,
                    "context": {
                        "domain": selected.question.domain,
                        "strategy": selected.strategy,
                    },
                }),
                trace_id,
            )
            .await;
        Ok(())
    }

    /// Build the selector state (gating + flags + resistance pivot) and ask
    /// the selector.
    async fn select_next(
        &self,
        session: &Session,
        resistance: bool,
    ) -> Result<Option<SelectedQuestion>, SessionError> {
        let answered = self.store.answered_question_ids(session.user_id).await?;
        let flagged = self.flags.flagged_ids().await?;
        let clusters = self.catalog.program_clusters().await;

        let mut excluded: HashSet<String> = flagged;
        excluded.extend(self.gated_question_ids(&clusters, &answered, session, resistance));

        let state = SelectorState {
            session: session.clone(),
            fatigue: session.fatigue(),
            answered_ids: answered,
            excluded_ids: excluded,
            resistance,
        };
        Ok(self.selector.smart_next(&state).await)
    }

    /// Question ids the gating rules currently forbid.
    ///
    /// Foundation blocks must complete before any exploration block;
    /// integration blocks open only after every exploration block is
    /// complete. A resistance pivot excludes the rest of the current
    /// exploration cluster so the selector offers an alternate one;
    /// foundation and integration are never skipped this way.
    fn gated_question_ids(
        &self,
        clusters: &[Cluster],
        answered: &HashSet<String>,
        session: &Session,
        resistance: bool,
    ) -> HashSet<String> {
        let block_complete = |kind: BlockKind| {
            clusters
                .iter()
                .filter(|c| c.block == kind)
                .all(|c| c.question_ids.iter().all(|q| answered.contains(q)))
        };

        let foundation_done = block_complete(BlockKind::Foundation);
        let exploration_done = block_complete(BlockKind::Exploration);

        let mut gated = HashSet::new();
        for cluster in clusters {
            let blocked = match cluster.block {
                BlockKind::Foundation => false,
                BlockKind::Exploration => !foundation_done,
                BlockKind::Integration => !exploration_done,
            };
            if blocked {
                gated.extend(cluster.question_ids.iter().cloned());
            }
        }

        if resistance {
            if let Some(current_id) = &session.current_question {
                let current_cluster = clusters
                    .iter()
                    .find(|c| c.question_ids.contains(current_id));
                if let Some(cluster) = current_cluster {
                    if cluster.block == BlockKind::Exploration {
                        gated.extend(cluster.question_ids.iter().cloned());
                    }
                }
            }
        }

        gated
    }
}

fn detect_resistance(answer_text: &str) -> bool {
    let trimmed = answer_text.trim().to_lowercase();
    if trimmed.chars().count() <= 2 {
        return true;
    }
    RESISTANCE_MARKERS
        .iter()
        .any(|marker| trimmed == *marker || trimmed.starts_with(&format!("{marker} ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryTransport;
    use crate::sessions::store::{MemoryFlaggedQuestions, MemorySessionStore};

    /// Catalog with one cluster per block kind.
    struct TestCatalog {
        clusters: Vec<Cluster>,
        questions: Vec<Question>,
    }

    impl TestCatalog {
        fn new() -> Self {
            let question = |id: &str, cluster: &str, domain: &str, energy: &str| Question {
                id: id.into(),
                text: format!("question {id}"),
                domain: domain.into(),
                depth_level: 2,
                energy: energy.into(),
                cluster_id: cluster.into(),
            };
            Self {
                clusters: vec![
                    Cluster {
                        id: "found_1".into(),
                        block: BlockKind::Foundation,
                        question_ids: vec!["q_001".into(), "q_002".into()],
                    },
                    Cluster {
                        id: "expl_1".into(),
                        block: BlockKind::Exploration,
                        question_ids: vec!["q_101".into()],
                    },
                    Cluster {
                        id: "expl_2".into(),
                        block: BlockKind::Exploration,
                        question_ids: vec!["q_201".into()],
                    },
                    Cluster {
                        id: "integ_1".into(),
                        block: BlockKind::Integration,
                        question_ids: vec!["q_301".into()],
                    },
                ],
                questions: vec![
                    question("q_001", "found_1", "identity", "light"),
                    question("q_002", "found_1", "values", "heavy"),
                    question("q_101", "expl_1", "career", "light"),
                    question("q_201", "expl_2", "relationships", "light"),
                    question("q_301", "integ_1", "integration", "heavy"),
                ],
            }
        }
    }

    #[async_trait]
    impl QuestionCatalog for TestCatalog {
        async fn get_question(&self, id: &str) -> Option<Question> {
            self.questions.iter().find(|q| q.id == id).cloned()
        }
        async fn get_cluster(&self, id: &str) -> Option<Cluster> {
            self.clusters.iter().find(|c| c.id == id).cloned()
        }
        async fn program_clusters(&self) -> Vec<Cluster> {
            self.clusters.clone()
        }
    }

    /// Selector that walks the catalog in order, honoring exclusions.
    struct OrderedSelector {
        catalog: Arc<TestCatalog>,
    }

    #[async_trait]
    impl QuestionSelector for OrderedSelector {
        async fn smart_next(&self, state: &SelectorState) -> Option<SelectedQuestion> {
            self.catalog
                .questions
                .iter()
                .find(|q| {
                    !state.answered_ids.contains(&q.id) && !state.excluded_ids.contains(&q.id)
                })
                .map(|q| SelectedQuestion {
                    question: q.clone(),
                    strategy: if state.resistance {
                        "alternate_exploration".into()
                    } else {
                        "catalog_order".into()
                    },
                })
        }
    }

    struct Fixture {
        store: Arc<MemorySessionStore>,
        flags: Arc<MemoryFlaggedQuestions>,
        coordinator: SessionCoordinator,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(TestCatalog::new());
        let store = Arc::new(MemorySessionStore::new());
        let flags = Arc::new(MemoryFlaggedQuestions::new());
        let coordinator = SessionCoordinator::new(
            store.clone(),
            catalog.clone(),
            Arc::new(OrderedSelector { catalog }),
            flags.clone(),
            Arc::new(EventBus::new(Arc::new(MemoryTransport::new()))),
            CoordinatorConfig::default(),
        );
        Fixture {
            store,
            flags,
            coordinator,
        }
    }

    #[tokio::test]
    async fn initiating_onboarding_starts_a_session() {
        let fx = fixture();
        let session = fx.coordinator.initiate_onboarding(42).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.current_question.is_some());
    }

    #[tokio::test]
    async fn starting_a_session_abandons_the_prior_one() {
        let fx = fixture();
        let first = fx.coordinator.start_session(42).await.unwrap();
        let second = fx.coordinator.start_session(42).await.unwrap();

        assert_ne!(first.id, second.id);
        let active = fx.store.get_active(42).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn first_question_comes_from_foundation() {
        let fx = fixture();
        let session = fx.coordinator.start_session(42).await.unwrap();
        assert_eq!(session.current_question.as_deref(), Some("q_001"));
        assert_eq!(session.questions_asked, 1);
    }

    #[tokio::test]
    async fn exploration_gated_until_foundation_done() {
        let fx = fixture();
        fx.coordinator.start_session(42).await.unwrap();

        // Answer q_001: next must still be foundation (q_002), not q_101.
        let outcome = fx
            .coordinator
            .handle_answer(42, "q_001", "I am a designer", None)
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::QuestionSelected { question, .. } => {
                assert_eq!(question.id, "q_002");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // Foundation complete: exploration opens.
        let outcome = fx
            .coordinator
            .handle_answer(42, "q_002", "honesty matters to me", None)
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::QuestionSelected { question, .. } => {
                assert_eq!(question.id, "q_101");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn integration_opens_after_all_exploration() {
        let fx = fixture();
        fx.coordinator.start_session(42).await.unwrap();
        for (q, a) in [
            ("q_001", "answer one"),
            ("q_002", "answer two"),
            ("q_101", "career answer"),
        ] {
            fx.coordinator.handle_answer(42, q, a, None).await.unwrap();
        }

        // One exploration cluster remains, integration still gated.
        let outcome = fx
            .coordinator
            .handle_answer(42, "q_201", "relationship answer", None)
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::QuestionSelected { question, .. } => {
                assert_eq!(question.id, "q_301");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finishing_the_program_completes_the_session() {
        let fx = fixture();
        fx.coordinator.start_session(42).await.unwrap();
        for (q, a) in [
            ("q_001", "a"),
            ("q_002", "b"),
            ("q_101", "c"),
            ("q_201", "d"),
        ] {
            fx.coordinator.handle_answer(42, q, a, None).await.unwrap();
        }

        let outcome = fx
            .coordinator
            .handle_answer(42, "q_301", "it all connects", None)
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::SessionCompleted { session } => {
                assert_eq!(session.status, SessionStatus::Completed);
                assert_eq!(session.questions_answered, 5);
                assert!(session.completed_at.is_some());
                assert!(session.domains_covered.contains("career"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn flagged_questions_are_never_offered() {
        let fx = fixture();
        fx.flags.flag("q_001");
        let session = fx.coordinator.start_session(42).await.unwrap();
        assert_eq!(session.current_question.as_deref(), Some("q_002"));
    }

    #[tokio::test]
    async fn resistance_pivots_to_alternate_exploration() {
        let fx = fixture();
        fx.coordinator.start_session(42).await.unwrap();
        fx.coordinator
            .handle_answer(42, "q_001", "long answer", None)
            .await
            .unwrap();
        fx.coordinator
            .handle_answer(42, "q_002", "another long answer", None)
            .await
            .unwrap();
        // Now on q_101 (expl_1). A "skip" pivots to expl_2.
        let outcome = fx
            .coordinator
            .handle_answer(42, "q_101", "skip", None)
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::QuestionSelected { question, strategy } => {
                assert_eq!(question.id, "q_201");
                assert_eq!(strategy, "alternate_exploration");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resistance_never_skips_foundation() {
        let fx = fixture();
        fx.coordinator.start_session(42).await.unwrap();
        // Resisting on a foundation question still yields foundation next.
        let outcome = fx
            .coordinator
            .handle_answer(42, "q_001", "не хочу", None)
            .await
            .unwrap();
        match outcome {
            AnswerOutcome::QuestionSelected { question, .. } => {
                assert_eq!(question.id, "q_002");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_out_sessions_are_swept() {
        let fx = fixture();
        let session = fx.coordinator.start_session(42).await.unwrap();
        fx.store
            .age_session(session.id, Duration::from_secs(48 * 3600));

        let swept = fx.coordinator.sweep_timeouts().await.unwrap();
        assert_eq!(swept, 1);
        assert!(fx.store.get_active(42).await.unwrap().is_none());
    }

    #[test]
    fn resistance_markers() {
        assert!(detect_resistance("skip"));
        assert!(detect_resistance("не хочу"));
        assert!(detect_resistance("ok"));
        assert!(!detect_resistance("I would like to talk about my career"));
    }
}
