//! The coach dossier: a cached, AI-summarized view of the user.
//!
//! Derived from the personality profile and recent trait values, generated
//! through the AI router with a strict response template, with a
//! deterministic top-N extractor as the no-model fallback. Cached with a
//! TTL and keyed by a hash of the source data; profile writes invalidate
//! it through [`crate::profile::ProfileWriteListener`].

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ai::{AiRouter, CompletionRequest, RoutingContext, UserTier};
use crate::profile::{
    PersonalityProfile, ProfileError, ProfileLayer, ProfileStore, ProfileWriteListener,
    TraitHistoryStore,
};

/// The dossier handed to the coach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    /// One-paragraph portrait.
    pub who: String,
    /// Highest-priority goals.
    pub top_goals: Vec<String>,
    /// Highest-priority barriers.
    pub top_barriers: Vec<String>,
    /// Behavioral patterns worth naming.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Contradictions between stated facts.
    #[serde(default)]
    pub contradictions: Vec<String>,
    /// Working hypothesis about the user.
    #[serde(default)]
    pub hypothesis: String,
    /// Communication style hints derived from Big-Five values.
    #[serde(default)]
    pub style_hints: BTreeMap<String, String>,
    /// Generation time.
    pub generated_at: DateTime<Utc>,
    /// `total_answers_analyzed` at generation.
    pub answers_count_at_generation: i64,
    /// Hash of the source data, for staleness checks.
    pub raw_data_hash: String,
}

/// Dossier service tuning.
#[derive(Debug, Clone)]
pub struct DossierConfig {
    /// Cache TTL.
    pub ttl: Duration,
    /// How many goals/barriers the fallback extractor keeps.
    pub top_n: usize,
}

impl Default for DossierConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            top_n: 5,
        }
    }
}

/// Produces and caches dossiers.
pub struct DossierService {
    profiles: Arc<dyn ProfileStore>,
    traits: Arc<dyn TraitHistoryStore>,
    router: Arc<AiRouter>,
    cache: moka::future::Cache<i64, Arc<Dossier>>,
    config: DossierConfig,
}

impl DossierService {
    /// Assemble the service.
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        traits: Arc<dyn TraitHistoryStore>,
        router: Arc<AiRouter>,
        config: DossierConfig,
    ) -> Self {
        let cache = moka::future::Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(10_000)
            .build();
        Self {
            profiles,
            traits,
            router,
            cache,
            config,
        }
    }

    /// Get the user's dossier, generating when missing or stale.
    pub async fn get_dossier(
        &self,
        user_id: i64,
        force_regenerate: bool,
    ) -> Result<Arc<Dossier>, ProfileError> {
        let profile = self
            .profiles
            .load(user_id)
            .await?
            .unwrap_or_else(|| PersonalityProfile::empty(user_id));
        let data_hash = profile_hash(&profile);

        if !force_regenerate {
            if let Some(cached) = self.cache.get(&user_id).await {
                if cached.raw_data_hash == data_hash {
                    return Ok(cached);
                }
                // Source data moved on; a stale dossier must not survive.
                self.cache.invalidate(&user_id).await;
            }
        }

        let dossier = Arc::new(self.generate(&profile, data_hash).await);
        self.cache.insert(user_id, dossier.clone()).await;
        Ok(dossier)
    }

    /// Drop the cached dossier.
    pub async fn invalidate(&self, user_id: i64) {
        self.cache.invalidate(&user_id).await;
        tracing::debug!(user_id, "dossier cache invalidated");
    }

    async fn generate(&self, profile: &PersonalityProfile, data_hash: String) -> Dossier {
        let big_five = self.latest_big_five(profile.user_id).await;

        match self.generate_via_ai(profile).await {
            Some(mut dossier) => {
                dossier.generated_at = Utc::now();
                dossier.answers_count_at_generation = profile.total_answers_analyzed;
                dossier.raw_data_hash = data_hash;
                if dossier.style_hints.is_empty() {
                    dossier.style_hints = style_hints(&big_five);
                }
                dossier
            }
            None => self.extract_simple(profile, &big_five, data_hash),
        }
    }

    async fn generate_via_ai(&self, profile: &PersonalityProfile) -> Option<Dossier> {
        let layers_json = serde_json::to_string(&profile.layers).ok()?;
        let request = CompletionRequest::new(format!(
            "Summarize this layered user profile into a coach dossier. Reply \
             with JSON carrying who, top_goals, top_barriers, patterns, \
             contradictions, hypothesis and style_hints:\n{layers_json}"
        ))
        .with_max_tokens(1024);

        let routed = self
            .router
            .complete(
                UserTier::Premium,
                "psychological profile summary for coaching",
                request,
                &RoutingContext::default(),
            )
            .await
            .map_err(|e| {
                tracing::warn!(user_id = profile.user_id, error = %e, "dossier model call failed, using extractor");
                e
            })
            .ok()?;

        serde_json::from_str::<Dossier>(routed.completion.text.trim())
            .map_err(|e| {
                tracing::warn!(user_id = profile.user_id, error = %e, "dossier output unparsable, using extractor");
                e
            })
            .ok()
    }

    /// Deterministic fallback: highest-priority goals and barriers plus a
    /// short portrait synthesized from identity items.
    fn extract_simple(
        &self,
        profile: &PersonalityProfile,
        big_five: &BTreeMap<String, f64>,
        data_hash: String,
    ) -> Dossier {
        let top_items = |layer: ProfileLayer| -> Vec<String> {
            let mut items: Vec<_> = profile
                .layer(layer)
                .iter()
                .filter(|item| !item.is_inactive())
                .collect();
            items.sort_by(|a, b| {
                b.priority
                    .unwrap_or(0.0)
                    .partial_cmp(&a.priority.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            items
                .into_iter()
                .take(self.config.top_n)
                .map(|item| item.key.clone())
                .collect()
        };

        let identity: Vec<String> = profile
            .layer(ProfileLayer::Identity)
            .iter()
            .take(3)
            .map(|item| item.key.clone())
            .collect();
        let who = if identity.is_empty() {
            "Пользователь в начале пути самопознания.".to_string()
        } else {
            identity.join(", ")
        };

        Dossier {
            who,
            top_goals: top_items(ProfileLayer::Goals),
            top_barriers: top_items(ProfileLayer::Barriers),
            patterns: Vec::new(),
            contradictions: Vec::new(),
            hypothesis: String::new(),
            style_hints: style_hints(big_five),
            generated_at: Utc::now(),
            answers_count_at_generation: profile.total_answers_analyzed,
            raw_data_hash: data_hash,
        }
    }

    async fn latest_big_five(&self, user_id: i64) -> BTreeMap<String, f64> {
        let mut values = BTreeMap::new();
        for dimension in [
            "openness",
            "conscientiousness",
            "extraversion",
            "agreeableness",
            "neuroticism",
        ] {
            if let Ok(Some(entry)) = self.traits.latest(user_id, dimension).await {
                values.insert(dimension.to_string(), entry.value);
            }
        }
        values
    }
}

#[async_trait]
impl ProfileWriteListener for DossierService {
    async fn profile_updated(&self, user_id: i64) {
        self.invalidate(user_id).await;
    }
}

/// Stable hash of the profile content a dossier derives from.
fn profile_hash(profile: &PersonalityProfile) -> String {
    let mut hasher = DefaultHasher::new();
    if let Ok(serialized) = serde_json::to_string(&profile.layers) {
        serialized.hash(&mut hasher);
    }
    profile.total_answers_analyzed.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Communication style hints from Big-Five values.
fn style_hints(big_five: &BTreeMap<String, f64>) -> BTreeMap<String, String> {
    let mut hints = BTreeMap::new();
    if let Some(openness) = big_five.get("openness") {
        hints.insert(
            "imagery".into(),
            if *openness >= 0.6 {
                "метафоры и образы работают хорошо".into()
            } else {
                "конкретика и примеры вместо абстракций".into()
            },
        );
    }
    if let Some(conscientiousness) = big_five.get("conscientiousness") {
        hints.insert(
            "structure".into(),
            if *conscientiousness >= 0.6 {
                "пошаговые планы и чек-листы".into()
            } else {
                "короткие гибкие предложения без жёстких планов".into()
            },
        );
    }
    if let Some(neuroticism) = big_five.get("neuroticism") {
        hints.insert(
            "tone".into(),
            if *neuroticism >= 0.6 {
                "мягкий поддерживающий тон, без давления".into()
            } else {
                "прямой тон допустим".into()
            },
        );
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ModelClient, ModelError, RouterConfig};
    use crate::profile::{
        MemoryProfileStore, MemoryTraitHistoryStore, ProfileItem, TraitHistoryEntry,
    };
    use crate::resilience::CircuitBreakerRegistry;

    /// Client that always fails, forcing the deterministic extractor.
    struct DownClient;

    #[async_trait]
    impl ModelClient for DownClient {
        async fn complete(
            &self,
            _model: &str,
            _request: &CompletionRequest,
        ) -> Result<crate::ai::Completion, ModelError> {
            Err(ModelError::Status {
                code: 401,
                message: "unauthorized".into(),
            })
        }
    }

    /// Client that returns a fixed dossier JSON.
    struct FixedClient(String);

    #[async_trait]
    impl ModelClient for FixedClient {
        async fn complete(
            &self,
            _model: &str,
            _request: &CompletionRequest,
        ) -> Result<crate::ai::Completion, ModelError> {
            Ok(crate::ai::Completion {
                text: self.0.clone(),
                input_tokens: None,
                output_tokens: None,
            })
        }
    }

    async fn seeded_profiles() -> Arc<MemoryProfileStore> {
        let profiles = Arc::new(MemoryProfileStore::new());
        let mut profile = PersonalityProfile::empty(42);
        profile.layers.insert(
            ProfileLayer::Goals,
            vec![
                ProfileItem::new("найти работу").with_priority(3.0),
                ProfileItem::new("выучить испанский").with_priority(1.0),
                ProfileItem::new("старое, неактуальное")
                    .with_priority(5.0)
                    .with_status("inactive"),
            ],
        );
        profile.layers.insert(
            ProfileLayer::Barriers,
            vec![ProfileItem::new("страх перемен").with_priority(2.0)],
        );
        profile.layers.insert(
            ProfileLayer::Identity,
            vec![ProfileItem::new("дизайнер, 32 года")],
        );
        profile.total_answers_analyzed = 7;
        profiles.save(&profile).await.unwrap();
        profiles
    }

    fn service(profiles: Arc<MemoryProfileStore>, client: Arc<dyn ModelClient>) -> DossierService {
        DossierService::new(
            profiles,
            Arc::new(MemoryTraitHistoryStore::new()),
            Arc::new(AiRouter::new(
                RouterConfig::default(),
                client,
                Arc::new(CircuitBreakerRegistry::default()),
            )),
            DossierConfig::default(),
        )
    }

    #[tokio::test]
    async fn fallback_extractor_picks_top_priority_active_items() {
        let service = service(seeded_profiles().await, Arc::new(DownClient));

        let dossier = service.get_dossier(42, false).await.unwrap();
        assert_eq!(dossier.top_goals[0], "найти работу");
        assert!(!dossier.top_goals.contains(&"старое, неактуальное".to_string()));
        assert_eq!(dossier.top_barriers, vec!["страх перемен".to_string()]);
        assert!(dossier.who.contains("дизайнер"));
        assert_eq!(dossier.answers_count_at_generation, 7);
    }

    #[tokio::test]
    async fn ai_dossier_is_parsed_when_available() {
        let json = serde_json::json!({
            "who": "Целеустремлённый дизайнер в поиске нового пути",
            "top_goals": ["найти работу"],
            "top_barriers": ["страх перемен"],
            "patterns": ["откладывает решения"],
            "contradictions": [],
            "hypothesis": "ищет стабильность",
            "generated_at": "2026-01-01T00:00:00Z",
            "answers_count_at_generation": 0,
            "raw_data_hash": ""
        })
        .to_string();
        let service = service(seeded_profiles().await, Arc::new(FixedClient(json)));

        let dossier = service.get_dossier(42, false).await.unwrap();
        assert!(dossier.who.contains("Целеустремлённый"));
        assert_eq!(dossier.patterns, vec!["откладывает решения".to_string()]);
        assert_eq!(dossier.answers_count_at_generation, 7);
    }

    #[tokio::test]
    async fn cache_hits_until_invalidated() {
        let profiles = seeded_profiles().await;
        let service = service(profiles.clone(), Arc::new(DownClient));

        let first = service.get_dossier(42, false).await.unwrap();
        let second = service.get_dossier(42, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        service.invalidate(42).await;
        let third = service.get_dossier(42, false).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn profile_change_busts_the_cache_by_hash() {
        let profiles = seeded_profiles().await;
        let service = service(profiles.clone(), Arc::new(DownClient));

        let first = service.get_dossier(42, false).await.unwrap();

        let mut profile = profiles.load(42).await.unwrap().unwrap();
        profile
            .layers
            .entry(ProfileLayer::Goals)
            .or_default()
            .push(ProfileItem::new("новая цель").with_priority(4.0));
        profile.total_answers_analyzed += 1;
        profiles.save(&profile).await.unwrap();

        let second = service.get_dossier(42, false).await.unwrap();
        assert_ne!(first.raw_data_hash, second.raw_data_hash);
        assert!(second.top_goals.contains(&"новая цель".to_string()));
    }

    #[tokio::test]
    async fn style_hints_follow_big_five() {
        let profiles = seeded_profiles().await;
        let traits = Arc::new(MemoryTraitHistoryStore::new());
        traits
            .append(&TraitHistoryEntry {
                user_id: 42,
                trait_name: "openness".into(),
                value: 0.8,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        traits
            .append(&TraitHistoryEntry {
                user_id: 42,
                trait_name: "neuroticism".into(),
                value: 0.7,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();

        let service = DossierService::new(
            profiles,
            traits,
            Arc::new(AiRouter::new(
                RouterConfig::default(),
                Arc::new(DownClient),
                Arc::new(CircuitBreakerRegistry::default()),
            )),
            DossierConfig::default(),
        );

        let dossier = service.get_dossier(42, false).await.unwrap();
        assert!(dossier.style_hints["imagery"].contains("метафоры"));
        assert!(dossier.style_hints["tone"].contains("мягкий"));
    }
}
