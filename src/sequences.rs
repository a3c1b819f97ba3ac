//! Sequence cache: remembers ordered action sequences that succeeded for a
//! `(domain, step-keywords)` pair and replays them to bypass the decision
//! LLM entirely.
//!
//! Reinforcement rules: new sequences start at confidence 0.6, +0.1 per
//! success (capped at 1.0), -0.2 per failed replay (floor 0.1). A new
//! successful run replaces the stored actions only when it is strictly
//! shorter.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::store::{
    ActionSequence, SequenceAction, StoreContext, SEQUENCE_CONFIDENCE_FLOOR,
    SEQUENCE_CONFIDENCE_START, SEQUENCE_FAILURE_PENALTY, SEQUENCE_SUCCESS_BONUS,
};

/// Minimum confidence before a cached sequence fires.
pub const MIN_REPLAY_CONFIDENCE: f64 = 0.7;
/// Minimum keyword similarity for a match.
pub const MIN_KEYWORD_SIMILARITY: f64 = 0.3;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "of", "on", "or", "that", "the", "then", "this", "to", "with", "verify", "check", "test",
    "page", "step",
];

/// Lower-cased keywords with stop words and punctuation stripped.
pub fn extract_keywords(title: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in title.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() < 2 || STOP_WORDS.contains(&cleaned.as_str()) {
            continue;
        }
        if !keywords.contains(&cleaned) {
            keywords.push(cleaned);
        }
    }
    keywords
}

/// Host of the URL, `www.` stripped; the raw input when it does not parse.
pub fn normalise_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|host| host.trim_start_matches("www.").to_string())
        .unwrap_or_else(|| url.trim().to_lowercase())
}

pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

pub struct SequenceCache {
    store: Arc<StoreContext>,
}

impl SequenceCache {
    pub fn new(store: Arc<StoreContext>) -> Self {
        Self { store }
    }

    /// Best cached sequence for this step, or none. Candidates need
    /// keyword similarity >= 0.3 and confidence >= `min_confidence`;
    /// ranking is `0.6 * similarity + 0.4 * confidence`.
    pub async fn find(
        &self,
        step_title: &str,
        url: &str,
        min_confidence: f64,
    ) -> anyhow::Result<Option<ActionSequence>> {
        let domain = normalise_domain(url);
        let keywords = extract_keywords(step_title);

        let candidates = self
            .store
            .sequences
            .list(|seq| seq.url_domain == domain && seq.confidence >= min_confidence)
            .await?;

        let best = candidates
            .into_iter()
            .filter_map(|seq| {
                let similarity = jaccard(&seq.step_keywords, &keywords);
                if similarity >= MIN_KEYWORD_SIMILARITY {
                    Some((0.6 * similarity + 0.4 * seq.confidence, seq))
                } else {
                    None
                }
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((score, seq)) = best {
            debug!(
                sequence = %seq.id,
                score,
                confidence = seq.confidence,
                "sequence cache hit"
            );
            return Ok(Some(seq));
        }
        Ok(None)
    }

    /// Record a successful step. Reinforces an existing matching sequence
    /// or creates a new one at the starting confidence.
    pub async fn record_success(
        &self,
        step_title: &str,
        url: &str,
        actions: Vec<SequenceAction>,
        source_run_id: &str,
        requires_credentials: bool,
    ) -> anyhow::Result<ActionSequence> {
        anyhow::ensure!(!actions.is_empty(), "cannot record an empty sequence");
        let domain = normalise_domain(url);
        let keywords = extract_keywords(step_title);

        let existing = self
            .store
            .sequences
            .list(|seq| {
                seq.url_domain == domain
                    && jaccard(&seq.step_keywords, &keywords) >= MIN_KEYWORD_SIMILARITY
            })
            .await?
            .into_iter()
            .max_by(|a, b| {
                jaccard(&a.step_keywords, &keywords)
                    .partial_cmp(&jaccard(&b.step_keywords, &keywords))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        if let Some(found) = existing {
            let replace_actions = actions.len() < found.actions.len();
            let updated = self
                .store
                .sequences
                .update_with(&found.id, move |seq| {
                    seq.success_count += 1;
                    seq.confidence = (seq.confidence + SEQUENCE_SUCCESS_BONUS).min(1.0);
                    seq.last_used_at = Some(Utc::now());
                    // only a strictly shorter successful run is more
                    // efficient than what we already have
                    if replace_actions {
                        seq.actions = actions;
                    }
                    Ok(())
                })
                .await?;
            info!(
                sequence = %updated.id,
                confidence = updated.confidence,
                replaced = replace_actions,
                "reinforced action sequence"
            );
            return Ok(updated);
        }

        let sequence = ActionSequence {
            id: crate::store::new_id(),
            url_domain: domain,
            step_keywords: keywords,
            step_title: step_title.to_string(),
            actions,
            success_count: 1,
            failure_count: 0,
            confidence: SEQUENCE_CONFIDENCE_START,
            requires_credentials,
            source_run_id: source_run_id.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        };
        let created = self.store.sequences.create(sequence).await?;
        info!(sequence = %created.id, "recorded new action sequence");
        Ok(created)
    }

    /// A replay failed: confidence drops, floor 0.1.
    pub async fn record_failure(&self, sequence_id: &str) -> anyhow::Result<ActionSequence> {
        let updated = self
            .store
            .sequences
            .update_with(sequence_id, |seq| {
                seq.failure_count += 1;
                seq.confidence =
                    (seq.confidence - SEQUENCE_FAILURE_PENALTY).max(SEQUENCE_CONFIDENCE_FLOOR);
                Ok(())
            })
            .await?;
        info!(
            sequence = %updated.id,
            confidence = updated.confidence,
            "sequence replay failed; confidence reduced"
        );
        Ok(updated)
    }

    pub async fn mark_used(&self, sequence_id: &str) -> anyhow::Result<()> {
        self.store
            .sequences
            .update_with(sequence_id, |seq| {
                seq.last_used_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ActionType;

    fn temp_store() -> Arc<StoreContext> {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        Arc::new(StoreContext::open(dir).unwrap())
    }

    fn login_actions(n: usize) -> Vec<SequenceAction> {
        (0..n)
            .map(|i| SequenceAction {
                kind: ActionType::FillInput,
                selector: Some(format!("#field-{i}")),
                value_template: Some("${username}".to_string()),
                inputs: serde_json::Value::Null,
                rationale: "enter credentials".to_string(),
            })
            .collect()
    }

    #[test]
    fn keywords_strip_stop_words_and_punctuation() {
        let keywords = extract_keywords("Login with valid credentials!");
        assert_eq!(keywords, vec!["login", "valid", "credentials"]);
    }

    #[test]
    fn domains_are_normalised() {
        assert_eq!(normalise_domain("https://www.saucedemo.com/inventory"), "saucedemo.com");
        assert_eq!(normalise_domain("https://shop.example.org"), "shop.example.org");
    }

    #[tokio::test]
    async fn record_then_find_matches_similar_titles() {
        let cache = SequenceCache::new(temp_store());
        cache
            .record_success(
                "Login with valid credentials",
                "https://www.saucedemo.com",
                login_actions(3),
                "run-1",
                true,
            )
            .await
            .unwrap();

        // starting confidence 0.6 is below the replay threshold
        assert!(cache
            .find("Login with valid credentials", "https://saucedemo.com", MIN_REPLAY_CONFIDENCE)
            .await
            .unwrap()
            .is_none());

        // one reinforcement lifts it to 0.7
        cache
            .record_success(
                "Login with valid credentials",
                "https://www.saucedemo.com",
                login_actions(3),
                "run-2",
                true,
            )
            .await
            .unwrap();

        let found = cache
            .find("Login using valid credentials", "https://saucedemo.com", MIN_REPLAY_CONFIDENCE)
            .await
            .unwrap()
            .expect("sequence should match");
        assert_eq!(found.success_count, 2);
        assert!((found.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn shorter_successful_run_replaces_actions() {
        let cache = SequenceCache::new(temp_store());
        let first = cache
            .record_success("Login flow", "https://a.com", login_actions(4), "run-1", true)
            .await
            .unwrap();
        assert_eq!(first.actions.len(), 4);

        let reinforced = cache
            .record_success("Login flow", "https://a.com", login_actions(2), "run-2", true)
            .await
            .unwrap();
        assert_eq!(reinforced.actions.len(), 2);
        assert_eq!(reinforced.success_count, 2);

        // an equally long run does not replace
        let again = cache
            .record_success("Login flow", "https://a.com", login_actions(2), "run-3", true)
            .await
            .unwrap();
        assert_eq!(again.actions.len(), 2);
        assert_eq!(again.success_count, 3);
    }

    #[tokio::test]
    async fn failures_reduce_confidence_to_the_floor() {
        let cache = SequenceCache::new(temp_store());
        let seq = cache
            .record_success("Login flow", "https://a.com", login_actions(2), "run-1", true)
            .await
            .unwrap();

        let mut confidence = seq.confidence;
        for _ in 0..5 {
            confidence = cache.record_failure(&seq.id).await.unwrap().confidence;
        }
        assert!((confidence - SEQUENCE_CONFIDENCE_FLOOR).abs() < 1e-9);
    }

    #[tokio::test]
    async fn different_domains_never_match() {
        let cache = SequenceCache::new(temp_store());
        cache
            .record_success("Login flow", "https://a.com", login_actions(2), "run-1", true)
            .await
            .unwrap();
        assert!(cache
            .find("Login flow", "https://b.com", 0.1)
            .await
            .unwrap()
            .is_none());
    }
}
