use std::sync::{Arc, RwLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    config::{LogicOperator, RelevanceConfig},
    domain::Message,
};

/// Result of evaluating one piece of text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterOutcome {
    pub is_relevant: bool,
    pub score: f64,
    /// Matched keywords first, then matched pattern strings.
    pub matched: Vec<String>,
}

#[derive(Debug)]
struct Criteria {
    /// Trimmed, non-empty keywords; the ones that can match.
    keywords: Vec<String>,
    /// Every configured keyword, blank or not; counts toward the score.
    keyword_count: usize,
    /// Lowercased copies used for matching.
    keywords_lc: Vec<String>,
    /// Every configured pattern, compiled or not; counts toward the score.
    pattern_count: usize,
    compiled: Vec<(String, Regex)>,
    logic: LogicOperator,
}

impl Criteria {
    fn build(cfg: &RelevanceConfig) -> Self {
        let keywords: Vec<String> = cfg
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        let keywords_lc = keywords.iter().map(|k| k.to_lowercase()).collect();

        let mut compiled = Vec::with_capacity(cfg.regex_patterns.len());
        for p in &cfg.regex_patterns {
            match Regex::new(&format!("(?i){p}")) {
                Ok(re) => compiled.push((p.clone(), re)),
                Err(e) => warn!(pattern = %p, error = %e, "invalid regex pattern, skipping"),
            }
        }

        Self {
            keywords,
            keyword_count: cfg.keywords.len(),
            keywords_lc,
            pattern_count: cfg.regex_patterns.len(),
            compiled,
            logic: cfg.logic,
        }
    }

    fn total(&self) -> usize {
        self.keyword_count + self.pattern_count
    }
}

/// Keyword / regex relevance filter with atomic reconfiguration.
#[derive(Debug)]
pub struct RelevanceFilter {
    criteria: RwLock<Arc<Criteria>>,
}

impl RelevanceFilter {
    pub fn new(cfg: &RelevanceConfig) -> Self {
        let c = Criteria::build(cfg);
        info!(
            keywords = c.keywords.len(),
            patterns = c.compiled.len(),
            logic = %c.logic,
            "relevance filter ready"
        );
        Self {
            criteria: RwLock::new(Arc::new(c)),
        }
    }

    /// Swap in new criteria. Evaluations already running keep the old set.
    pub fn update_config(&self, cfg: &RelevanceConfig) {
        let c = Arc::new(Criteria::build(cfg));
        info!(
            keywords = c.keywords.len(),
            patterns = c.compiled.len(),
            logic = %c.logic,
            "relevance filter updated"
        );
        *self.criteria.write().unwrap_or_else(|e| e.into_inner()) = c;
    }

    fn snapshot(&self) -> Arc<Criteria> {
        self.criteria
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn evaluate(&self, text: &str) -> FilterOutcome {
        if text.trim().is_empty() {
            return FilterOutcome::default();
        }

        let c = self.snapshot();
        // Nothing configured: everything passes.
        if c.total() == 0 {
            return FilterOutcome {
                is_relevant: true,
                score: 0.0,
                matched: Vec::new(),
            };
        }

        let lc = text.to_lowercase();
        let mut matched: Vec<String> = c
            .keywords
            .iter()
            .zip(&c.keywords_lc)
            .filter(|(_, k)| lc.contains(k.as_str()))
            .map(|(orig, _)| orig.clone())
            .collect();
        let keyword_hits = matched.len();

        matched.extend(
            c.compiled
                .iter()
                .filter(|(_, re)| re.is_match(text))
                .map(|(p, _)| p.clone()),
        );
        let pattern_hits = matched.len() - keyword_hits;

        let is_relevant = match c.logic {
            // Each configured criteria type needs at least one hit.
            LogicOperator::And => {
                !matched.is_empty()
                    && (c.keywords.is_empty() || keyword_hits > 0)
                    && (c.pattern_count == 0 || pattern_hits > 0)
            }
            LogicOperator::Or => !matched.is_empty(),
        };
        let score = matched.len() as f64 / c.total() as f64;

        FilterOutcome {
            is_relevant,
            score,
            matched,
        }
    }

    pub fn is_relevant(&self, msg: &Message) -> bool {
        self.evaluate(&msg.searchable_text()).is_relevant
    }

    /// Fill `relevance_score` / `matched_criteria` and report relevance.
    pub fn apply(&self, msg: &mut Message) -> bool {
        let out = self.evaluate(&msg.searchable_text());
        msg.relevance_score = out.score;
        msg.matched_criteria = out.matched;
        if out.is_relevant {
            debug!(message_id = msg.id, score = msg.relevance_score, "message relevant");
        }
        out.is_relevant
    }

    pub fn get_matching_criteria(&self, msg: &Message) -> Vec<String> {
        self.evaluate(&msg.searchable_text()).matched
    }

    pub fn calculate_relevance_score(&self, msg: &Message) -> f64 {
        self.evaluate(&msg.searchable_text()).score
    }
}
