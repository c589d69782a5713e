use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// FullTextIndex: tokenized term -> posting list with per-document counts
// ---------------------------------------------------------------------------

const MIN_TOKEN_LEN: usize = 3;

/// Minimal-TF full-text index over designated string fields. Query scoring
/// is the sum over query terms of each document's term count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullTextIndex {
    /// term -> (entity id -> occurrences).
    postings: HashMap<String, HashMap<Uuid, usize>>,
    /// entity id -> distinct indexed terms, for removal.
    terms_by_entity: HashMap<Uuid, Vec<String>>,
}

impl FullTextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the concatenated text of an entity's designated fields.
    pub fn insert(&mut self, id: Uuid, texts: &[String]) {
        self.remove(&id);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for text in texts {
            for token in tokenize(text) {
                *counts.entry(token).or_insert(0) += 1;
            }
        }
        if counts.is_empty() {
            return;
        }

        let mut terms: Vec<String> = Vec::with_capacity(counts.len());
        for (term, count) in counts {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id, count);
            terms.push(term);
        }
        terms.sort_unstable();
        self.terms_by_entity.insert(id, terms);
    }

    /// Drop an entity from every posting list. Idempotent.
    pub fn remove(&mut self, id: &Uuid) {
        if let Some(terms) = self.terms_by_entity.remove(id) {
            for term in terms {
                if let Some(postings) = self.postings.get_mut(&term) {
                    postings.remove(id);
                    if postings.is_empty() {
                        self.postings.remove(&term);
                    }
                }
            }
        }
    }

    /// Rank documents by summed per-term match counts for the query text.
    /// Ties break by entity id so results are deterministic.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<(Uuid, usize)> {
        let mut scores: HashMap<Uuid, usize> = HashMap::new();
        for term in tokenize(query) {
            if let Some(postings) = self.postings.get(&term) {
                for (id, count) in postings {
                    *scores.entry(*id).or_insert(0) += count;
                }
            }
        }

        let mut ranked: Vec<(Uuid, usize)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }

    pub fn len(&self) -> usize {
        self.terms_by_entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms_by_entity.is_empty()
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// All indexed entity ids.
    pub fn ids(&self) -> Vec<Uuid> {
        self.terms_by_entity.keys().copied().collect()
    }
}

/// Lowercase, strip non-alphanumerics, split on whitespace, drop tokens
/// shorter than three characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(|c| c.to_lowercase())
                .collect::<String>()
        })
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_normalizes_and_drops_short_tokens() {
        let tokens = tokenize("The Quick-Brown FOX is at #42!");
        assert_eq!(tokens, vec!["the", "quickbrown", "fox"]);
    }

    #[test]
    fn ranking_sums_per_document_term_matches() {
        let mut index = FullTextIndex::new();
        let heavy = Uuid::new_v4();
        let light = Uuid::new_v4();

        index.insert(heavy, &["graph graph graph engine".to_string()]);
        index.insert(light, &["graph database".to_string()]);

        let ranked = index.top_k("graph engine", 10);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, heavy);
        assert_eq!(ranked[0].1, 4);
        assert_eq!(ranked[1].1, 1);
    }

    #[test]
    fn remove_clears_all_postings() {
        let mut index = FullTextIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, &["semantic search".to_string()]);
        assert_eq!(index.len(), 1);

        index.remove(&id);
        assert!(index.top_k("semantic", 10).is_empty());
        assert_eq!(index.term_count(), 0);
    }

    #[test]
    fn reinsert_replaces_previous_terms() {
        let mut index = FullTextIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, &["alpha beta".to_string()]);
        index.insert(id, &["gamma delta".to_string()]);

        assert!(index.top_k("alpha", 10).is_empty());
        assert_eq!(index.top_k("gamma", 10).len(), 1);
    }
}
