use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const START_TOKEN: &str = "<start>";
pub const END_TOKEN: &str = "<end>";
pub const UNK_TOKEN: &str = "<unk>";

/// Immutable bidirectional mapping between token ids and words, built
/// from a COCO-style captions corpus and cached as JSON.
#[derive(Serialize, Deserialize)]
pub struct Vocabulary {
    word2idx: HashMap<String, i64>,
    idx2word: Vec<String>,
}

#[derive(Deserialize)]
struct Corpus {
    annotations: Vec<Annotation>,
}

#[derive(Deserialize)]
struct Annotation {
    caption: String,
}

impl Vocabulary {
    /// Deserialize the cache when it exists, otherwise build the
    /// vocabulary from the annotations corpus and persist the cache.
    pub fn load(cache_path: &Path, annotations_path: &Path, word_threshold: usize) -> Result<Self> {
        if cache_path.is_file() {
            let text = fs::read_to_string(cache_path)
                .with_context(|| format!("failed to read {}", cache_path.display()))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("invalid vocabulary cache {}", cache_path.display()));
        }

        tracing::info!(
            "no vocabulary cache at {}, building from {}",
            cache_path.display(),
            annotations_path.display()
        );
        let vocab = Self::from_corpus(annotations_path, word_threshold)?;
        fs::write(cache_path, serde_json::to_string(&vocab)?)
            .with_context(|| format!("failed to write {}", cache_path.display()))?;
        Ok(vocab)
    }

    /// Keep every word that appears at least `word_threshold` times in
    /// the corpus captions. Kept words are sorted so ids are stable
    /// across rebuilds.
    pub fn from_corpus(annotations_path: &Path, word_threshold: usize) -> Result<Self> {
        let text = fs::read_to_string(annotations_path)
            .with_context(|| format!("failed to read {}", annotations_path.display()))?;
        let corpus: Corpus = serde_json::from_str(&text)
            .with_context(|| format!("invalid annotations file {}", annotations_path.display()))?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for annotation in &corpus.annotations {
            for word in tokenize(&annotation.caption) {
                *counts.entry(word).or_default() += 1;
            }
        }

        let mut kept: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count >= word_threshold)
            .map(|(word, _)| word)
            .collect();
        kept.sort();

        let mut vocab = Self::with_special_tokens();
        for word in kept {
            vocab.add_word(word);
        }
        Ok(vocab)
    }

    fn with_special_tokens() -> Self {
        let mut vocab = Self {
            word2idx: HashMap::new(),
            idx2word: Vec::new(),
        };
        for token in [START_TOKEN, END_TOKEN, UNK_TOKEN] {
            vocab.add_word(token.to_string());
        }
        vocab
    }

    fn add_word(&mut self, word: String) {
        if !self.word2idx.contains_key(&word) {
            self.word2idx.insert(word.clone(), self.idx2word.len() as i64);
            self.idx2word.push(word);
        }
    }

    pub fn len(&self) -> usize {
        self.idx2word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2word.is_empty()
    }

    pub fn start_id(&self) -> i64 {
        0
    }

    pub fn end_id(&self) -> i64 {
        1
    }

    pub fn unk_id(&self) -> i64 {
        2
    }

    /// Id for a word; unknown words map to `<unk>`.
    pub fn id(&self, word: &str) -> i64 {
        self.word2idx.get(word).copied().unwrap_or_else(|| self.unk_id())
    }

    /// Word for an id; out-of-range ids map to `<unk>`.
    pub fn word(&self, id: i64) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.idx2word.get(idx))
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    /// Turn decoded token ids into a sentence: drop the leading
    /// `<start>` and trailing `<end>`, join with spaces, capitalize.
    pub fn clean_sentence(&self, ids: &[i64]) -> String {
        let mut words: Vec<&str> = ids.iter().map(|&id| self.word(id)).collect();
        if words.first() == Some(&START_TOKEN) {
            words.remove(0);
        }
        if words.last() == Some(&END_TOKEN) {
            words.pop();
        }

        let sentence = words.join(" ");
        let mut chars = sentence.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => sentence,
        }
    }
}

fn tokenize(caption: &str) -> Vec<String> {
    caption
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus_json() -> String {
        serde_json::json!({
            "annotations": [
                {"caption": "A dog runs on the beach."},
                {"caption": "A dog sleeps near the beach!"},
                {"caption": "The cat naps."},
            ]
        })
        .to_string()
    }

    fn build(threshold: usize) -> Vocabulary {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.json");
        fs::write(&path, corpus_json()).unwrap();
        Vocabulary::from_corpus(&path, threshold).unwrap()
    }

    #[test]
    fn special_tokens_take_the_first_ids() {
        let vocab = build(1);
        assert_eq!(vocab.id(START_TOKEN), 0);
        assert_eq!(vocab.id(END_TOKEN), 1);
        assert_eq!(vocab.id(UNK_TOKEN), 2);
        assert_eq!(vocab.word(0), START_TOKEN);
    }

    #[test]
    fn threshold_filters_rare_words() {
        let vocab = build(2);
        // "dog", "the", "a", "beach" appear twice or more; "cat" once.
        assert_ne!(vocab.id("dog"), vocab.unk_id());
        assert_ne!(vocab.id("beach"), vocab.unk_id());
        assert_eq!(vocab.id("cat"), vocab.unk_id());
        assert_eq!(vocab.id("zebra"), vocab.unk_id());
    }

    #[test]
    fn tokenization_lowercases_and_strips_punctuation() {
        assert_eq!(tokenize("A Dog, runs!"), ["a", "dog", "runs"]);
        assert_eq!(tokenize("  "), Vec::<String>::new());
    }

    #[test]
    fn ids_are_bidirectional_and_stable() {
        let a = build(1);
        let b = build(1);
        let id = a.id("beach");
        assert_eq!(a.word(id), "beach");
        assert_eq!(b.id("beach"), id);
        assert_eq!(a.word(-1), UNK_TOKEN);
        assert_eq!(a.word(a.len() as i64), UNK_TOKEN);
    }

    #[test]
    fn clean_sentence_strips_markers_and_capitalizes() {
        let vocab = build(1);
        let ids = [
            vocab.start_id(),
            vocab.id("a"),
            vocab.id("dog"),
            vocab.id("runs"),
            vocab.end_id(),
        ];
        assert_eq!(vocab.clean_sentence(&ids), "A dog runs");
        assert_eq!(vocab.clean_sentence(&[]), "");
    }

    #[test]
    fn load_builds_then_reuses_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let annotations = dir.path().join("captions.json");
        let cache = dir.path().join("vocab.json");
        fs::write(&annotations, corpus_json()).unwrap();

        let built = Vocabulary::load(&cache, &annotations, 1).unwrap();
        assert!(cache.is_file());

        // A second load must not need the corpus at all.
        fs::remove_file(&annotations).unwrap();
        let cached = Vocabulary::load(&cache, &annotations, 1).unwrap();
        assert_eq!(cached.len(), built.len());
        assert_eq!(cached.id("dog"), built.id("dog"));
    }
}
