//! Full-text and value index per `(partition, kind)`.
//!
//! Stored in its own collection (`<part><kind>.nodeidx` / `.edgeidx`):
//!
//! ```text
//! w\x01<attr>\x01<word>   -> bincode BTreeMap<entity key, Vec<position>>
//! v\x01<attr>\x01<value>  -> bincode BTreeSet<entity key>
//! ```
//!
//! Words are lowercased alphanumeric runs; positions start at 1 so that a
//! phrase matches on consecutive positions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::data::Value;
use crate::error::Result;
use crate::graph::locking::LockSet;
use crate::storage::GraphStorage;

type WordPostings = BTreeMap<String, Vec<u32>>;
type ValuePostings = BTreeSet<String>;

fn word_key(attr: &str, word: &str) -> String {
    format!("w\u{1}{}\u{1}{}", attr, word)
}

fn value_key(attr: &str, value: &str) -> String {
    format!("v\u{1}{}\u{1}{}", attr, value)
}

/// Split a value into lowercased words with 1-based positions.
pub fn tokenize(text: &str) -> Vec<(String, u32)> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
        .map(|(i, w)| (w.to_lowercase(), i as u32 + 1))
        .collect()
}

/// Writer side of the index, used by the low-level mutations.
pub struct IndexManager<'a> {
    storage: &'a mut dyn GraphStorage,
    smname: &'a str,
}

impl<'a> IndexManager<'a> {
    pub fn new(storage: &'a mut dyn GraphStorage, smname: &'a str) -> Self {
        Self { storage, smname }
    }

    /// Index all attributes of one entity.
    pub fn index(&mut self, key: &str, attrs: &BTreeMap<String, Value>) -> Result<()> {
        for (attr, value) in attrs {
            let text = value.to_string();

            let mut positions: BTreeMap<String, Vec<u32>> = BTreeMap::new();
            for (word, pos) in tokenize(&text) {
                positions.entry(word).or_default().push(pos);
            }
            for (word, pos) in positions {
                let wkey = word_key(attr, &word);
                let mut postings: WordPostings = self.load(&wkey)?.unwrap_or_default();
                postings.insert(key.to_string(), pos);
                self.save(&wkey, &postings)?;
            }

            let vkey = value_key(attr, &text);
            let mut postings: ValuePostings = self.load(&vkey)?.unwrap_or_default();
            postings.insert(key.to_string());
            self.save(&vkey, &postings)?;
        }
        Ok(())
    }

    /// Remove all attributes of one entity from the index.
    pub fn deindex(&mut self, key: &str, attrs: &BTreeMap<String, Value>) -> Result<()> {
        for (attr, value) in attrs {
            let text = value.to_string();

            let words: BTreeSet<String> = tokenize(&text).into_iter().map(|(w, _)| w).collect();
            for word in words {
                let wkey = word_key(attr, &word);
                if let Some(mut postings) = self.load::<WordPostings>(&wkey)? {
                    postings.remove(key);
                    self.save_or_remove(&wkey, &postings, postings.is_empty())?;
                }
            }

            let vkey = value_key(attr, &text);
            if let Some(mut postings) = self.load::<ValuePostings>(&vkey)? {
                postings.remove(key);
                self.save_or_remove(&vkey, &postings, postings.is_empty())?;
            }
        }
        Ok(())
    }

    /// Replace the indexed attributes of an entity.
    pub fn update(
        &mut self,
        key: &str,
        old: Option<&BTreeMap<String, Value>>,
        new: &BTreeMap<String, Value>,
    ) -> Result<()> {
        if let Some(old) = old {
            self.deindex(key, old)?;
        }
        self.index(key, new)
    }

    fn load<T: serde::de::DeserializeOwned>(&self, ikey: &str) -> Result<Option<T>> {
        match self.storage.fetch_entry(self.smname, ikey)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save<T: serde::Serialize>(&mut self, ikey: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.storage.store_entry(self.smname, ikey, bytes)
    }

    fn save_or_remove<T: serde::Serialize>(&mut self, ikey: &str, value: &T, remove: bool) -> Result<()> {
        if remove {
            self.storage.remove_entry(self.smname, ikey)?;
            Ok(())
        } else {
            self.save(ikey, value)
        }
    }
}

/// Read side of the index, handed out to query engines.
pub trait IndexQuery {
    /// Keys whose attribute contains `word`, with word positions.
    fn lookup_word(&self, attr: &str, word: &str) -> Result<BTreeMap<String, Vec<u32>>>;

    /// Keys whose attribute contains the words of `phrase` in sequence.
    fn lookup_phrase(&self, attr: &str, phrase: &str) -> Result<Vec<String>>;

    /// Keys whose attribute equals `value` exactly.
    fn lookup_value(&self, attr: &str, value: &str) -> Result<Vec<String>>;
}

/// Index handle bound to one index collection.
///
/// Every lookup takes the storage lock for its own duration only.
pub struct IndexHandle {
    locks: Arc<LockSet>,
    smname: String,
}

impl IndexHandle {
    pub(crate) fn new(locks: Arc<LockSet>, smname: String) -> Self {
        Self { locks, smname }
    }

    pub fn collection(&self) -> &str {
        &self.smname
    }

    fn load<T: serde::de::DeserializeOwned>(&self, ikey: &str) -> Result<Option<T>> {
        let storage = self.locks.storage()?;
        match storage.fetch_entry(&self.smname, ikey)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl IndexQuery for IndexHandle {
    fn lookup_word(&self, attr: &str, word: &str) -> Result<BTreeMap<String, Vec<u32>>> {
        let word = word.to_lowercase();
        Ok(self.load::<WordPostings>(&word_key(attr, &word))?.unwrap_or_default())
    }

    fn lookup_phrase(&self, attr: &str, phrase: &str) -> Result<Vec<String>> {
        let words = tokenize(phrase);
        let Some(((first, _), rest)) = words.split_first() else {
            return Ok(Vec::new());
        };

        let mut candidates = self.lookup_word(attr, first)?;
        let mut later = Vec::with_capacity(rest.len());
        for (word, _) in rest {
            let postings = self.lookup_word(attr, word)?;
            candidates.retain(|key, _| postings.contains_key(key));
            later.push(postings);
        }

        let matches = candidates
            .into_iter()
            .filter(|(key, starts)| {
                starts.iter().any(|start| {
                    later.iter().enumerate().all(|(offset, postings)| {
                        postings
                            .get(key)
                            .map(|pos| pos.contains(&(start + offset as u32 + 1)))
                            .unwrap_or(false)
                    })
                })
            })
            .map(|(key, _)| key)
            .collect();

        Ok(matches)
    }

    fn lookup_value(&self, attr: &str, value: &str) -> Result<Vec<String>> {
        Ok(self
            .load::<ValuePostings>(&value_key(attr, value))?
            .map(|set| set.into_iter().collect())
            .unwrap_or_default())
    }
}
