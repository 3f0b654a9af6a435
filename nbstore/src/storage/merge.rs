//! CRDT update folding.
//!
//! Storages never look inside update bytes themselves; everything that needs
//! CRDT semantics goes through an [`UpdateMerger`].

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{Error, Result};

pub trait UpdateMerger: Send + Sync {
    /// Fold `updates` into one update equivalent to applying all of them.
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>>;

    /// Encode what `doc` has that a replica at `state_vector` is missing.
    /// `None` means the replica is empty.
    fn diff(&self, doc: &[u8], state_vector: Option<&[u8]>) -> Result<Vec<u8>>;

    /// State vector of `doc`.
    fn state_vector(&self, doc: &[u8]) -> Result<Vec<u8>>;
}

/// [`UpdateMerger`] backed by yrs (v1 update encoding).
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsMerger;

impl YrsMerger {
    fn load<'a>(updates: impl IntoIterator<Item = &'a [u8]>) -> Result<Doc> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for bin in updates {
                if bin.is_empty() {
                    continue;
                }
                let update = Update::decode_v1(bin).map_err(|e| Error::Merge(e.to_string()))?;
                txn.apply_update(update)
                    .map_err(|e| Error::Merge(e.to_string()))?;
            }
        }
        Ok(doc)
    }
}

impl UpdateMerger for YrsMerger {
    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>> {
        if let [single] = updates {
            return Ok(single.to_vec());
        }
        let doc = Self::load(updates.iter().copied())?;
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    fn diff(&self, doc: &[u8], state_vector: Option<&[u8]>) -> Result<Vec<u8>> {
        let sv = match state_vector {
            Some(bin) if !bin.is_empty() => {
                StateVector::decode_v1(bin).map_err(|e| Error::Merge(e.to_string()))?
            }
            _ => StateVector::default(),
        };
        let doc = Self::load([doc])?;
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn state_vector(&self, doc: &[u8]) -> Result<Vec<u8>> {
        let doc = Self::load([doc])?;
        let txn = doc.transact();
        Ok(txn.state_vector().encode_v1())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    /// A doc holding `content` in its "content" text, plus its full update.
    pub(crate) fn doc_with_text(content: &str) -> (Doc, Vec<u8>) {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let state = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        (doc, state)
    }

    /// Append to the "content" text of `doc`, returning only the new update.
    pub(crate) fn append_text(doc: &Doc, suffix: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, suffix);
        }
        doc.transact().encode_state_as_update_v1(&before)
    }

    pub(crate) fn text_of(update: &[u8]) -> String {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
        }
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.get_string(&txn)
    }

    #[test]
    fn test_merge_folds_updates() {
        let (doc, first) = doc_with_text("Hello");
        let second = append_text(&doc, ", world");

        let merged = YrsMerger.merge_updates(&[&first, &second]).unwrap();
        assert_eq!(text_of(&merged), "Hello, world");
    }

    #[test]
    fn test_diff_against_state_vector_reproduces_doc() {
        let (doc, first) = doc_with_text("abc");
        let second = append_text(&doc, "def");
        let merged = YrsMerger.merge_updates(&[&first, &second]).unwrap();

        let sv = YrsMerger.state_vector(&first).unwrap();
        let missing = YrsMerger.diff(&merged, Some(&sv)).unwrap();

        let rebuilt = YrsMerger.merge_updates(&[&first, &missing]).unwrap();
        assert_eq!(text_of(&rebuilt), "abcdef");
    }

    #[test]
    fn test_diff_without_state_vector_is_full_doc() {
        let (_, full) = doc_with_text("xyz");
        let missing = YrsMerger.diff(&full, None).unwrap();
        assert_eq!(text_of(&missing), "xyz");
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let result = YrsMerger.merge_updates(&[&[0xff, 0xff, 0xff], &[1, 2]]);
        assert!(matches!(result, Err(Error::Merge(_))));
    }
}
