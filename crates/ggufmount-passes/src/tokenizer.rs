//! Tokenizer repair: removal of corrupt end-of-turn runs from the vocabulary.
//!
//! Some fine-tunes leak repeated end-of-turn markers padded with filler
//! tokens into the vocabulary (e.g. `<end> filler <end> filler <end>`).
//! Those tokens are removed and every index that refers into the token list
//! is renumbered through a single old-to-new mapping.

use std::collections::{BTreeSet, HashSet};

use ggufmount_codec::MetadataValue;
use ggufmount_stage::{Document, DocumentKind, VirtualMount};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PassError;

pub const TOKENS_KEY: &str = "tokenizer.ggml.tokens";
pub const SCORES_KEY: &str = "tokenizer.ggml.scores";
pub const TOKEN_TYPE_KEY: &str = "tokenizer.ggml.token_type";
pub const MERGES_KEY: &str = "tokenizer.ggml.merges";
pub const VOCAB_SIZE_KEY: &str = "tokenizer.ggml.vocab_size";

/// Arrays that run parallel to the token list.
const PARALLEL_ARRAYS: [&str; 2] = [SCORES_KEY, TOKEN_TYPE_KEY];

/// Detection settings for [`fix_tokenizer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Minimum end-of-turn markers in a run before it is removed.
    pub repetition_threshold: usize,
    pub end_markers: Vec<String>,
    pub fillers: Vec<String>,
    /// Token texts that are always removed.
    pub deny_list: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        let owned = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        Self {
            repetition_threshold: 3,
            end_markers: owned(&["<|end|>", "<end>", "<|eot_id|>", "<|im_end|>", "<|endoftext|>"]),
            fillers: owned(&["filler", "talking", "", " ", "\n"]),
            deny_list: owned(&["<|end|> talking", "talking <|end|>"]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    End,
    Filler,
    Other,
}

struct Classifier<'a> {
    ends: HashSet<&'a str>,
    fillers: HashSet<&'a str>,
    deny: HashSet<&'a str>,
}

impl<'a> Classifier<'a> {
    fn new(cfg: &'a RepairConfig) -> Self {
        Self {
            ends: cfg.end_markers.iter().map(String::as_str).collect(),
            fillers: cfg.fillers.iter().map(String::as_str).collect(),
            deny: cfg.deny_list.iter().map(String::as_str).collect(),
        }
    }

    fn class(&self, token: &str) -> Class {
        if self.ends.contains(token) {
            Class::End
        } else if self.fillers.contains(token) {
            Class::Filler
        } else {
            Class::Other
        }
    }
}

/// One detection sweep over `live` (indices into `tokens`). Returns the
/// indices to remove.
fn sweep(tokens: &[&str], live: &[usize], classifier: &Classifier<'_>, threshold: usize) -> Vec<usize> {
    let mut hits = Vec::new();
    let mut i = 0;
    while i < live.len() {
        if classifier.class(tokens[live[i]]) == Class::Other {
            if classifier.deny.contains(tokens[live[i]]) {
                hits.push(live[i]);
            }
            i += 1;
            continue;
        }
        // maximal span of end markers and fillers: live[i..j]
        let mut j = i;
        while j < live.len() && classifier.class(tokens[live[j]]) != Class::Other {
            j += 1;
        }
        let span = &live[i..j];
        let is_end = |&idx: &usize| classifier.class(tokens[idx]) == Class::End;
        if let (Some(first), Some(last)) = (span.iter().position(is_end), span.iter().rposition(is_end)) {
            let run = &span[first..=last];
            let ends = run.iter().filter(|idx| is_end(*idx)).count();
            if ends >= threshold {
                hits.extend_from_slice(run);
            }
        }
        // deny-listed literals can also be end markers or fillers
        hits.extend(span.iter().copied().filter(|&idx| classifier.deny.contains(tokens[idx])));
        i = j;
    }
    hits
}

/// Indices of pathological tokens, iterated to a fixpoint: removing a
/// deny-listed token can join two shorter runs into one long enough to match.
pub fn detect_pathological(tokens: &[&str], cfg: &RepairConfig) -> BTreeSet<usize> {
    let classifier = Classifier::new(cfg);
    let threshold = cfg.repetition_threshold.max(1);
    let mut removed = BTreeSet::new();
    let mut live: Vec<usize> = (0..tokens.len()).collect();
    loop {
        let hits = sweep(tokens, &live, &classifier, threshold);
        let before = removed.len();
        removed.extend(hits);
        if removed.len() == before {
            return removed;
        }
        live.retain(|idx| !removed.contains(idx));
    }
}

/// Old-to-new index bijection over the surviving tokens.
#[derive(Debug, Clone)]
pub struct TokenRemap {
    map: Vec<Option<u64>>,
    kept: u64,
}

impl TokenRemap {
    pub fn new(len: usize, removed: &BTreeSet<usize>) -> Self {
        let mut next = 0u64;
        let map = (0..len)
            .map(|i| {
                if removed.contains(&i) {
                    None
                } else {
                    next += 1;
                    Some(next - 1)
                }
            })
            .collect();
        Self { map, kept: next }
    }

    /// New index of an old one; `None` if removed or out of range.
    pub fn get(&self, old: u64) -> Option<u64> {
        usize::try_from(old).ok().and_then(|i| self.map.get(i).copied().flatten())
    }

    pub fn kept(&self) -> u64 {
        self.kept
    }

    pub fn is_identity(&self) -> bool {
        self.kept as usize == self.map.len()
    }

    /// Keep the items at surviving positions.
    pub fn filter<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items.iter().zip(&self.map).filter(|(_, m)| m.is_some()).map(|(v, _)| v.clone()).collect()
    }
}

/// Outcome of [`fix_tokenizer`] / [`repair_document`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub removed_count: usize,
    pub remaining_count: usize,
    pub removed_tokens: Vec<String>,
    /// References that pointed at removed tokens and were dropped.
    pub dropped_references: Vec<String>,
}

fn remap_integer(value: &MetadataValue, remap: &TokenRemap) -> Option<Option<MetadataValue>> {
    let old = value.as_u64()?;
    Some(remap.get(old).and_then(|new| MetadataValue::integer_of(value.value_type(), new)))
}

/// Count pathological tokens in a tokenizer document without changing it.
pub fn count_pathological(doc: &Document, cfg: &RepairConfig) -> usize {
    doc.get(TOKENS_KEY)
        .and_then(MetadataValue::as_string_array)
        .map_or(0, |tokens| detect_pathological(&tokens, cfg).len())
}

/// Repair a tokenizer document in place. Returns `None` when the document
/// has no token list.
pub fn repair_document(doc: &mut Document, cfg: &RepairConfig) -> Option<RepairReport> {
    let tokens: Vec<String> =
        doc.get(TOKENS_KEY)?.as_string_array()?.into_iter().map(str::to_owned).collect();
    let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    let removed = detect_pathological(&token_refs, cfg);
    let remap = TokenRemap::new(tokens.len(), &removed);

    let mut report = RepairReport {
        removed_count: removed.len(),
        remaining_count: remap.kept() as usize,
        removed_tokens: removed.iter().map(|&i| tokens[i].clone()).collect(),
        dropped_references: Vec::new(),
    };
    if remap.is_identity() {
        return Some(report);
    }

    doc.insert(TOKENS_KEY, MetadataValue::string_array(remap.filter(&tokens)));

    for key in PARALLEL_ARRAYS {
        let Some(MetadataValue::Array(ty, items)) = doc.get(key) else { continue };
        if items.len() != tokens.len() {
            warn!(
                key,
                len = items.len(),
                tokens = tokens.len(),
                "parallel array length differs from token count; left as is"
            );
            continue;
        }
        let filtered = MetadataValue::Array(*ty, remap.filter(items));
        doc.insert(key, filtered);
    }

    // *_token_id scalars and *_token_ids arrays
    let keys: Vec<String> = doc.keys().map(str::to_owned).collect();
    for key in keys {
        if key.ends_with("_token_id") {
            let Some(value) = doc.get(&key) else { continue };
            match remap_integer(value, &remap) {
                Some(Some(new)) => {
                    doc.insert(key.as_str(), new);
                }
                Some(None) => {
                    warn!(key = %key, "special token was removed; dropping reference");
                    doc.remove(&key);
                    report.dropped_references.push(key);
                }
                None => {}
            }
        } else if key.ends_with("_token_ids") {
            let Some(MetadataValue::Array(ty, items)) = doc.get(&key) else { continue };
            if !ty.is_integer() {
                continue;
            }
            let ty = *ty;
            let mut kept = Vec::with_capacity(items.len());
            let mut dropped = 0usize;
            for item in items {
                match remap_integer(item, &remap) {
                    Some(Some(new)) => kept.push(new),
                    Some(None) => dropped += 1,
                    // negative ids mean "unset"
                    None => kept.push(item.clone()),
                }
            }
            if dropped > 0 {
                warn!(key = %key, dropped, "token id list referenced removed tokens");
                report.dropped_references.push(key.clone());
            }
            doc.insert(key.as_str(), MetadataValue::Array(ty, kept));
        }
    }

    // merges naming a token text that no longer exists
    if let Some(merges) = doc.get(MERGES_KEY).and_then(MetadataValue::as_string_array) {
        let surviving: HashSet<&str> = remap.filter(&token_refs).into_iter().collect();
        let gone: HashSet<&str> = removed
            .iter()
            .map(|&i| token_refs[i])
            .filter(|t| !surviving.contains(t))
            .collect();
        let kept: Vec<String> = merges
            .into_iter()
            .filter(|rule| !rule.split(' ').any(|part| gone.contains(part)))
            .map(str::to_owned)
            .collect();
        doc.insert(MERGES_KEY, MetadataValue::string_array(kept));
    }

    if let Some(size) = doc.get(VOCAB_SIZE_KEY) {
        if let Some(new) = MetadataValue::integer_of(size.value_type(), remap.kept()) {
            doc.insert(VOCAB_SIZE_KEY, new);
        }
    }

    debug!(
        removed = report.removed_count,
        remaining = report.remaining_count,
        "tokenizer document repaired"
    );
    Some(report)
}

/// Remove pathological tokens from a mount's tokenizer document.
///
/// Re-reads the staged files first and writes the repaired document back
/// immediately. The mount becomes `Modified` only if something was removed.
pub fn fix_tokenizer(mount: &mut VirtualMount, cfg: &RepairConfig) -> Result<RepairReport, PassError> {
    mount.ensure_editable()?;
    mount.refresh()?;
    let mut doc = mount
        .document(DocumentKind::Tokenizer)
        .cloned()
        .ok_or_else(|| PassError::no_tokenizer(mount.id()))?;
    let report = repair_document(&mut doc, cfg).ok_or_else(|| PassError::no_tokenizer(mount.id()))?;

    if report.removed_count == 0 {
        info!(mount = %mount.id(), tokens = report.remaining_count, "tokenizer is clean");
        return Ok(report);
    }
    mount.put_document(DocumentKind::Tokenizer, Some(doc))?;
    mount.mark_modified()?;
    info!(
        mount = %mount.id(),
        removed = report.removed_count,
        remaining = report.remaining_count,
        "removed pathological tokens"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggufmount_codec::ValueType;

    fn detect(tokens: &[&str]) -> Vec<usize> {
        detect_pathological(tokens, &RepairConfig::default()).into_iter().collect()
    }

    #[test]
    fn run_of_three_end_markers_is_removed() {
        let toks = ["A", "<end>", "filler", "<end>", "filler", "<end>", "B"];
        assert_eq!(detect(&toks), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn short_runs_survive() {
        assert!(detect(&["A", "<end>", "filler", "<end>", "B"]).is_empty());
        assert!(detect(&["<|im_end|>", "x", "<|im_end|>", "y", "<|im_end|>"]).is_empty());
    }

    #[test]
    fn fillers_at_run_edges_are_kept() {
        let toks = ["filler", "<end>", "<end>", "<end>", "talking", "B"];
        assert_eq!(detect(&toks), [1, 2, 3]);
    }

    #[test]
    fn deny_list_matches_exactly() {
        assert_eq!(detect(&["a", "<|end|> talking", "<|end|> talking!"]), [1]);
    }

    #[test]
    fn fixpoint_joins_runs_split_by_denied_token() {
        let toks = ["<end>", "<end>", "talking <|end|>", "<end>", "ok"];
        assert_eq!(detect(&toks), [0, 1, 2, 3]);
    }

    #[test]
    fn remap_is_contiguous() {
        let removed: BTreeSet<usize> = [1, 3].into_iter().collect();
        let remap = TokenRemap::new(5, &removed);
        assert_eq!(remap.get(0), Some(0));
        assert_eq!(remap.get(1), None);
        assert_eq!(remap.get(2), Some(1));
        assert_eq!(remap.get(4), Some(2));
        assert_eq!(remap.get(5), None);
        assert_eq!(remap.kept(), 3);
        assert_eq!(remap.filter(&['a', 'b', 'c', 'd', 'e']), ['a', 'c', 'e']);
    }

    fn ids(ty: ValueType, items: &[i64]) -> MetadataValue {
        MetadataValue::Array(
            ty,
            items
                .iter()
                .map(|&v| match ty {
                    ValueType::I32 => MetadataValue::I32(v as i32),
                    _ => MetadataValue::U32(v as u32),
                })
                .collect(),
        )
    }

    #[test]
    fn id_arrays_keep_negative_entries() {
        let mut doc = Document::from_entries(vec![
            (TOKENS_KEY.to_owned(), MetadataValue::string_array(["A", "<end>", "<end>", "<end>", "B"])),
            ("tokenizer.ggml.stop_token_ids".to_owned(), ids(ValueType::I32, &[-1, 4, -1])),
        ]);
        let report = repair_document(&mut doc, &RepairConfig::default()).unwrap();
        assert_eq!(report.removed_count, 3);
        assert!(report.dropped_references.is_empty());
        assert_eq!(doc.get("tokenizer.ggml.stop_token_ids"), Some(&ids(ValueType::I32, &[-1, 1, -1])));
    }

    #[test]
    fn threshold_is_configurable() {
        let cfg = RepairConfig { repetition_threshold: 2, ..RepairConfig::default() };
        let toks = ["A", "<end>", "<end>", "B"];
        assert_eq!(detect_pathological(&toks, &cfg).len(), 2);
    }
}
