//! Near-duplicate detection for DOM states seen during one page load.

use crate::fingerprint::{similarity, simhash};
use chrono::Utc;
use serde::Serialize;

pub const DEFAULT_ELEMENTS_DIFF_THRESHOLD: f64 = 15.0;
pub const DEFAULT_SIMHASH_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomStateNode {
    pub element_count: usize,
    pub simhash: u32,
    pub last_seen_at: i64,
    pub seen_count: usize,
    pub total_mutations: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AddNodeResult {
    pub added: bool,
    pub last_seen_at: i64,
    pub seen_count: usize,
    pub total_mutations: u64,
}

impl AddNodeResult {
    fn added() -> Self {
        Self {
            added: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomDeduplicator {
    nodes: Vec<DomStateNode>,
    elements_diff_threshold: f64,
    simhash_threshold: f64,
}

impl DomDeduplicator {
    pub fn new() -> Self {
        Self::with_thresholds(DEFAULT_ELEMENTS_DIFF_THRESHOLD, DEFAULT_SIMHASH_THRESHOLD)
    }

    /// `elements_diff_threshold` is a percentage of the larger element count,
    /// `simhash_threshold` the minimum similarity in `0.0..=1.0`.
    pub fn with_thresholds(elements_diff_threshold: f64, simhash_threshold: f64) -> Self {
        Self {
            nodes: Vec::new(),
            elements_diff_threshold,
            simhash_threshold,
        }
    }

    /// Record a DOM snapshot given as raw `"TAG first-attribute"` descriptors.
    ///
    /// The first stored state matching the snapshot is refreshed and reported
    /// as a re-sighting; otherwise the snapshot is stored as a new state.
    pub fn add_node<S: AsRef<str>>(&mut self, tag_list: &[S], total_mutations: u64) -> AddNodeResult {
        let candidate = Self::new_node(tag_list, total_mutations);
        let (elements_threshold, simhash_threshold) =
            (self.elements_diff_threshold, self.simhash_threshold);

        let Some(existing) = self
            .nodes
            .iter_mut()
            .find(|node| Self::matches(elements_threshold, simhash_threshold, node, &candidate))
        else {
            self.nodes.push(candidate);
            return AddNodeResult::added();
        };

        existing.last_seen_at = Utc::now().timestamp();
        existing.seen_count += 1;

        AddNodeResult {
            added: false,
            last_seen_at: existing.last_seen_at,
            seen_count: existing.seen_count,
            total_mutations: existing.total_mutations,
        }
    }

    pub fn reset(&mut self) {
        self.nodes.clear();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_seen_count(&self) -> usize {
        self.nodes.iter().map(|n| n.seen_count).sum()
    }

    pub fn nodes(&self) -> &[DomStateNode] {
        &self.nodes
    }

    fn new_node<S: AsRef<str>>(tag_list: &[S], total_mutations: u64) -> DomStateNode {
        let tokens: Vec<String> = tag_list
            .iter()
            .filter_map(|descriptor| normalize_descriptor(descriptor.as_ref()))
            .collect();

        DomStateNode {
            element_count: tag_list.len(),
            simhash: simhash(&tokens),
            last_seen_at: Utc::now().timestamp(),
            seen_count: 1,
            total_mutations,
        }
    }

    fn matches(
        elements_diff_threshold: f64,
        simhash_threshold: f64,
        existing: &DomStateNode,
        candidate: &DomStateNode,
    ) -> bool {
        let max_elements = existing.element_count.max(candidate.element_count);
        let elements_diff = if max_elements == 0 {
            0
        } else {
            existing.element_count.abs_diff(candidate.element_count) * 100 / max_elements
        };

        if elements_diff as f64 > elements_diff_threshold {
            return false;
        }

        similarity(existing.simhash, candidate.simhash) >= simhash_threshold
    }
}

impl Default for DomDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

/// `"DIV class"` becomes `"div-class"`, `"SPAN"` becomes `"span"`.
fn normalize_descriptor(descriptor: &str) -> Option<String> {
    if descriptor.is_empty() {
        return None;
    }

    let (tag, attribute) = match descriptor.split_once(' ') {
        Some((tag, rest)) => (tag, rest.split_whitespace().collect::<String>()),
        None => (descriptor, String::new()),
    };

    let mut name = tag.to_lowercase();
    if !attribute.is_empty() {
        name.push('-');
        name.push_str(&attribute);
    }
    Some(name)
}
