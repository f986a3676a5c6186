//! On-demand correlation between failing artifacts.
//!
//! Nothing computed here is written back to the manifest. Signatures come
//! from offload records when present and are otherwise extracted from the
//! artifact content, memoized for the duration of one query.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::{read_artifact, ArtifactId, Layout};
use crate::config::CorrelationConfig;
use crate::error::Result;
use crate::manifest::{ManifestEntry, ManifestStore, OffloadEntry};
use crate::signature::{FailureSignature, SignatureExtractor};

const ERROR_WEIGHT: f64 = 0.3;
const TEST_WEIGHT: f64 = 0.4;
const TAIL_WEIGHT: f64 = 0.3;

/// A past failure related to the query target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub entry: OffloadEntry,
    pub score: f64,
    pub reason: String,
}

/// Failures sharing a tail hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub tail_hash: String,
    /// Newest first.
    pub entries: Vec<OffloadEntry>,
}

fn common<'a>(a: &'a [String], b: &'a [String]) -> BTreeSet<&'a str> {
    let left: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    b.iter()
        .map(String::as_str)
        .filter(|v| left.contains(v))
        .collect()
}

fn overlap_ratio(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    common(a, b).len() as f64 / a.len().max(b.len()) as f64
}

fn same_tail(a: &FailureSignature, b: &FailureSignature) -> bool {
    !a.tail_hash.is_empty() && a.tail_hash == b.tail_hash
}

/// Weighted similarity in `[0, 1]`.
pub fn similarity(a: &FailureSignature, b: &FailureSignature) -> f64 {
    let mut score = ERROR_WEIGHT * overlap_ratio(&a.error_types, &b.error_types)
        + TEST_WEIGHT * overlap_ratio(&a.test_files, &b.test_files);
    if same_tail(a, b) {
        score += TAIL_WEIGHT;
    }
    score.min(1.0)
}

/// Human-readable reasons, most specific first.
pub fn explain(a: &FailureSignature, b: &FailureSignature) -> String {
    let mut reasons = Vec::new();
    if let Some(err) = common(&a.error_types, &b.error_types).first() {
        reasons.push(format!("same error: {err}"));
    }
    if let Some(test) = common(&a.test_files, &b.test_files).first() {
        reasons.push(format!("same test: {test}"));
    }
    if same_tail(a, b) {
        reasons.push("similar output".to_string());
    }
    if reasons.is_empty() {
        "similar pattern".to_string()
    } else {
        reasons.join(", ")
    }
}

/// One-line hint: `Similar to [abcd] +2 more (same error: KeyError)`.
pub fn correlation_summary(correlations: &[Correlation]) -> String {
    let Some(top) = correlations.first() else {
        return String::new();
    };
    let short = &top.entry.id.as_str()[..4];
    let reason = top.reason.split(',').next().unwrap_or("unknown").trim();
    match correlations.len() {
        1 => format!("Similar to [{short}] ({reason})"),
        n => format!("Similar to [{short}] +{} more ({reason})", n - 1),
    }
}

/// Correlation queries over one workspace.
pub struct Correlator<'a> {
    layout: &'a Layout,
    manifest: &'a ManifestStore,
    extractor: &'a SignatureExtractor,
    config: &'a CorrelationConfig,
}

type SignatureCache = HashMap<ArtifactId, Option<FailureSignature>>;

impl<'a> Correlator<'a> {
    pub fn new(
        layout: &'a Layout,
        manifest: &'a ManifestStore,
        extractor: &'a SignatureExtractor,
        config: &'a CorrelationConfig,
    ) -> Self {
        Self {
            layout,
            manifest,
            extractor,
            config,
        }
    }

    /// Recent failing offload records, newest first.
    pub fn recent_failures(
        &self,
        group: Option<&str>,
        exclude: Option<&ArtifactId>,
        limit: usize,
    ) -> Result<Vec<OffloadEntry>> {
        let records = self.manifest.read_all(self.config.scan_cap)?;
        Ok(records
            .into_iter()
            .filter_map(|e| match e {
                ManifestEntry::Offload(o) => Some(o),
                _ => None,
            })
            .filter(|o| o.is_failure())
            .filter(|o| exclude != Some(&o.id))
            .filter(|o| group.is_none_or(|g| o.group() == g))
            .take(limit)
            .collect())
    }

    fn signature_of(&self, entry: &OffloadEntry, cache: &mut SignatureCache) -> Option<FailureSignature> {
        if let Some(sig) = &entry.failure_sig {
            return Some(sig.clone());
        }
        cache
            .entry(entry.id.clone())
            .or_insert_with(|| {
                let path = self.layout.absolute(&entry.path);
                match read_artifact(&path) {
                    Ok(content) => Some(self.extractor.extract(&content)),
                    Err(e) => {
                        debug!(id = %entry.id, error = %e, "no signature available");
                        None
                    }
                }
            })
            .clone()
    }

    /// Past failures similar to `target`, best first.
    ///
    /// Empty for targets that did not fail.
    pub fn find_correlations(&self, target: &OffloadEntry) -> Result<Vec<Correlation>> {
        if !target.is_failure() {
            return Ok(Vec::new());
        }
        let mut cache = SignatureCache::new();
        let Some(target_sig) = self.signature_of(target, &mut cache) else {
            return Ok(Vec::new());
        };
        if target_sig.is_empty() {
            return Ok(Vec::new());
        }

        let candidates =
            self.recent_failures(Some(target.group()), Some(&target.id), self.config.max_candidates)?;

        let mut matches = Vec::new();
        for candidate in candidates {
            let Some(sig) = self.signature_of(&candidate, &mut cache) else {
                continue;
            };
            let score = similarity(&target_sig, &sig);
            if score >= self.config.threshold {
                matches.push(Correlation {
                    reason: explain(&target_sig, &sig),
                    entry: candidate,
                    score,
                });
            }
        }

        // Stable: among equal scores the more recent candidate stays first.
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        matches.truncate(self.config.max_results);
        Ok(matches)
    }

    /// Groups of at least two recent failures with the same tail hash,
    /// ordered by their most recent member.
    pub fn cluster_failures(&self, limit: usize) -> Result<Vec<FailureCluster>> {
        let mut cache = SignatureCache::new();
        let mut clusters: Vec<FailureCluster> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for entry in self.recent_failures(None, None, limit)? {
            let Some(sig) = self.signature_of(&entry, &mut cache) else {
                continue;
            };
            if sig.tail_hash.is_empty() {
                continue;
            }
            match index.get(&sig.tail_hash) {
                Some(&i) => clusters[i].entries.push(entry),
                None => {
                    index.insert(sig.tail_hash.clone(), clusters.len());
                    clusters.push(FailureCluster {
                        tail_hash: sig.tail_hash,
                        entries: vec![entry],
                    });
                }
            }
        }

        clusters.retain(|c| c.entries.len() >= 2);
        Ok(clusters)
    }
}
