//! Jobs: one invocation of an action over a set of matched inputs.

use crate::catalog::EntityFlags;
use crate::pattern::generic_string;
use crate::rule::{InputMatch, Rule};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Stable identity of a job.
///
/// Derived from the rule id and the (slot index, input path) pairs, so the
/// same inputs matched by the same rule get the same id on every run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Hash a rule id and its inputs. Inputs must be given in slot order.
    pub fn compute<'a>(rule: &str, inputs: impl IntoIterator<Item = (usize, &'a Path)>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(rule.as_bytes());
        hasher.update([0]);
        for (slot, path) in inputs {
            hasher.update((slot as u64).to_le_bytes());
            hasher.update(generic_string(path).as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        JobId(u64::from_le_bytes(head))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// A unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Id of the rule that created the job.
    pub rule: String,
    pub pass: u32,
    /// At most one match per slot index.
    pub inputs: BTreeMap<usize, InputMatch>,
    pub outputs: BTreeSet<PathBuf>,
    pub flags: EntityFlags,
}

impl Job {
    /// Create a job from its first match.
    pub fn new(rule: &Rule, first: InputMatch) -> Self {
        let mut job = Self {
            id: JobId(0),
            rule: rule.id.clone(),
            pass: rule.pass,
            inputs: BTreeMap::from([(first.slot_index, first)]),
            outputs: BTreeSet::new(),
            flags: EntityFlags {
                modified: true,
                ..EntityFlags::default()
            },
        };
        job.id = job.compute_id();
        job
    }

    /// Recompute the identity from the current inputs.
    pub fn compute_id(&self) -> JobId {
        JobId::compute(
            &self.rule,
            self.inputs.iter().map(|(slot, m)| (*slot, m.file.as_path())),
        )
    }

    /// The match filling the slot named `slot`.
    pub fn input(&self, slot: &str) -> Option<&InputMatch> {
        self.inputs.values().find(|m| m.slot == slot)
    }

    /// Input paths in slot order.
    pub fn input_paths(&self) -> impl Iterator<Item = &Path> {
        self.inputs.values().map(|m| m.file.as_path())
    }

    /// Whether the job produced (or adopted) `path`.
    pub fn has_output(&self, path: &Path) -> bool {
        self.outputs.contains(path)
    }
}

/// Whether two capture lists agree on every index >= 1 that is not ignored.
fn same_group(a: &[Option<String>], b: &[Option<String>], ignored: &BTreeSet<usize>) -> bool {
    let len = a.len().max(b.len());
    (1..len)
        .filter(|index| !ignored.contains(index))
        .all(|index| a.get(index).and_then(Option::as_deref) == b.get(index).and_then(Option::as_deref))
}

/// Turn the pending matches of a rule into jobs.
///
/// Matches are first sorted by (path, slot) so the result does not depend
/// on the order files were discovered in. A file offered twice for the same
/// slot (found by the scan and produced again by an earlier pass) counts
/// once. Without `group-by` each match is
/// its own job. With it, a match joins the first job whose seed match
/// agrees on all non-ignored captures and whose slot is still free.
pub fn build_jobs(rule: &Rule, mut matches: Vec<InputMatch>) -> Vec<Job> {
    matches.sort_by(|a, b| {
        a.file
            .cmp(&b.file)
            .then_with(|| a.slot_index.cmp(&b.slot_index))
    });
    matches.dedup_by(|a, b| a.file == b.file && a.slot_index == b.slot_index);

    // (job, captures of the match that created it)
    let mut jobs: Vec<(Job, Vec<Option<String>>)> = Vec::new();
    for input in matches {
        if !rule.group_by.is_empty() {
            let mut target = None;
            for (index, (job, seed)) in jobs.iter().enumerate() {
                if !same_group(seed, &input.captures, &rule.group_by) {
                    continue;
                }
                match job.inputs.get(&input.slot_index) {
                    None => {
                        target = Some(index);
                        break;
                    }
                    Some(taken) => {
                        tracing::warn!(
                            rule = %rule.id,
                            slot = %input.slot,
                            existing = %taken.file.display(),
                            file = %input.file.display(),
                            "input slot already taken, creating a separate job"
                        );
                    }
                }
            }
            if let Some(index) = target {
                jobs[index].0.inputs.insert(input.slot_index, input);
                continue;
            }
        }

        tracing::trace!(rule = %rule.id, file = %input.file.display(), "adding new job");
        let seed = input.captures.clone();
        jobs.push((Job::new(rule, input), seed));
    }

    jobs.into_iter()
        .map(|(mut job, _)| {
            job.id = job.compute_id();
            job
        })
        .collect()
}
