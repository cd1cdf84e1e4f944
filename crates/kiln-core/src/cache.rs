//! Incremental cache: what the previous run produced, and from what.
//!
//! The cache is a JSON document with four sections:
//!
//! ```json
//! {
//!   "actions": { "copy": "1.0" },
//!   "rules":   { "textures": { "pass": 10, "action": "copy", "path": "", ... } },
//!   "jobs":    { "1234567890": { "rule": "textures", "inputs": [...], "outputs": [...] } },
//!   "files":   { "/in/a.png": { "write-time": 1700000000000000000 } }
//! }
//! ```
//!
//! Loading is forgiving: anything that no longer makes sense (a removed
//! action or rule, a vanished file, a job whose inputs match differently)
//! is dropped entry by entry and simply rebuilt.

use crate::catalog::{File, FileCatalog};
use crate::job::{Job, JobId};
use crate::options::Options;
use crate::pattern::generic_string;
use crate::registry::Registry;
use crate::rule::{Rule, RuleSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Errors writing or reading the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to access cache file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize cache: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted rule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub pass: u32,
    pub action: String,
    pub path: String,
    pub inputs: BTreeMap<String, String>,
    #[serde(default, rename = "group-by")]
    pub group_by: Vec<usize>,
    pub outputs: BTreeMap<String, String>,
    pub options: Options,
}

impl RuleRecord {
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            pass: rule.pass,
            action: rule.action.clone(),
            path: generic_string(&rule.path),
            inputs: rule
                .inputs
                .iter()
                .map(|(slot, pattern)| (slot.clone(), pattern.source().to_string()))
                .collect(),
            group_by: rule.group_by.iter().copied().collect(),
            outputs: rule.outputs.clone(),
            options: rule.options.clone(),
        }
    }
}

/// Persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub rule: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Persisted file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "write-time")]
    pub write_time: u64,
    #[serde(default, skip_serializing_if = "is_source_pass")]
    pub pass: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<JobId>,
}

fn is_source_pass(pass: &u32) -> bool {
    *pass == 0
}

/// The complete cache document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    pub actions: BTreeMap<String, String>,
    pub rules: BTreeMap<String, RuleRecord>,
    pub jobs: BTreeMap<String, JobRecord>,
    pub files: BTreeMap<String, FileRecord>,
}

/// The document as read from disk, before per-entry validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDocument {
    actions: BTreeMap<String, serde_json::Value>,
    rules: BTreeMap<String, serde_json::Value>,
    jobs: BTreeMap<String, serde_json::Value>,
    files: BTreeMap<String, serde_json::Value>,
}

fn typed_entries<T: serde::de::DeserializeOwned>(
    section: &str,
    entries: BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, T> {
    entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(record) => Some((key, record)),
            Err(e) => {
                tracing::debug!(section, key = %key, error = %e, "dropping malformed cache entry");
                None
            }
        })
        .collect()
}

impl From<RawDocument> for CacheDocument {
    fn from(raw: RawDocument) -> Self {
        Self {
            actions: typed_entries("actions", raw.actions),
            rules: typed_entries("rules", raw.rules),
            jobs: typed_entries("jobs", raw.jobs),
            files: typed_entries("files", raw.files),
        }
    }
}

impl CacheDocument {
    /// Snapshot the live state of a run.
    ///
    /// Failed jobs are left out, as are files that no longer exist or were
    /// not used. Modification times are read again from disk.
    pub fn capture(
        registry: &Registry,
        rules: &RuleSet,
        catalog: &FileCatalog,
        jobs: &[Job],
    ) -> Self {
        let actions = registry
            .declarations()
            .map(|decl| (decl.name.clone(), decl.version.clone()))
            .collect();

        let rules = rules
            .iter()
            .filter(|rule| registry.contains(&rule.action))
            .map(|rule| (rule.id.clone(), RuleRecord::from_rule(rule)))
            .collect();

        let live_jobs: Vec<&Job> = jobs.iter().filter(|job| !job.flags.failed).collect();
        let job_ids: HashSet<JobId> = live_jobs.iter().map(|job| job.id).collect();
        let jobs = live_jobs
            .iter()
            .map(|job| {
                let record = JobRecord {
                    rule: job.rule.clone(),
                    inputs: job.input_paths().map(generic_string).collect(),
                    outputs: job.outputs.iter().map(|p| generic_string(p)).collect(),
                };
                (job.id.to_string(), record)
            })
            .collect();

        let kept: Vec<File> = catalog
            .snapshot()
            .into_iter()
            .filter(|file| file.flags.exists && file.flags.used)
            .collect();
        let kept_paths: HashSet<&Path> = kept.iter().map(|file| file.path.as_path()).collect();
        let mut files = BTreeMap::new();
        for file in &kept {
            let write_time = match crate::catalog::write_time(&file.path) {
                Ok(time) => time,
                Err(_) => continue,
            };
            let alias = file
                .alias
                .as_deref()
                .filter(|alias| kept_paths.contains(alias))
                .map(generic_string);
            let source = file.source.filter(|id| job_ids.contains(id));
            files.insert(
                file.key.clone(),
                FileRecord {
                    write_time,
                    pass: file.pass,
                    alias,
                    source,
                },
            );
        }

        Self {
            actions,
            rules,
            jobs,
            files,
        }
    }

    /// Render the job graph as a Graphviz digraph.
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph Cache {\n  rankdir=LR;\n  size=\"8,5\"\n");
        for (id, job) in &self.jobs {
            let node = format!("{}#{}", job.rule, id);
            for input in &job.inputs {
                let _ = writeln!(dot, "  \"{input}\" -> \"{node}\";");
            }
            for output in &job.outputs {
                let _ = writeln!(dot, "  \"{node}\" -> \"{output}\";");
            }
        }
        dot.push_str("}\n");
        dot
    }
}

/// Cached metadata of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub write_time: u64,
    pub pass: u32,
    pub alias: Option<PathBuf>,
    pub source: Option<JobId>,
}

/// A job that ran in the previous update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedJob {
    pub rule: String,
    /// Input paths by slot index, as re-matched against the live rule.
    pub inputs: BTreeMap<usize, PathBuf>,
    pub outputs: BTreeSet<PathBuf>,
}

/// The in-memory cache the scheduler consults.
#[derive(Debug, Default)]
pub struct Cache {
    files: HashMap<PathBuf, CachedFile>,
    jobs: HashMap<JobId, CachedJob>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cache file and reconcile it with the registered actions and
    /// loaded rules.
    ///
    /// Returns `Ok(false)` when the file is missing or cannot be parsed; the
    /// current cache is then left untouched.
    pub fn load(
        &mut self,
        path: &Path,
        registry: &mut Registry,
        rules: &mut RuleSet,
    ) -> Result<bool, CacheError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let raw: RawDocument = match serde_json::from_str(&data) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable cache");
                return Ok(false);
            }
        };
        let document = CacheDocument::from(raw);

        for (name, version) in &document.actions {
            match registry.reconcile_version(name, version) {
                Some(true) => tracing::debug!(action = %name, "action version changed"),
                Some(false) => {}
                None => tracing::debug!(action = %name, "cached action is no longer registered"),
            }
        }

        for (id, record) in &document.rules {
            if !registry.contains(&record.action) {
                continue;
            }
            if let Some(rule) = rules.get_mut(id) {
                if RuleRecord::from_rule(rule) == *record {
                    rule.modified = false;
                }
            }
        }

        self.ingest(document, rules);
        tracing::info!(
            path = %path.display(),
            jobs = self.jobs.len(),
            files = self.files.len(),
            "loaded cache"
        );
        Ok(true)
    }

    /// Replace the cached files and jobs with the ones in `document`.
    ///
    /// Jobs are only kept when their rule still exists, all of their files
    /// are known, every input still matches a distinct slot of the rule and
    /// their id hashes to the stored value.
    pub fn ingest(&mut self, document: CacheDocument, rules: &RuleSet) {
        let mut files: HashMap<PathBuf, CachedFile> = document
            .files
            .iter()
            .map(|(key, record)| {
                let file = CachedFile {
                    write_time: record.write_time,
                    pass: record.pass,
                    alias: None,
                    source: None,
                };
                (PathBuf::from(key), file)
            })
            .collect();

        for (key, record) in &document.files {
            let Some(alias) = record.alias.as_deref().map(PathBuf::from) else {
                continue;
            };
            if !files.contains_key(&alias) {
                continue;
            }
            if let Some(file) = files.get_mut(Path::new(key)) {
                file.alias = Some(alias);
            }
        }

        let mut jobs = HashMap::new();
        for (key, record) in document.jobs {
            match restore_job(&key, record, rules, &files) {
                Some((id, job)) => {
                    jobs.insert(id, job);
                }
                None => tracing::debug!(job = %key, "dropping stale cached job"),
            }
        }

        for (key, record) in &document.files {
            let Some(source) = record.source.filter(|id| jobs.contains_key(id)) else {
                continue;
            };
            if let Some(file) = files.get_mut(Path::new(key)) {
                file.source = Some(source);
            }
        }

        let referenced: HashSet<PathBuf> = jobs
            .values()
            .flat_map(|job: &CachedJob| job.inputs.values().chain(job.outputs.iter()))
            .cloned()
            .collect();
        files.retain(|path, _| referenced.contains(path));
        for file in files.values_mut() {
            if file.alias.as_ref().is_some_and(|alias| !referenced.contains(alias)) {
                file.alias = None;
            }
        }

        self.files = files;
        self.jobs = jobs;
    }

    pub fn get_file(&self, path: &Path) -> Option<&CachedFile> {
        self.files.get(path)
    }

    /// The cached counterpart of `job`: same rule and same inputs.
    pub fn get_job(&self, job: &Job) -> Option<&CachedJob> {
        self.jobs.get(&job.id).filter(|cached| {
            cached.rule == job.rule
                && cached.inputs.len() == job.inputs.len()
                && job
                    .inputs
                    .iter()
                    .all(|(slot, m)| cached.inputs.get(slot) == Some(&m.file))
        })
    }

    /// A file is modified if the cache has never seen it or its
    /// modification time changed.
    pub fn is_file_modified(&self, file: &File) -> bool {
        self.files
            .get(&file.path)
            .is_none_or(|cached| cached.write_time != file.write_time)
    }

    /// A job is modified if its action or rule changed or any of its input
    /// or output files did.
    pub fn is_job_modified(
        &self,
        job: &Job,
        registry: &Registry,
        rules: &RuleSet,
        catalog: &FileCatalog,
    ) -> bool {
        let Some(rule) = rules.get(&job.rule) else {
            return true;
        };
        if registry.is_modified(&rule.action) || rule.modified {
            return true;
        }
        job.input_paths()
            .chain(job.outputs.iter().map(PathBuf::as_path))
            .any(|path| {
                catalog
                    .get_file(path)
                    .is_none_or(|file| self.is_file_modified(&file))
            })
    }

    /// Try to skip `job` by adopting the results of its cached counterpart.
    ///
    /// Cached outputs are registered in the catalog at the job's pass. On
    /// success the job and all of its files are marked used and alias links
    /// between its inputs and outputs are restored.
    pub fn reuse(
        &self,
        job: &mut Job,
        registry: &Registry,
        rules: &RuleSet,
        catalog: &FileCatalog,
    ) -> bool {
        let Some(cached) = self.get_job(job) else {
            return false;
        };

        for output in &cached.outputs {
            if catalog.add_file(output, job.pass).is_none() {
                job.outputs.clear();
                return false;
            }
            job.outputs.insert(output.clone());
        }

        if self.is_job_modified(job, registry, rules, catalog) {
            job.outputs.clear();
            return false;
        }

        job.flags.modified = false;
        job.flags.used = true;
        for input in job.inputs.values() {
            catalog.mark_used(&input.file);
            let alias = self
                .files
                .get(&input.file)
                .and_then(|cached| cached.alias.as_ref())
                .filter(|alias| job.outputs.contains(*alias));
            if let Some(alias) = alias {
                catalog.set_alias(&input.file, alias);
            }
        }
        for output in &job.outputs {
            let id = job.id;
            catalog.update(output, |file| {
                file.flags.used = true;
                file.source = Some(id);
            });
        }
        true
    }

    pub fn jobs_len(&self) -> usize {
        self.jobs.len()
    }

    pub fn files_len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.files.is_empty()
    }
}

fn restore_job(
    key: &str,
    record: JobRecord,
    rules: &RuleSet,
    files: &HashMap<PathBuf, CachedFile>,
) -> Option<(JobId, CachedJob)> {
    let id: JobId = key.parse().ok()?;
    let rule = rules.get(&record.rule)?;

    let mut inputs = BTreeMap::new();
    for input in &record.inputs {
        let path = PathBuf::from(input);
        if !files.contains_key(&path) {
            return None;
        }
        let matched = rule.match_path(&path, input)?;
        if inputs.insert(matched.slot_index, path).is_some() {
            return None;
        }
    }

    let mut outputs = BTreeSet::new();
    for output in &record.outputs {
        let path = PathBuf::from(output);
        if !files.contains_key(&path) {
            return None;
        }
        outputs.insert(path);
    }

    let rehashed = JobId::compute(
        &record.rule,
        inputs.iter().map(|(slot, path)| (*slot, path.as_path())),
    );
    if rehashed != id {
        return None;
    }

    Some((
        id,
        CachedJob {
            rule: record.rule,
            inputs,
            outputs,
        },
    ))
}

/// Write the document as pretty JSON plus a Graphviz graph next to it
/// (`<stem>.dot`).
pub fn save(document: &CacheDocument, path: &Path) -> Result<(), CacheError> {
    let json = serde_json::to_string_pretty(document)?;
    std::fs::write(path, json)?;
    save_graph(document, &path.with_extension("dot"))
}

/// Write only the job graph.
pub fn save_graph(document: &CacheDocument, path: &Path) -> Result<(), CacheError> {
    std::fs::write(path, document.to_dot())?;
    Ok(())
}
