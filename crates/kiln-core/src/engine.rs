//! The engine: configuration, rule loading and the pass scheduler.

use crate::action::Action;
use crate::cache::{self, Cache, CacheDocument};
use crate::catalog::{File, FileCatalog};
use crate::error::EngineError;
#[cfg(feature = "parallel")]
use crate::executor::build_pool;
use crate::executor::{Context, run_jobs};
use crate::job::{Job, build_jobs};
use crate::registry::Registry;
use crate::rule::RuleSet;
use crate::settings::{RootKind, Roots, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Job counts of one [`Engine::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Jobs that ran and succeeded.
    pub succeeded: usize,
    /// Jobs that ran and failed.
    pub failed: usize,
    /// Jobs skipped because the cache proved them up to date.
    pub skipped: usize,
}

/// An incremental build of an input tree.
///
/// Every mutating call takes `&mut self`; callers that share an engine
/// between threads wrap it in their own lock. Work inside [`update`] runs in
/// parallel where actions allow it.
///
/// [`update`]: Engine::update
#[derive(Debug, Default)]
pub struct Engine {
    roots: Roots,
    settings: Settings,
    registry: Registry,
    rules: RuleSet,
    catalog: FileCatalog,
    cache: Cache,
    jobs: Vec<Job>,
}

/// Regular files below `root`, sorted by name per directory.
fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| !entry.file_type().is_dir())
        .map(walkdir::DirEntry::into_path)
}

impl Engine {
    /// Create an engine with no actions, rules or paths.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with the given settings.
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    fn set_path(&mut self, kind: RootKind, path: &Path) -> Result<(), EngineError> {
        let invalid = || EngineError::InvalidPath {
            kind,
            path: path.to_path_buf(),
        };
        if !path.is_dir() {
            return Err(invalid());
        }
        let canonical = path.canonicalize().map_err(|_| invalid())?;
        self.roots.set(kind, canonical);
        Ok(())
    }

    /// Set the root of the source tree. Must be an existing directory.
    pub fn set_input_path(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        self.set_path(RootKind::Input, path.as_ref())
    }

    /// Set the directory for intermediate files. Must be an existing directory.
    pub fn set_build_path(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        self.set_path(RootKind::Build, path.as_ref())
    }

    /// Set the directory for final outputs. Must be an existing directory.
    pub fn set_output_path(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        self.set_path(RootKind::Output, path.as_ref())
    }

    /// 0 = pass summaries only, 1 = one line per job, 2 = one line per match.
    pub fn set_verbose(&mut self, verbose: u32) {
        self.settings.verbose = verbose;
    }

    /// Limit the worker threads used for parallel jobs.
    pub fn set_threads(&mut self, threads: Option<usize>) {
        self.settings.threads = threads;
    }

    /// Register an action. Must happen before rules referring to it are loaded.
    pub fn register_action(&mut self, action: impl Action + 'static) {
        self.registry.register(action);
    }

    /// Register an action that is already shared.
    pub fn register_arc(&mut self, action: Arc<dyn Action>) {
        self.registry.register_arc(action);
    }

    /// Read every rule file named `rules_filename` below the input root.
    ///
    /// Replaces previously loaded rules. Returns the number of rules loaded.
    pub fn load_rules(&mut self, rules_filename: &str) -> Result<usize, EngineError> {
        let input = self.require(RootKind::Input)?.to_path_buf();
        self.settings.rules_filename = rules_filename.to_string();
        self.rules = RuleSet::new();

        let mut total = 0;
        for path in walk_files(&input) {
            if path.file_name().is_none_or(|name| name != rules_filename) {
                continue;
            }
            let rule_path = path
                .parent()
                .and_then(|dir| dir.strip_prefix(&input).ok())
                .unwrap_or(Path::new(""))
                .to_path_buf();
            match self
                .rules
                .read_rules(&path, &rule_path, &self.roots, &self.registry)
            {
                Ok(count) => {
                    tracing::info!(path = %path.display(), rules = count, "loaded rule file");
                    total += count;
                }
                Err(e) => tracing::warn!(path = %path.display(), "{e}"),
            }
        }
        Ok(total)
    }

    /// Load a cache written by [`save_cache`](Engine::save_cache).
    ///
    /// Must follow [`load_rules`](Engine::load_rules). Returns false if there
    /// was no usable cache.
    pub fn load_cache(&mut self, path: impl AsRef<Path>) -> Result<bool, EngineError> {
        Ok(self
            .cache
            .load(path.as_ref(), &mut self.registry, &mut self.rules)?)
    }

    fn capture(&self) -> CacheDocument {
        CacheDocument::capture(&self.registry, &self.rules, &self.catalog, &self.jobs)
    }

    /// Write the state of the last update, plus a `.dot` graph next to it.
    pub fn save_cache(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        cache::save(&self.capture(), path)?;
        tracing::info!(path = %path.display(), jobs = self.jobs.len(), "saved cache");
        Ok(())
    }

    /// Write only the job graph of the last update.
    pub fn save_cache_graph(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        Ok(cache::save_graph(&self.capture(), path.as_ref())?)
    }

    fn require(&self, kind: RootKind) -> Result<&Path, EngineError> {
        let path = self.roots.get(kind);
        if path.as_os_str().is_empty() {
            return Err(EngineError::MissingPath(kind));
        }
        Ok(path)
    }

    /// Bring the build up to date.
    ///
    /// Walks the input tree, then runs passes in increasing order until no
    /// rule has pending matches. Jobs the cache proves current are skipped;
    /// the rest run through their actions. Failed jobs never abort the run.
    pub fn update(&mut self) -> Result<UpdateSummary, EngineError> {
        let input = self.require(RootKind::Input)?.to_path_buf();

        self.catalog.reset_run_flags();
        self.rules.clear_pending();
        self.jobs.clear();

        let mut summary = UpdateSummary::default();
        let mut kept = Vec::new();
        #[cfg(feature = "parallel")]
        let pool = build_pool(self.settings.threads);
        {
            let ctx = Context::new(
                &self.roots,
                &self.settings,
                &self.registry,
                &self.rules,
                &self.catalog,
            );
            #[cfg(feature = "parallel")]
            let ctx = match pool.as_ref() {
                Some(pool) => ctx.with_pool(pool),
                None => ctx,
            };

            let mut sources = 0;
            for path in walk_files(&input) {
                if self.catalog.add_file(&path, 0).is_some() {
                    ctx.match_file(&path, 0);
                    sources += 1;
                }
            }
            tracing::info!(files = sources, "scanned input tree");

            let mut pass = 0;
            loop {
                pass = self.rules.next_pass(pass);
                if pass == 0 {
                    break;
                }

                let mut jobs = Vec::new();
                for rule in self.rules.at_pass(pass) {
                    jobs.extend(build_jobs(rule, rule.take_matches()));
                }

                let mut stale = Vec::new();
                let mut skipped = 0;
                for mut job in jobs {
                    if self
                        .cache
                        .reuse(&mut job, &self.registry, &self.rules, &self.catalog)
                    {
                        for output in &job.outputs {
                            ctx.match_file(output, job.pass);
                        }
                        skipped += 1;
                        kept.push(job);
                    } else {
                        stale.push(job);
                    }
                }

                let stats = run_jobs(&ctx, &mut stale);
                kept.extend(stale.into_iter().filter(|job| !job.flags.failed));

                tracing::info!(
                    pass,
                    succeeded = stats.succeeded,
                    failed = stats.failed,
                    skipped,
                    "finished pass"
                );
                summary.succeeded += stats.succeeded;
                summary.failed += stats.failed;
                summary.skipped += skipped;
            }
        }
        self.jobs = kept;

        let document = self.capture();
        self.cache.ingest(document, &self.rules);
        self.registry.clear_modified();
        self.rules.clear_modified();

        Ok(summary)
    }

    /// Drop catalog entries that were not used by the last update.
    ///
    /// Files on disk are not touched.
    pub fn collect_garbage(&mut self) -> Vec<PathBuf> {
        let removed = self.catalog.collect_garbage();
        for path in &removed {
            tracing::info!(path = %path.display(), "unused file");
        }
        removed
    }

    /// Catalog entry of `path`, if the file is known.
    pub fn get_file(&self, path: impl AsRef<Path>) -> Option<File> {
        self.catalog.get_file(path.as_ref())
    }

    /// The configured root directories.
    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    /// Current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registered actions.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Loaded rules, in scheduling order.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Jobs that ran or were reused in the last update, excluding failures.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_path_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();

        let mut engine = Engine::new();
        assert!(matches!(
            engine.set_input_path(dir.path().join("missing")),
            Err(EngineError::InvalidPath { kind: RootKind::Input, .. })
        ));
        assert!(matches!(
            engine.set_build_path(&file),
            Err(EngineError::InvalidPath { kind: RootKind::Build, .. })
        ));

        engine.set_output_path(dir.path()).unwrap();
        assert_eq!(engine.roots().output, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_update_requires_input_path() {
        let mut engine = Engine::new();
        assert!(matches!(
            engine.update(),
            Err(EngineError::MissingPath(RootKind::Input))
        ));
        assert!(matches!(
            engine.load_rules("rules.json"),
            Err(EngineError::MissingPath(RootKind::Input))
        ));
    }

    #[test]
    fn test_update_without_rules_marks_sources_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let mut engine = Engine::new();
        engine.set_input_path(dir.path()).unwrap();
        let summary = engine.update().unwrap();
        assert_eq!(summary, UpdateSummary::default());

        let file = engine.get_file(engine.roots().input.join("a.txt")).unwrap();
        assert!(file.flags.used);
        assert_eq!(file.pass, 0);
        assert!(engine.collect_garbage().is_empty());
    }
}
