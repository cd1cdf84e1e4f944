//! Executor: runs the stale jobs of a pass through their actions.
//!
//! Jobs whose action is declared serial run as one chain, in enumeration
//! order. All other jobs are submitted independently. With the `parallel`
//! feature both happen on a rayon pool and the call returns once the chain
//! and every independent job have finished. Without it, jobs run one after
//! another on the calling thread.

use crate::action::{Action, ActionError};
use crate::catalog::FileCatalog;
use crate::job::Job;
use crate::options::Options;
use crate::pattern::expand_template;
use crate::registry::Registry;
use crate::rule::{Rule, RuleSet};
use crate::settings::{Roots, Settings};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Everything an action may touch while running a job.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    roots: &'a Roots,
    settings: &'a Settings,
    registry: &'a Registry,
    rules: &'a RuleSet,
    catalog: &'a FileCatalog,
    #[cfg(feature = "parallel")]
    pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> Context<'a> {
    pub fn new(
        roots: &'a Roots,
        settings: &'a Settings,
        registry: &'a Registry,
        rules: &'a RuleSet,
        catalog: &'a FileCatalog,
    ) -> Self {
        Self {
            roots,
            settings,
            registry,
            rules,
            catalog,
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Run parallel work on `pool` instead of the global rayon pool.
    #[cfg(feature = "parallel")]
    pub fn with_pool(mut self, pool: &'a rayon::ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// The configured root directories.
    pub fn roots(&self) -> &'a Roots {
        self.roots
    }

    pub fn verbose(&self) -> u32 {
        self.settings.verbose
    }

    pub fn catalog(&self) -> &'a FileCatalog {
        self.catalog
    }

    /// The rule that created `job`.
    pub fn rule(&self, job: &Job) -> Result<&'a Rule, ActionError> {
        self.rules
            .get(&job.rule)
            .ok_or_else(|| ActionError::Failed(format!("unknown rule \"{}\"", job.rule)))
    }

    /// The options of the rule that created `job`.
    pub fn options(&self, job: &Job) -> Result<&'a Options, ActionError> {
        self.rule(job).map(|rule| &rule.options)
    }

    /// Expand the output template `name` of the job's rule.
    ///
    /// Captures of every filled slot are available as `<slot:N>`; `custom`
    /// supplies additional `<name>` variables.
    pub fn output_path(
        &self,
        job: &Job,
        name: &str,
        custom: &[(&str, &str)],
    ) -> Result<PathBuf, ActionError> {
        let rule = self.rule(job)?;
        let template = rule
            .outputs
            .get(name)
            .ok_or_else(|| ActionError::MissingOutput(name.to_string()))?;
        let captures = job
            .inputs
            .values()
            .map(|m| (m.slot.as_str(), m.captures.as_slice()));
        Ok(expand_template(
            template,
            self.roots,
            &rule.path,
            captures,
            custom,
        ))
    }

    /// Register a file the job produced.
    ///
    /// The file must exist. It is added to the catalog at the job's pass and
    /// records the job as its source.
    pub fn push(&self, job: &mut Job, path: &Path) -> Result<(), ActionError> {
        if self.catalog.add_file(path, job.pass).is_none() {
            return Err(ActionError::Unregistered(path.display().to_string()));
        }
        let id = job.id;
        self.catalog.update(path, |file| {
            file.flags.used = true;
            file.source = Some(id);
        });
        job.outputs.insert(path.to_path_buf());
        Ok(())
    }

    /// Record that `from` is superseded by `to`.
    pub fn alias(&self, from: &Path, to: &Path) -> bool {
        self.catalog.set_alias(from, to)
    }

    /// Offer a known file to the rules of later passes.
    ///
    /// The file is marked used even when nothing matches it. Rule files
    /// themselves are never matched. Returns whether a rule took the file.
    pub fn match_file(&self, path: &Path, current_pass: u32) -> bool {
        let Some(file) = self.catalog.get_file(path) else {
            return false;
        };
        self.catalog.mark_used(path);
        if path
            .file_name()
            .is_some_and(|name| name == self.settings.rules_filename.as_str())
        {
            return false;
        }

        match self.rules.match_file(&file, current_pass) {
            Some((rule, input)) => {
                if self.verbose() >= 2 {
                    tracing::info!(rule = %rule.id, slot = %input.slot, "matched {}", file.key);
                } else {
                    tracing::trace!(rule = %rule.id, slot = %input.slot, "matched {}", file.key);
                }
                rule.push_match(input);
                true
            }
            None => {
                if self.verbose() >= 2 {
                    tracing::info!("no rule matches {}", file.key);
                }
                false
            }
        }
    }

    fn action(&self, job: &Job) -> Result<Arc<dyn Action>, ActionError> {
        let rule = self.rule(job)?;
        self.registry
            .get(&rule.action)
            .map(|registered| Arc::clone(&registered.implementation))
            .ok_or_else(|| ActionError::Failed(format!("unknown action \"{}\"", rule.action)))
    }

    fn is_parallel(&self, job: &Job) -> bool {
        self.action(job).is_ok_and(|action| action.decl().parallel)
    }
}

/// Outcome counts of a batch of jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn record(&self, ok: bool) {
        let counter = if ok { &self.succeeded } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn into_stats(self) -> ExecutionStats {
        ExecutionStats {
            succeeded: self.succeeded.into_inner(),
            failed: self.failed.into_inner(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn display_paths<'p>(paths: impl Iterator<Item = &'p Path>) -> String {
    paths
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_failure(job: &Job, reason: &str) {
    tracing::error!(
        rule = %job.rule,
        inputs = %display_paths(job.input_paths()),
        outputs = %display_paths(job.outputs.iter().map(PathBuf::as_path)),
        "job failed: {reason}"
    );
}

/// Run one job. Errors and panics of the action mark the job failed.
pub fn run_job(ctx: &Context<'_>, job: &mut Job) -> bool {
    let action = match ctx.action(job) {
        Ok(action) => action,
        Err(e) => {
            job.flags.failed = true;
            describe_failure(job, &e.to_string());
            return false;
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| action.process(ctx, job)));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(format!("action panicked: {}", panic_message(payload.as_ref()))),
    };
    if let Some(reason) = failure {
        job.flags.failed = true;
        describe_failure(job, &reason);
        return false;
    }

    job.flags.failed = false;
    job.flags.used = true;
    for input in job.input_paths() {
        ctx.catalog.mark_used(input);
    }
    if ctx.verbose() >= 1 {
        let inputs = display_paths(job.input_paths());
        for output in &job.outputs {
            tracing::info!(rule = %job.rule, "{inputs} -> {}", output.display());
        }
    }
    for output in &job.outputs {
        let id = job.id;
        ctx.catalog.update(output, |file| {
            file.flags.used = true;
            file.source = Some(id);
        });
        ctx.match_file(output, job.pass);
    }
    true
}

/// Run a batch of jobs and wait for all of them.
pub fn run_jobs(ctx: &Context<'_>, jobs: &mut [Job]) -> ExecutionStats {
    let counters = Counters::default();
    run_with(ctx, jobs, &counters);
    counters.into_stats()
}

#[cfg(feature = "parallel")]
fn run_with(ctx: &Context<'_>, jobs: &mut [Job], counters: &Counters) {
    let (serial, parallel): (Vec<&mut Job>, Vec<&mut Job>) =
        jobs.iter_mut().partition(|job| !ctx.is_parallel(job));

    let work = move || {
        rayon::scope(move |s| {
            s.spawn(move |_| {
                for job in serial {
                    counters.record(run_job(ctx, job));
                }
            });
            for job in parallel {
                s.spawn(move |_| counters.record(run_job(ctx, job)));
            }
        })
    };

    match ctx.pool {
        Some(pool) => pool.install(work),
        None => work(),
    }
}

/// A dedicated pool of `threads` workers, or `None` to use the global pool.
#[cfg(feature = "parallel")]
pub fn build_pool(threads: Option<usize>) -> Option<rayon::ThreadPool> {
    let threads = threads?;
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => Some(pool),
        Err(e) => {
            tracing::warn!(threads, error = %e, "cannot build worker pool, using the global one");
            None
        }
    }
}

#[cfg(not(feature = "parallel"))]
fn run_with(ctx: &Context<'_>, jobs: &mut [Job], counters: &Counters) {
    for job in jobs {
        counters.record(run_job(ctx, job));
    }
}
