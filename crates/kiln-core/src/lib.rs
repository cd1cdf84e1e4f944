//! Kiln: incremental asset build pipeline
//!
//! Kiln discovers source files, matches them against declarative rules,
//! groups matches into jobs and runs those jobs through pluggable actions.
//! Produced files are matched again by rules of later passes. A cache of the
//! previous run lets unchanged jobs be skipped.

mod action;
mod cache;
mod catalog;
mod engine;
mod error;
mod executor;
mod job;
mod options;
mod pattern;
mod registry;
mod rule;
mod settings;

pub use action::{Action, ActionDecl, ActionError};
pub use cache::{
    Cache, CacheDocument, CacheError, CachedFile, CachedJob, FileRecord, JobRecord, RuleRecord,
};
pub use catalog::{EntityFlags, File, FileCatalog, write_time};
pub use engine::{Engine, UpdateSummary};
pub use error::EngineError;
pub use executor::{Context, ExecutionStats, run_job, run_jobs};
#[cfg(feature = "parallel")]
pub use executor::build_pool;
pub use job::{Job, JobId, build_jobs};
pub use options::{Options, OptionsExt, Value};
pub use pattern::{InputPattern, expand_template, generic_string, merge_slashes};
pub use registry::{RegisteredAction, Registry};
pub use rule::{DEFAULT_OUTPUT, InputMatch, OutputDecl, Rule, RuleDecl, RuleError, RuleSet};
pub use settings::{DEFAULT_RULES_FILENAME, RootKind, Roots, Settings};
