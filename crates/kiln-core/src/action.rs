//! Action declarations and traits.

use crate::executor::Context;
use crate::job::Job;
use serde::{Deserialize, Serialize};

/// Declaration of an action's identity.
///
/// The version participates in staleness detection: bumping it invalidates
/// every cached job of the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDecl {
    /// Unique name rules refer to.
    pub name: String,
    /// Implementation version.
    pub version: String,
    /// Whether several jobs of this action may run at the same time.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

fn default_parallel() -> bool {
    true
}

impl ActionDecl {
    /// Create a new action declaration. Parallel execution is allowed by default.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            parallel: true,
            description: String::new(),
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Force jobs of this action to run one after another.
    ///
    /// Needed when the implementation relies on global state (e.g. a
    /// non-reentrant external library).
    pub fn serial(mut self) -> Self {
        self.parallel = false;
        self
    }
}

/// Trait for implementing actions.
///
/// `process` may be called from several threads at once unless the
/// declaration is [`serial`](ActionDecl::serial). Every produced file must be
/// registered through [`Context::push`] so later passes can pick it up.
pub trait Action: Send + Sync {
    /// Get the declaration for this action.
    fn decl(&self) -> &ActionDecl;

    /// Run one job.
    fn process(&self, ctx: &Context<'_>, job: &mut Job) -> Result<(), ActionError>;
}

/// Errors an action reports for a job.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action failed: {0}")]
    Failed(String),

    #[error("missing required input slot: {0}")]
    MissingInput(String),

    #[error("rule has no output named {0}")]
    MissingOutput(String),

    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("output could not be registered: {0}")]
    Unregistered(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
