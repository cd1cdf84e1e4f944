//! Action authoring helpers for Kiln.
//!
//! Everything an action implementation needs, without pulling in the
//! engine's scheduling and cache types.

pub use rhi_kiln_core::{
    Action, ActionDecl, ActionError, Context, DEFAULT_OUTPUT, InputMatch, Job, JobId, Options,
    OptionsExt, Value,
};

/// Paths of all inputs of a job, in slot order.
pub fn input_files(job: &Job) -> Vec<std::path::PathBuf> {
    job.input_paths().map(std::path::Path::to_path_buf).collect()
}

/// The single input of a job, or `MissingInput` naming the slot.
pub fn single_input<'a>(job: &'a Job, slot: &str) -> Result<&'a InputMatch, ActionError> {
    job.input(slot)
        .ok_or_else(|| ActionError::MissingInput(slot.to_string()))
}
