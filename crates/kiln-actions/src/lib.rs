//! Built-in file actions for Kiln.
//!
//! These actions only move bytes around; real asset converters live in
//! their own crates and implement the same [`Action`] trait.
//!
//! # Features
//!
//! - `copy` (default) - copy each input to its output template
//! - `concat` (default) - concatenate all inputs of a job, e.g. to group
//!   related resources with `group-by`
//! - `supersede` (default) - copy and alias the input to the copy, so later
//!   references to the input resolve to the produced file

use rhi_kiln_core::Engine;
use rhi_kiln_plugin::{
    Action, ActionDecl, ActionError, Context, DEFAULT_OUTPUT, InputMatch, Job,
    input_files, single_input,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Register all enabled actions with the engine.
pub fn register_all(engine: &mut Engine) {
    #[cfg(feature = "copy")]
    engine.register_action(CopyAction::new());
    #[cfg(feature = "concat")]
    engine.register_action(ConcatAction::new());
    #[cfg(feature = "supersede")]
    engine.register_action(SupersedeAction::new());
}

/// Names of the enabled actions.
pub fn enabled_actions() -> Vec<&'static str> {
    vec![
        #[cfg(feature = "copy")]
        "copy",
        #[cfg(feature = "concat")]
        "concat",
        #[cfg(feature = "supersede")]
        "supersede",
    ]
}

/// Variables describing an input file, usable in output templates as
/// `<slot>`, `<file-name>`, `<file-stem>` and `<extension>`.
fn input_variables(input: &InputMatch) -> [(&'static str, String); 4] {
    let part = |s: Option<&std::ffi::OsStr>| {
        s.map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    [
        ("slot", input.slot.clone()),
        ("file-name", part(input.file.file_name())),
        ("file-stem", part(input.file.file_stem())),
        ("extension", part(input.file.extension())),
    ]
}

fn expand_for(ctx: &Context<'_>, job: &Job, input: &InputMatch) -> Result<PathBuf, ActionError> {
    let variables = input_variables(input);
    let custom: Vec<(&str, &str)> = variables.iter().map(|(k, v)| (*k, v.as_str())).collect();
    ctx.output_path(job, DEFAULT_OUTPUT, &custom)
}

fn write_output(path: &Path, data: &[u8]) -> Result<(), ActionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<(), ActionError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    Ok(())
}

// ============================================================================
// copy
// ============================================================================

/// Copies every input of a job to the `default` output template.
pub struct CopyAction {
    decl: ActionDecl,
}

impl CopyAction {
    pub fn new() -> Self {
        Self {
            decl: ActionDecl::new("copy", "1.0")
                .description("Copy each input to its output template"),
        }
    }
}

impl Default for CopyAction {
    fn default() -> Self {
        Self::new()
    }
}

impl Action for CopyAction {
    fn decl(&self) -> &ActionDecl {
        &self.decl
    }

    fn process(&self, ctx: &Context<'_>, job: &mut Job) -> Result<(), ActionError> {
        let mut targets = Vec::with_capacity(job.inputs.len());
        for input in job.inputs.values() {
            let target = expand_for(ctx, job, input)?;
            if targets.iter().any(|(_, existing)| *existing == target) {
                return Err(ActionError::Failed(format!(
                    "several inputs map to {}",
                    target.display()
                )));
            }
            targets.push((input.file.clone(), target));
        }

        for (source, target) in targets {
            copy_file(&source, &target)?;
            ctx.push(job, &target)?;
        }
        Ok(())
    }
}

// ============================================================================
// concat
// ============================================================================

/// Concatenates all inputs of a job, in slot order, into the `default`
/// output.
///
/// Option `separator` (string) is written between inputs.
pub struct ConcatAction {
    decl: ActionDecl,
}

impl ConcatAction {
    pub fn new() -> Self {
        Self {
            decl: ActionDecl::new("concat", "1.0")
                .description("Concatenate all inputs of a job into one output"),
        }
    }
}

impl Default for ConcatAction {
    fn default() -> Self {
        Self::new()
    }
}

impl Action for ConcatAction {
    fn decl(&self) -> &ActionDecl {
        &self.decl
    }

    fn process(&self, ctx: &Context<'_>, job: &mut Job) -> Result<(), ActionError> {
        let options = ctx.options(job)?;
        let separator = match options.get("separator") {
            None => "",
            Some(value) => value.as_str().ok_or_else(|| ActionError::InvalidOption {
                name: "separator".into(),
                reason: format!("expected a string, got {}", value.kind()),
            })?,
        };

        let mut data = Vec::new();
        for (index, file) in input_files(job).iter().enumerate() {
            if index > 0 {
                data.extend_from_slice(separator.as_bytes());
            }
            data.extend(fs::read(file)?);
        }

        let output = ctx.output_path(job, DEFAULT_OUTPUT, &[])?;
        write_output(&output, &data)?;
        tracing::debug!(inputs = job.inputs.len(), output = %output.display(), "concatenated");
        ctx.push(job, &output)
    }
}

// ============================================================================
// supersede
// ============================================================================

/// Copies the `in` input to the `default` output and aliases the input to
/// the copy.
///
/// Serial: jobs of this action rewrite alias links shared by the whole
/// catalog, so they run one at a time in enumeration order.
pub struct SupersedeAction {
    decl: ActionDecl,
}

impl SupersedeAction {
    pub fn new() -> Self {
        Self {
            decl: ActionDecl::new("supersede", "1.0")
                .description("Copy the input and make the copy replace it")
                .serial(),
        }
    }
}

impl Default for SupersedeAction {
    fn default() -> Self {
        Self::new()
    }
}

impl Action for SupersedeAction {
    fn decl(&self) -> &ActionDecl {
        &self.decl
    }

    fn process(&self, ctx: &Context<'_>, job: &mut Job) -> Result<(), ActionError> {
        let input = single_input(job, "in")?;
        let source = input.file.clone();
        let target = expand_for(ctx, job, input)?;

        copy_file(&source, &target)?;
        ctx.push(job, &target)?;
        if !ctx.alias(&source, &target) {
            tracing::warn!(
                from = %source.display(),
                to = %target.display(),
                "could not record alias"
            );
        }
        Ok(())
    }
}
