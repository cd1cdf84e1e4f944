//! Input patterns and output templates.
//!
//! Rule inputs are regular expressions searched in the `/`-separated path of
//! a file. Before compilation the root placeholders are replaced with the
//! (escaped) configured paths. Output templates use the same placeholders
//! plus `<slot:N>` capture references.

use crate::settings::Roots;
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};

/// The placeholders recognised in patterns and templates, in substitution order.
const ROOT_PLACEHOLDERS: [&str; 4] = ["input-path", "build-path", "output-path", "rule-path"];

/// Render a path with `/` separators, the form patterns are matched against.
pub fn generic_string(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Collapse runs of `/` into one.
///
/// Placeholders that expand to an empty string (e.g. the rule path of a rule
/// file at the input root) otherwise leave `//` behind.
pub fn merge_slashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous_slash = false;
    for c in input.chars() {
        if c == '/' {
            if !previous_slash {
                out.push(c);
            }
            previous_slash = true;
        } else {
            out.push(c);
            previous_slash = false;
        }
    }
    out
}

fn root_value<'a>(name: &str, roots: &'a Roots, rule_path: &'a Path) -> &'a Path {
    match name {
        "input-path" => &roots.input,
        "build-path" => &roots.build,
        "output-path" => &roots.output,
        _ => rule_path,
    }
}

/// Replace `<name/>` and `<name>` root placeholders in `input`.
///
/// `escape` is applied to every substituted path (regex escaping for input
/// patterns, identity for output templates).
fn substitute_roots(
    mut input: String,
    roots: &Roots,
    rule_path: &Path,
    escape: impl Fn(&str) -> String,
) -> String {
    for name in ROOT_PLACEHOLDERS {
        let value = generic_string(root_value(name, roots, rule_path));
        let value = escape(&value);
        let with_slash = if value.is_empty() {
            String::new()
        } else {
            format!("{value}/")
        };
        input = input.replace(&format!("<{name}/>"), &with_slash);
        input = input.replace(&format!("<{name}>"), &value);
    }
    input
}

/// Turn leftover `<…>` markers into literal `$…$` sentinels.
fn neutralize_brackets(input: &str) -> String {
    input.replace(['<', '>'], "$")
}

/// A compiled rule input pattern.
///
/// Keeps the expanded source string: rules are compared (and cached) by it.
#[derive(Debug, Clone)]
pub struct InputPattern {
    source: String,
    regex: Regex,
}

impl InputPattern {
    /// Compile an already expanded pattern string.
    pub fn compile(source: impl Into<String>) -> Result<Self, regex::Error> {
        let source = source.into();
        let regex = RegexBuilder::new(&source).case_insensitive(true).build()?;
        Ok(Self { source, regex })
    }

    /// Expand placeholders in a raw pattern from a rule file and compile it.
    pub fn from_rule(raw: &str, roots: &Roots, rule_path: &Path) -> Result<Self, regex::Error> {
        let expanded = substitute_roots(raw.to_string(), roots, rule_path, regex::escape);
        Self::compile(merge_slashes(&neutralize_brackets(&expanded)))
    }

    /// The expanded pattern source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Search the pattern in `haystack`, returning every capture group.
    ///
    /// Index 0 is the whole match; groups that did not participate are `None`.
    pub fn captures(&self, haystack: &str) -> Option<Vec<Option<String>>> {
        self.regex.captures(haystack).map(|caps| {
            caps.iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect()
        })
    }

    /// Check whether the pattern occurs anywhere in `haystack`.
    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }
}

impl PartialEq for InputPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Expand an output template into a path.
///
/// `captures` yields, per filled input slot, the slot name and the groups
/// captured when the input was matched. `custom` holds action-supplied
/// variables (`<name>`).
pub fn expand_template<'a>(
    template: &str,
    roots: &Roots,
    rule_path: &Path,
    captures: impl IntoIterator<Item = (&'a str, &'a [Option<String>])>,
    custom: &[(&str, &str)],
) -> PathBuf {
    let mut expanded = substitute_roots(template.to_string(), roots, rule_path, str::to_string);
    for (slot, groups) in captures {
        for (index, group) in groups.iter().enumerate() {
            if let Some(value) = group {
                expanded = expanded.replace(&format!("<{slot}:{index}>"), value);
            }
        }
    }
    for (name, value) in custom {
        expanded = expanded.replace(&format!("<{name}>"), value);
    }
    PathBuf::from(merge_slashes(&neutralize_brackets(&expanded)))
}
