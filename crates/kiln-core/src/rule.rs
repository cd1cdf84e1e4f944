//! Rules: which files are processed by which action into which outputs.
//!
//! Rules are declared in rule files spread over the input tree. Each file is
//! an object keyed by rule id:
//!
//! ```json
//! {
//!   "textures": {
//!     "pass": 10,
//!     "action": "copy",
//!     "input": { "in": "<input-path>/<rule-path>/(.*)\\.png$" },
//!     "output": "<build-path/><rule-path/><in:1>.tex",
//!     "options": {}
//!   }
//! }
//! ```
//!
//! The same structure is accepted as YAML (`.yaml`/`.yml`) or TOML (`.toml`).

use crate::catalog::File;
use crate::options::Options;
use crate::pattern::InputPattern;
use crate::registry::Registry;
use crate::settings::Roots;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Output name used when a rule declares a single output template.
pub const DEFAULT_OUTPUT: &str = "default";

/// A file matched against one input slot of a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct InputMatch {
    /// Position of the slot in the rule's (name-ordered) inputs.
    pub slot_index: usize,
    pub slot: String,
    pub file: PathBuf,
    /// Capture groups of the slot pattern; index 0 is the whole match.
    pub captures: Vec<Option<String>>,
}

/// A loaded rule.
#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub pass: u32,
    pub action: String,
    /// Directory of the rule file, relative to the input root.
    pub path: PathBuf,
    pub inputs: BTreeMap<String, InputPattern>,
    /// Capture indices ignored when grouping matches into jobs.
    pub group_by: BTreeSet<usize>,
    pub outputs: BTreeMap<String, String>,
    pub options: Options,
    /// True unless a cache holds an identical definition.
    pub modified: bool,
    pending: Mutex<Vec<InputMatch>>,
}

impl Rule {
    /// Create a rule with no inputs or outputs.
    pub fn new(id: impl Into<String>, pass: u32, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pass,
            action: action.into(),
            path: PathBuf::new(),
            inputs: BTreeMap::new(),
            group_by: BTreeSet::new(),
            outputs: BTreeMap::new(),
            options: Options::new(),
            modified: true,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Set the rule directory.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Add an input slot.
    pub fn input(mut self, slot: impl Into<String>, pattern: InputPattern) -> Self {
        self.inputs.insert(slot.into(), pattern);
        self
    }

    /// Add an output template.
    pub fn output(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), template.into());
        self
    }

    /// Ignore a capture index when grouping.
    pub fn group_by(mut self, index: usize) -> Self {
        self.group_by.insert(index);
        self
    }

    /// Set the options.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Number of components in the rule directory.
    pub fn depth(&self) -> usize {
        self.path.components().count()
    }

    /// Name of the slot at `index`.
    pub fn slot_name(&self, index: usize) -> Option<&str> {
        self.inputs.keys().nth(index).map(String::as_str)
    }

    /// Match a path against the input slots in order; the first hit wins.
    pub fn match_path(&self, file: &Path, key: &str) -> Option<InputMatch> {
        self.inputs
            .iter()
            .enumerate()
            .find_map(|(slot_index, (slot, pattern))| {
                pattern.captures(key).map(|captures| InputMatch {
                    slot_index,
                    slot: slot.clone(),
                    file: file.to_path_buf(),
                    captures,
                })
            })
    }

    pub(crate) fn push_match(&self, input: InputMatch) {
        self.pending.lock().push(input);
    }

    pub(crate) fn take_matches(&self) -> Vec<InputMatch> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Errors found while reading rule files.
///
/// Per-rule errors never abort loading; they are logged and the rule is
/// skipped.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rule file: {0}")]
    Parse(String),

    #[error("rule file must contain an object keyed by rule id")]
    NotAnObject,

    #[error("rule \"{id}\": {reason}")]
    Invalid { id: String, reason: String },

    #[error("rule id \"{0}\" is not a unique identifier")]
    Duplicate(String),

    #[error("rule \"{id}\" references a non-existing action \"{action}\"")]
    UnknownAction { id: String, action: String },

    #[error("rule \"{id}\": invalid regular expression \"{pattern}\": {source}")]
    Pattern {
        id: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A rule as written in a rule file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDecl {
    pub pass: u32,
    pub action: String,
    pub input: BTreeMap<String, String>,
    #[serde(default, rename = "group-by")]
    pub group_by: Vec<usize>,
    pub output: OutputDecl,
    pub options: Options,
}

/// Either a single output template or a map of named templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputDecl {
    Single(String),
    Named(BTreeMap<String, String>),
}

impl OutputDecl {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            OutputDecl::Single(template) => {
                BTreeMap::from([(DEFAULT_OUTPUT.to_string(), template)])
            }
            OutputDecl::Named(map) => map,
        }
    }
}

impl RuleDecl {
    /// Compile the declaration into a rule.
    pub fn compile(
        self,
        id: &str,
        rule_path: &Path,
        roots: &Roots,
        actions: &Registry,
    ) -> Result<Rule, RuleError> {
        if !actions.contains(&self.action) {
            return Err(RuleError::UnknownAction {
                id: id.to_string(),
                action: self.action,
            });
        }

        let mut rule = Rule::new(id, self.pass, self.action).path(rule_path);
        for (slot, raw) in self.input {
            let pattern =
                InputPattern::from_rule(&raw, roots, rule_path).map_err(|source| {
                    RuleError::Pattern {
                        id: id.to_string(),
                        pattern: raw.clone(),
                        source,
                    }
                })?;
            rule.inputs.insert(slot, pattern);
        }
        rule.group_by = self.group_by.into_iter().collect();
        rule.outputs = self.output.into_map();
        rule.options = self.options;
        Ok(rule)
    }
}

/// Parse a rule document, choosing the format from the file extension.
pub fn parse_document(data: &str, path: &Path) -> Result<serde_json::Value, RuleError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    let parsed = match extension.as_deref() {
        Some("yaml" | "yml") => serde_yaml::from_str(data).map_err(|e| e.to_string()),
        Some("toml") => toml::from_str(data).map_err(|e| e.to_string()),
        _ => serde_json::from_str(data).map_err(|e| e.to_string()),
    };
    parsed.map_err(RuleError::Parse)
}

/// The globally ordered list of rules.
///
/// Sorted by pass, then by depth of the rule directory, so that scheduling
/// and matching precedence are deterministic.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule at its sorted position (after equal keys).
    pub fn insert(&mut self, rule: Rule) -> Result<(), RuleError> {
        if self.get(&rule.id).is_some() {
            return Err(RuleError::Duplicate(rule.id));
        }
        let key = (rule.pass, rule.depth());
        let position = self.rules.partition_point(|r| (r.pass, r.depth()) <= key);
        self.rules.insert(position, rule);
        Ok(())
    }

    /// Read one rule file and insert every valid rule in it.
    ///
    /// Returns the number of rules added. Invalid entries are logged and
    /// skipped; only an unreadable or unparseable file is an error.
    pub fn read_rules(
        &mut self,
        file: &Path,
        rule_path: &Path,
        roots: &Roots,
        actions: &Registry,
    ) -> Result<usize, RuleError> {
        let data = std::fs::read_to_string(file)?;
        let document = parse_document(&data, file)?;
        let serde_json::Value::Object(entries) = document else {
            return Err(RuleError::NotAnObject);
        };

        let mut added = 0;
        for (id, entry) in entries {
            let result = serde_json::from_value::<RuleDecl>(entry)
                .map_err(|e| RuleError::Invalid {
                    id: id.clone(),
                    reason: e.to_string(),
                })
                .and_then(|decl| decl.compile(&id, rule_path, roots, actions))
                .and_then(|rule| self.insert(rule));
            match result {
                Ok(()) => added += 1,
                Err(e) => tracing::warn!(file = %file.display(), "{e}"),
            }
        }
        Ok(added)
    }

    /// Find the rule a file belongs to.
    ///
    /// Only rules of a pass later than `current_pass` are considered, which
    /// keeps the pass graph acyclic. A file matches at most one rule.
    pub fn match_file(&self, file: &File, current_pass: u32) -> Option<(&Rule, InputMatch)> {
        self.rules
            .iter()
            .filter(|rule| rule.pass > current_pass)
            .find_map(|rule| rule.match_path(&file.path, &file.key).map(|m| (rule, m)))
    }

    /// The next pass after `previous` that has pending matches, or 0 when
    /// there is no more work.
    pub fn next_pass(&self, previous: u32) -> u32 {
        self.rules
            .iter()
            .filter(|rule| rule.pass > previous && rule.has_pending())
            .map(|rule| rule.pass)
            .min()
            .unwrap_or(0)
    }

    /// Rules scheduled in `pass`.
    pub fn at_pass(&self, pass: u32) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |rule| rule.pass == pass)
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Rule> {
        self.rules.iter_mut().find(|rule| rule.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub(crate) fn clear_modified(&mut self) {
        for rule in &mut self.rules {
            rule.modified = false;
        }
    }

    pub(crate) fn clear_pending(&self) {
        for rule in &self.rules {
            rule.take_matches();
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionDecl, ActionError};
    use crate::executor::Context;
    use crate::job::Job;
    use std::fs;

    struct Noop(ActionDecl);

    impl Action for Noop {
        fn decl(&self) -> &ActionDecl {
            &self.0
        }

        fn process(&self, _ctx: &Context<'_>, _job: &mut Job) -> Result<(), ActionError> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(Noop(ActionDecl::new("copy", "1")));
        registry
    }

    fn roots() -> Roots {
        Roots {
            input: PathBuf::from("/in"),
            build: PathBuf::from("/build"),
            output: PathBuf::from("/out"),
        }
    }

    fn file(path: &str) -> File {
        let dir = tempfile::tempdir().unwrap();
        let on_disk = dir.path().join("f");
        fs::write(&on_disk, "x").unwrap();
        let mut file = crate::catalog::FileCatalog::new()
            .add_file(&on_disk, 0)
            .unwrap();
        file.path = PathBuf::from(path);
        file.key = path.to_string();
        file
    }

    fn pattern(source: &str) -> InputPattern {
        InputPattern::compile(source).unwrap()
    }

    #[test]
    fn test_read_rules_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let rules_file = dir.path().join("rules.json");
        fs::write(
            &rules_file,
            r#"{
                "good": {"pass": 10, "action": "copy", "input": {"in": "\\.png$"},
                         "output": "<build-path/>x", "options": {}},
                "no-pass": {"action": "copy", "input": {"in": "a"}, "output": "b", "options": {}},
                "bad-pass": {"pass": "ten", "action": "copy", "input": {"in": "a"}, "output": "b", "options": {}},
                "no-options": {"pass": 1, "action": "copy", "input": {"in": "a"}, "output": "b"},
                "unknown-action": {"pass": 1, "action": "nope", "input": {"in": "a"}, "output": "b", "options": {}},
                "bad-regex": {"pass": 1, "action": "copy", "input": {"in": "(a"}, "output": "b", "options": {}},
                "bad-output": {"pass": 1, "action": "copy", "input": {"in": "a"}, "output": 5, "options": {}},
                "not-an-object": 12
            }"#,
        )
        .unwrap();

        let mut rules = RuleSet::new();
        let added = rules
            .read_rules(&rules_file, Path::new(""), &roots(), &registry())
            .unwrap();

        assert_eq!(added, 1);
        let rule = rules.get("good").unwrap();
        assert_eq!(rule.pass, 10);
        assert!(rule.modified);
        assert_eq!(rule.outputs.get(DEFAULT_OUTPUT).unwrap(), "<build-path/>x");
    }

    #[test]
    fn test_duplicate_ids_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        let body = r#"{"r": {"pass": 1, "action": "copy", "input": {"in": "x"}, "output": "y", "options": {}}}"#;
        fs::write(&a, body).unwrap();
        fs::write(&b, body).unwrap();

        let mut rules = RuleSet::new();
        assert_eq!(rules.read_rules(&a, Path::new(""), &roots(), &registry()).unwrap(), 1);
        assert_eq!(rules.read_rules(&b, Path::new(""), &roots(), &registry()).unwrap(), 0);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, "{ nope").unwrap();

        let mut rules = RuleSet::new();
        let result = rules.read_rules(&path, Path::new(""), &roots(), &registry());
        assert!(matches!(result, Err(RuleError::Parse(_))));

        fs::write(&path, "[1, 2]").unwrap();
        let result = rules.read_rules(&path, Path::new(""), &roots(), &registry());
        assert!(matches!(result, Err(RuleError::NotAnObject)));
    }

    #[test]
    fn test_yaml_and_toml_rule_files() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("rules.yaml");
        fs::write(
            &yaml,
            "meshes:\n  pass: 5\n  action: copy\n  input:\n    in: '\\.ply$'\n  group-by: [2]\n  output:\n    mesh: out.mesh\n  options:\n    optimize: true\n",
        )
        .unwrap();
        let toml_file = dir.path().join("rules.toml");
        fs::write(
            &toml_file,
            "[fonts]\npass = 7\naction = \"copy\"\noutput = \"x.font\"\n[fonts.input]\nin = '\\.ttf$'\n[fonts.options]\n",
        )
        .unwrap();

        let mut rules = RuleSet::new();
        assert_eq!(rules.read_rules(&yaml, Path::new(""), &roots(), &registry()).unwrap(), 1);
        assert_eq!(rules.read_rules(&toml_file, Path::new(""), &roots(), &registry()).unwrap(), 1);

        let meshes = rules.get("meshes").unwrap();
        assert!(meshes.group_by.contains(&2));
        assert_eq!(meshes.outputs.get("mesh").unwrap(), "out.mesh");
        assert_eq!(rules.get("fonts").unwrap().pass, 7);
    }

    #[test]
    fn test_rules_sorted_by_pass_then_depth() {
        let mut rules = RuleSet::new();
        rules.insert(Rule::new("deep-10", 10, "copy").path("a/b")).unwrap();
        rules.insert(Rule::new("root-20", 20, "copy")).unwrap();
        rules.insert(Rule::new("root-10", 10, "copy")).unwrap();
        rules.insert(Rule::new("shallow-10", 10, "copy").path("a")).unwrap();
        rules.insert(Rule::new("root-5", 5, "copy")).unwrap();

        let order: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["root-5", "root-10", "shallow-10", "deep-10", "root-20"]);
    }

    #[test]
    fn test_match_file_first_rule_and_slot_wins() {
        let mut rules = RuleSet::new();
        rules
            .insert(
                Rule::new("images", 10, "copy")
                    .input("a-color", pattern(r"(\w+)\.png$"))
                    .input("b-any", pattern(r".*")),
            )
            .unwrap();
        rules
            .insert(Rule::new("fallback", 20, "copy").input("in", pattern(r".*")))
            .unwrap();

        let png = file("/in/wall.png");
        let (rule, m) = rules.match_file(&png, 0).unwrap();
        assert_eq!(rule.id, "images");
        assert_eq!(m.slot_index, 0);
        assert_eq!(m.slot, "a-color");
        assert_eq!(m.captures[1].as_deref(), Some("wall"));

        let txt = file("/in/readme.txt");
        let (rule, m) = rules.match_file(&txt, 0).unwrap();
        assert_eq!(rule.id, "images");
        assert_eq!(m.slot, "b-any");
    }

    #[test]
    fn test_match_file_skips_earlier_passes() {
        let mut rules = RuleSet::new();
        rules
            .insert(Rule::new("ten", 10, "copy").input("in", pattern(r".*")))
            .unwrap();
        rules
            .insert(Rule::new("twenty", 20, "copy").input("in", pattern(r".*")))
            .unwrap();

        let f = file("/build/a.out");
        assert_eq!(rules.match_file(&f, 0).unwrap().0.id, "ten");
        assert_eq!(rules.match_file(&f, 10).unwrap().0.id, "twenty");
        assert!(rules.match_file(&f, 20).is_none());
    }

    #[test]
    fn test_next_pass() {
        let mut rules = RuleSet::new();
        rules.insert(Rule::new("ten", 10, "copy")).unwrap();
        rules.insert(Rule::new("twenty", 20, "copy")).unwrap();
        assert_eq!(rules.next_pass(0), 0);

        let m = InputMatch {
            slot_index: 0,
            slot: "in".into(),
            file: PathBuf::from("a"),
            captures: vec![],
        };
        rules.get("twenty").unwrap().push_match(m.clone());
        assert_eq!(rules.next_pass(0), 20);
        assert_eq!(rules.next_pass(20), 0);

        rules.get("ten").unwrap().push_match(m);
        assert_eq!(rules.next_pass(0), 10);
        assert_eq!(rules.next_pass(10), 20);

        rules.clear_pending();
        assert_eq!(rules.next_pass(0), 0);
    }
}
