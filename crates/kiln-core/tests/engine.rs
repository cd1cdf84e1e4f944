//! End-to-end scenarios over a scratch input tree.

use rhi_kiln_core::{
    Action, ActionDecl, ActionError, Context, Engine, Job, OptionsExt, UpdateSummary,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

/// Copies every input to the `out` template of its rule.
struct Convert {
    decl: ActionDecl,
    runs: Arc<AtomicUsize>,
}

impl Convert {
    fn new(version: &str) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let action = Self {
            decl: ActionDecl::new("convert", version),
            runs: Arc::clone(&runs),
        };
        (action, runs)
    }
}

impl Action for Convert {
    fn decl(&self) -> &ActionDecl {
        &self.decl
    }

    fn process(&self, ctx: &Context<'_>, job: &mut Job) -> Result<(), ActionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let output = ctx.output_path(job, "out", &[])?;
        let mut data = Vec::new();
        for input in job.inputs.values() {
            data.extend(fs::read(&input.file)?);
        }
        if ctx.options(job)?.bool_option("fail", false) {
            return Err(ActionError::Failed("asked to fail".into()));
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&output, data)?;
        ctx.push(job, &output)
    }
}

struct Tree {
    _dir: tempfile::TempDir,
    input: PathBuf,
    build: PathBuf,
    cache: PathBuf,
}

impl Tree {
    fn new(rules: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let input = root.join("in");
        let build = root.join("build");
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&build).unwrap();
        fs::write(input.join("rules.json"), rules).unwrap();
        Self {
            cache: root.join("cache.json"),
            _dir: dir,
            input,
            build,
        }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.input.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    /// Configure an engine, load rules and the cache, update, save the cache.
    fn run(&self, version: &str) -> (Engine, UpdateSummary, usize) {
        let (action, runs) = Convert::new(version);
        let mut engine = Engine::new();
        engine.register_action(action);
        engine.set_input_path(&self.input).unwrap();
        engine.set_build_path(&self.build).unwrap();
        engine.load_rules("rules.json").unwrap();
        engine.load_cache(&self.cache).unwrap();
        let summary = engine.update().unwrap();
        engine.save_cache(&self.cache).unwrap();
        let runs = runs.load(Ordering::SeqCst);
        (engine, summary, runs)
    }
}

fn touch(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    let later = SystemTime::now() + Duration::from_secs(10);
    file.set_modified(later).unwrap();
}

const CONVERT_RULE: &str = r#"{
    "R": {
        "pass": 10,
        "action": "convert",
        "input": { "in": "(.*)\\.src$" },
        "output": { "out": "<in:1>.out" },
        "options": {}
    }
}"#;

#[test]
fn test_touch_scenario() {
    let tree = Tree::new(CONVERT_RULE);
    let source = tree.write("a.src", "hello");
    let output = tree.input.join("a.out");

    let (engine, summary, runs) = tree.run("1.0");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(runs, 1);
    let produced = engine.get_file(&output).unwrap();
    assert_eq!(produced.pass, 10);
    assert_eq!(fs::read_to_string(&output).unwrap(), "hello");

    let (_, summary, runs) = tree.run("1.0");
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(runs, 0);

    touch(&source);
    let (engine, summary, _) = tree.run("1.0");
    assert_eq!(summary.succeeded, 1);
    assert!(engine.get_file(&output).is_some());
}

#[test]
fn test_version_bump_reprocesses() {
    let tree = Tree::new(CONVERT_RULE);
    tree.write("a.src", "hello");

    let (_, summary, _) = tree.run("1.0");
    assert_eq!(summary.succeeded, 1);

    let (_, summary, runs) = tree.run("1.1");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(runs, 1);

    let (_, summary, _) = tree.run("1.1");
    assert_eq!(summary.succeeded, 0);
}

#[test]
fn test_rule_change_reprocesses() {
    let tree = Tree::new(CONVERT_RULE);
    tree.write("a.src", "hello");
    tree.run("1.0");

    fs::write(
        tree.input.join("rules.json"),
        CONVERT_RULE.replace("\"options\": {}", "\"options\": {\"level\": 2}"),
    )
    .unwrap();
    let (_, summary, _) = tree.run("1.0");
    assert_eq!(summary.succeeded, 1);
}

#[test]
fn test_deleted_output_is_rebuilt() {
    let tree = Tree::new(CONVERT_RULE);
    tree.write("a.src", "hello");
    tree.run("1.0");

    fs::remove_file(tree.input.join("a.out")).unwrap();
    let (_, summary, _) = tree.run("1.0");
    assert_eq!(summary.succeeded, 1);
    assert!(tree.input.join("a.out").exists());
}

#[test]
fn test_repeated_update_in_one_process_is_incremental() {
    let tree = Tree::new(CONVERT_RULE);
    tree.write("a.src", "a");
    tree.write("b.src", "b");

    let (action, runs) = Convert::new("1.0");
    let mut engine = Engine::new();
    engine.register_action(action);
    engine.set_input_path(&tree.input).unwrap();
    engine.load_rules("rules.json").unwrap();

    assert_eq!(engine.update().unwrap().succeeded, 2);
    let second = engine.update().unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

const CHAIN_RULES: &str = r#"{
    "first": {
        "pass": 10,
        "action": "convert",
        "input": { "in": "(\\w+)\\.src$" },
        "output": { "out": "<build-path/><in:1>.mid" },
        "options": {}
    },
    "second": {
        "pass": 20,
        "action": "convert",
        "input": { "in": "(.*)\\.mid$" },
        "output": { "out": "<in:1>.fin" },
        "options": {}
    }
}"#;

#[test]
fn test_outputs_flow_into_later_passes() {
    let tree = Tree::new(CHAIN_RULES);
    tree.write("a.src", "a");

    let (engine, summary, _) = tree.run("1");
    assert_eq!(summary.succeeded, 2);

    let mid = engine.get_file(tree.build.join("a.mid")).unwrap();
    let fin = engine.get_file(tree.build.join("a.fin")).unwrap();
    assert_eq!(mid.pass, 10);
    assert_eq!(fin.pass, 20);
    assert!(mid.pass < fin.pass);

    let first = engine.jobs().iter().find(|job| job.rule == "first").unwrap();
    assert_eq!(mid.source, Some(first.id));

    let (_, summary, _) = tree.run("1");
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.skipped, 2);
}

/// The intermediate file lands in the input tree, so the scan finds it too.
const IN_TREE_CHAIN_RULES: &str = r#"{
    "first": {
        "pass": 10,
        "action": "convert",
        "input": { "in": "(.*)\\.src$" },
        "output": { "out": "<in:1>.mid" },
        "options": {}
    },
    "second": {
        "pass": 20,
        "action": "convert",
        "input": { "in": "(\\w+)\\.mid$" },
        "output": { "out": "<build-path/><in:1>.fin" },
        "options": {}
    }
}"#;

#[test]
fn test_scanned_intermediate_runs_once() {
    let tree = Tree::new(IN_TREE_CHAIN_RULES);
    let source = tree.write("a.src", "a");

    let (engine, summary, runs) = tree.run("1");
    assert_eq!(summary.succeeded, 2);
    assert_eq!(runs, 2);
    assert_eq!(engine.jobs().len(), 2);

    let (engine, summary, runs) = tree.run("1");
    assert_eq!(summary, UpdateSummary { succeeded: 0, failed: 0, skipped: 2 });
    assert_eq!(runs, 0);
    assert_eq!(engine.jobs().len(), 2);

    // The intermediate is rewritten; with coarse timestamps `second` may
    // still count as current, but neither rule may schedule a job twice.
    touch(&source);
    let (engine, summary, runs) = tree.run("1");
    assert_eq!(summary.failed, 0);
    assert!(summary.succeeded >= 1);
    assert_eq!(summary.succeeded + summary.skipped, 2);
    assert_eq!(runs, summary.succeeded);
    assert_eq!(engine.jobs().len(), 2);
    assert_eq!(fs::read_to_string(tree.build.join("a.fin")).unwrap(), "a");
}

#[test]
fn test_same_pass_outputs_are_not_rematched() {
    let tree = Tree::new(
        r#"{
            "loop": {
                "pass": 10,
                "action": "convert",
                "input": { "in": "(.*)\\.src$" },
                "output": { "out": "<in:1>.x.src" },
                "options": {}
            }
        }"#,
    );
    tree.write("a.src", "a");

    let (_, summary, _) = tree.run("1");
    assert_eq!(summary.succeeded, 1);
}

#[test]
fn test_grouping_combines_inputs() {
    let tree = Tree::new(
        r#"{
            "materials": {
                "pass": 10,
                "action": "convert",
                "input": {
                    "a-diffuse": "(\\w+)_(diffuse)\\.png$",
                    "b-normal": "(\\w+)_(normal)\\.png$"
                },
                "group-by": [2],
                "output": { "out": "<build-path/><a-diffuse:1>.mat" },
                "options": {}
            }
        }"#,
    );
    tree.write("brick_diffuse.png", "D");
    tree.write("brick_normal.png", "N");
    tree.write("wood_diffuse.png", "d");
    tree.write("wood_normal.png", "n");

    let (engine, summary, _) = tree.run("1");
    assert_eq!(summary.succeeded, 2);
    assert_eq!(engine.jobs().len(), 2);
    assert_eq!(fs::read_to_string(tree.build.join("brick.mat")).unwrap(), "DN");
    assert_eq!(fs::read_to_string(tree.build.join("wood.mat")).unwrap(), "dn");
}

#[test]
fn test_failed_jobs_are_retried() {
    let tree = Tree::new(
        r#"{
            "broken": {
                "pass": 10,
                "action": "convert",
                "input": { "in": "(.*)\\.src$" },
                "output": { "out": "<in:1>.out" },
                "options": { "fail": true }
            }
        }"#,
    );
    tree.write("a.src", "a");
    tree.write("b.src", "b");

    let (engine, summary, _) = tree.run("1");
    assert_eq!(summary, UpdateSummary { succeeded: 0, failed: 2, skipped: 0 });
    assert!(engine.jobs().is_empty());

    let (_, summary, runs) = tree.run("1");
    assert_eq!(summary.failed, 2);
    assert_eq!(runs, 2);
}

#[test]
fn test_rule_path_placeholder() {
    let tree = Tree::new("{}");
    tree.write(
        "textures/rules.json",
        r#"{
            "textures": {
                "pass": 10,
                "action": "convert",
                "input": { "in": "<input-path>/<rule-path>/(\\w+)\\.src$" },
                "output": { "out": "<build-path/><rule-path/><in:1>.tex" },
                "options": {}
            }
        }"#,
    );
    tree.write("textures/wall.src", "w");
    tree.write("other/wall.src", "o");

    let (engine, summary, _) = tree.run("1");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(engine.rules().get("textures").unwrap().path, Path::new("textures"));
    assert_eq!(
        fs::read_to_string(tree.build.join("textures/wall.tex")).unwrap(),
        "w"
    );
}

#[test]
fn test_cache_roundtrip_and_graph() {
    let tree = Tree::new(CONVERT_RULE);
    tree.write("a.src", "a");
    let (engine, _, _) = tree.run("1.0");

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&tree.cache).unwrap()).unwrap();
    assert_eq!(json["actions"]["convert"], "1.0");
    assert_eq!(json["rules"]["R"]["pass"], 10);
    let job = &engine.jobs()[0];
    let record = &json["jobs"][job.id.to_string()];
    assert_eq!(record["rule"], "R");
    assert_eq!(record["outputs"].as_array().unwrap().len(), 1);

    let dot = fs::read_to_string(tree.cache.with_extension("dot")).unwrap();
    assert!(dot.contains(&format!("R#{}", job.id)));

    let graph = tree.build.join("graph.dot");
    engine.save_cache_graph(&graph).unwrap();
    assert_eq!(fs::read_to_string(graph).unwrap(), dot);
}

#[test]
fn test_collect_garbage_drops_unused_entries() {
    let tree = Tree::new(
        r#"{
            "R": {
                "pass": 10,
                "action": "convert",
                "input": { "in": "(\\w+)\\.src$" },
                "output": { "out": "<build-path/><in:1>.out" },
                "options": {}
            }
        }"#,
    );
    let stale = tree.write("b.src", "b");
    tree.write("a.src", "a");

    let (action, _) = Convert::new("1");
    let mut engine = Engine::new();
    engine.register_action(action);
    engine.set_input_path(&tree.input).unwrap();
    engine.set_build_path(&tree.build).unwrap();
    engine.load_rules("rules.json").unwrap();
    assert_eq!(engine.update().unwrap().succeeded, 2);

    fs::remove_file(&stale).unwrap();
    let summary = engine.update().unwrap();
    assert_eq!(summary.skipped, 1);

    let removed = engine.collect_garbage();
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&stale));
    assert!(removed.contains(&tree.build.join("b.out")));
    assert!(engine.get_file(&stale).is_none());
    assert!(engine.get_file(tree.build.join("a.out")).is_some());
    // Garbage collection leaves the disk alone.
    assert!(tree.build.join("b.out").exists());
}
