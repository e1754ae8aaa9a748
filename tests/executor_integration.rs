// tests/executor_integration.rs

//! End-to-end recipe execution against local file:// sources

mod common;

use common::TestKitchen;
use galley::kitchen::{
    FetchError, FetchSource, PatchFailure, PatchTool, StageError, StepFailure,
};
use galley::recipe::BuildStep;
use galley::{MismatchPolicy, Recipe, RecipeExecutor, Stage, parse_recipe, validate_recipe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Recipe whose build appends to `{marker}` and installs `{bin}/demo`
const DEMO: &str = r#"
id = "demo"
version = "1.0"
description = "integration fixture"
homepage = "https://example.com/"
url = "@URL@"
sha256 = "@SHA@"

[variables]
marker = "@MARKER@"

[[build_steps]]
phase = "configure"
run = { program = "./configure" }

[[build_steps]]
phase = "build"
run = { program = "sh", args = ["-c", "echo built >> {marker}"] }

[[build_steps]]
phase = "install"
run = { program = "sh", args = ["-c", "mkdir -p {bin} && printf 'demo 1.0\n' > {bin}/demo"] }

[test_step]
command = { program = "cat", args = ["{bin}/demo"] }
expect_output = "demo 1.0"
"#;

fn demo_recipe(kitchen: &TestKitchen, url: &str, sha: &str) -> Recipe {
    let marker = kitchen.path().join("builds.log");
    let recipe = parse_recipe(
        &DEMO
            .replace("@URL@", url)
            .replace("@SHA@", sha)
            .replace("@MARKER@", &marker.to_string_lossy()),
    )
    .unwrap();
    validate_recipe(&recipe).unwrap();
    recipe
}

/// A `sh -c` build step in `phase`
fn shell_step(phase: &str, script: &str) -> BuildStep {
    parse_recipe(&format!(
        "id = \"s\"\nversion = \"1\"\nurl = \"https://example.com/s-1.tar.gz\"\n\
         sha256 = \"{}\"\n[[build_steps]]\nphase = \"{phase}\"\n\
         run = {{ program = \"sh\", args = [\"-c\", {script:?}] }}\n",
        "0".repeat(64)
    ))
    .unwrap()
    .build_steps
    .remove(0)
}

fn build_dirs_left(kitchen: &TestKitchen) -> usize {
    std::fs::read_dir(kitchen.path().join("build"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[test]
fn test_install_is_idempotent() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let recipe = demo_recipe(&kitchen, &url, &sha);
    let executor = RecipeExecutor::new(kitchen.config.clone()).unwrap();

    let first = executor.execute(&recipe).unwrap();
    assert!(!first.reused);
    assert_eq!(first.source, Some(FetchSource::Primary(url.clone())));
    assert_eq!(first.steps.len(), 3);
    assert!(first.test.is_some());
    assert!(first.record.files.iter().any(|f| f.path.ends_with("bin/demo")));
    assert_eq!(kitchen.marker_lines("builds.log"), 1);

    let second = executor.execute(&recipe).unwrap();
    assert!(second.reused);
    assert!(second.steps.is_empty());
    assert_eq!(second.record.files, first.record.files);
    assert_eq!(kitchen.marker_lines("builds.log"), 1);
}

#[test]
fn test_removed_file_triggers_rebuild() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let recipe = demo_recipe(&kitchen, &url, &sha);
    let executor = RecipeExecutor::new(kitchen.config.clone()).unwrap();

    executor.execute(&recipe).unwrap();
    std::fs::remove_file(kitchen.prefix("demo").join("bin/demo")).unwrap();

    let rebuilt = executor.execute(&recipe).unwrap();
    assert!(!rebuilt.reused);
    assert_eq!(rebuilt.source, Some(FetchSource::Cache));
    assert_eq!(kitchen.marker_lines("builds.log"), 2);
    assert!(kitchen.prefix("demo").join("bin/demo").exists());
}

#[test]
fn test_unreachable_primary_falls_back_to_mirror() {
    let kitchen = TestKitchen::new();
    let (mirror, sha) = kitchen.publish_source("demo-1.0");
    let missing = common::file_url(&kitchen.path().join("sources/missing.tar.gz"));
    let mut recipe = demo_recipe(&kitchen, &missing, &sha);
    recipe.mirrors = vec![mirror.clone()];

    let result = RecipeExecutor::new(kitchen.config.clone())
        .unwrap()
        .execute(&recipe)
        .unwrap();
    assert_eq!(result.source, Some(FetchSource::Mirror { index: 0, url: mirror }));
}

#[test]
fn test_hash_mismatch_aborts_unless_mirrors_allowed() {
    let kitchen = TestKitchen::new();
    let (good, sha) = kitchen.publish_source("demo-1.0");
    let (bad, _) = kitchen.publish("tampered.tar.gz", b"not the release");
    let mut recipe = demo_recipe(&kitchen, &bad, &sha);
    recipe.mirrors = vec![good.clone()];

    let err = RecipeExecutor::new(kitchen.config.clone())
        .unwrap()
        .execute(&recipe)
        .unwrap_err();
    assert_eq!(err.stage, Stage::Fetching);
    assert!(matches!(err.cause, StageError::Fetch(FetchError::HashMismatch { ref url, .. }) if *url == bad));
    assert_eq!(kitchen.marker_lines("builds.log"), 0);

    let mut config = kitchen.config.clone();
    config.on_hash_mismatch = MismatchPolicy::TryMirrors;
    let result = RecipeExecutor::new(config).unwrap().execute(&recipe).unwrap();
    assert_eq!(result.source, Some(FetchSource::Mirror { index: 0, url: good }));
}

/// Accepts the first patch, rejects every later one
#[derive(Default)]
struct RejectAfterFirst {
    calls: AtomicUsize,
}

impl PatchTool for RejectAfterFirst {
    fn apply(&self, _source_dir: &Path, _patch_file: &Path, _strip: u32) -> Result<(), String> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(()),
            _ => Err("2 out of 2 hunks FAILED".to_string()),
        }
    }
}

#[test]
fn test_second_patch_conflict_stops_at_patching() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let (first_url, first_sha) = kitchen.publish("0001-fix.patch", b"--- a/x\n+++ b/x\n");
    let (second_url, second_sha) = kitchen.publish("0002-fix.patch", b"--- a/y\n+++ b/y\n");
    let mut recipe = demo_recipe(&kitchen, &url, &sha);
    recipe.patches = parse_recipe(&format!(
        "id = \"p\"\nversion = \"1\"\nurl = \"{url}\"\nsha256 = \"{sha}\"\n\
         [[patches]]\nurl = \"{first_url}\"\nsha256 = \"{first_sha}\"\n\
         [[patches]]\nurl = \"{second_url}\"\nsha256 = \"{second_sha}\"\nstrip = 0\n"
    ))
    .unwrap()
    .patches;

    let tool = Arc::new(RejectAfterFirst::default());
    let executor = RecipeExecutor::new(kitchen.config.clone())
        .unwrap()
        .with_patch_tool(tool.clone());
    let err = executor.execute(&recipe).unwrap_err();

    assert_eq!(err.stage, Stage::Patching);
    match &err.cause {
        StageError::Patch(patch) => {
            assert_eq!(patch.index, 1);
            assert_eq!(patch.url, second_url);
            assert!(matches!(patch.reason, PatchFailure::ApplyConflict(_)));
        }
        other => panic!("unexpected cause: {other}"),
    }
    assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    assert_eq!(kitchen.marker_lines("builds.log"), 0);
    assert!(executor.records().load("demo", "1.0").unwrap().is_none());
    assert!(!kitchen.prefix("demo").exists());
}

#[test]
fn test_build_failure_skips_install() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let mut recipe = demo_recipe(&kitchen, &url, &sha);
    recipe.build_steps[1] = parse_recipe(&format!(
        "id = \"b\"\nversion = \"1\"\nurl = \"{url}\"\nsha256 = \"{sha}\"\n\
         [[build_steps]]\nphase = \"build\"\n\
         run = {{ program = \"sh\", args = [\"-c\", \"echo compiling; echo 'error: boom' >&2; exit 3\"] }}\n"
    ))
    .unwrap()
    .build_steps
    .remove(0);

    let executor = RecipeExecutor::new(kitchen.config.clone()).unwrap();
    let err = executor.execute(&recipe).unwrap_err();

    assert_eq!(err.stage, Stage::Building);
    let output = err.captured_output().unwrap();
    assert!(output.stdout.contains("compiling"));
    assert!(output.stderr.contains("error: boom"));
    match &err.cause {
        StageError::Build(build) => {
            assert_eq!(build.step, 1);
            assert_eq!(build.exit_code, Some(3));
            assert!(matches!(build.reason, StepFailure::NonZeroExit { code: Some(3) }));
        }
        other => panic!("unexpected cause: {other}"),
    }
    assert!(err.to_string().contains("failed at building"));
    assert!(!kitchen.prefix("demo").join("bin/demo").exists());
    assert!(executor.records().load("demo", "1.0").unwrap().is_none());
}

#[test]
fn test_batch_runs_independent_recipes() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let first = demo_recipe(&kitchen, &url, &sha);
    let mut second = first.clone();
    second.id = "demo-two".to_string();

    let results = RecipeExecutor::new(kitchen.config.clone())
        .unwrap()
        .execute_batch(&[first, second]);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().record.id, "demo");
    assert_eq!(results[1].as_ref().unwrap().record.id, "demo-two");
    assert!(kitchen.prefix("demo-two").join("bin/demo").exists());
    assert_eq!(kitchen.marker_lines("builds.log"), 2);
}

#[test]
fn test_rebuild_keeps_files_the_build_did_not_touch() {
    let kitchen = TestKitchen::new();
    let tarball = common::source_tarball(
        "demo-1.0",
        &[
            ("configure", "#!/bin/sh\necho configured\n", 0o755),
            ("include/demo.h", "int demo(void);\n", 0o644),
            ("include/demo_version.h", "#define DEMO_VERSION 1\n", 0o644),
        ],
    );
    let (url, sha) = kitchen.publish("demo-1.0.tar.gz", &tarball);
    let mut recipe = demo_recipe(&kitchen, &url, &sha);
    recipe
        .build_steps
        .push(shell_step("install", "mkdir -p {include} && cp -p include/*.h {include}/"));
    let executor = RecipeExecutor::new(kitchen.config.clone()).unwrap();

    let first = executor.execute(&recipe).unwrap();
    let headers = |record: &galley::kitchen::InstallRecord| {
        record
            .files
            .iter()
            .filter(|f| f.path.extension().is_some_and(|ext| ext == "h"))
            .count()
    };
    assert_eq!(headers(&first.record), 2);

    std::fs::remove_file(kitchen.prefix("demo").join("include/demo.h")).unwrap();
    let rebuilt = executor.execute(&recipe).unwrap();
    assert!(!rebuilt.reused);
    assert_eq!(headers(&rebuilt.record), 2);
    assert_eq!(rebuilt.record.files.len(), first.record.files.len());
    assert!(rebuilt.record.is_intact());

    let third = executor.execute(&recipe).unwrap();
    assert!(third.reused);
    assert_eq!(kitchen.marker_lines("builds.log"), 2);
}

#[test]
fn test_failed_rebuild_leaves_no_stale_record() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let mut recipe = demo_recipe(&kitchen, &url, &sha);
    let executor = RecipeExecutor::new(kitchen.config.clone()).unwrap();

    executor.execute(&recipe).unwrap();
    std::fs::remove_file(kitchen.prefix("demo").join("bin/demo")).unwrap();
    recipe.build_steps[1] = shell_step("build", "exit 1");

    let err = executor.execute(&recipe).unwrap_err();
    assert_eq!(err.stage, Stage::Building);
    assert!(executor.records().load("demo", "1.0").unwrap().is_none());
    assert!(!executor.records().record_path("demo", "1.0").exists());
}

#[test]
fn test_recipe_timeout_kills_lingering_build() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let mut recipe = demo_recipe(&kitchen, &url, &sha);
    recipe.build_steps[1] = shell_step("build", "sleep 20 & echo started");
    let mut config = kitchen.config.clone();
    config.timeout = 2;
    let executor = RecipeExecutor::new(config).unwrap();

    let started = Instant::now();
    let err = executor.execute(&recipe).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(err.stage, Stage::Building);
    match &err.cause {
        StageError::Build(build) => {
            assert_eq!(build.step, 1);
            assert!(matches!(build.reason, StepFailure::Timeout));
            assert!(build.output.stdout.contains("started"));
        }
        other => panic!("unexpected cause: {other}"),
    }
    assert!(executor.records().load("demo", "1.0").unwrap().is_none());
    assert!(!kitchen.prefix("demo").join("bin/demo").exists());
    assert_eq!(build_dirs_left(&kitchen), 0);
}

#[test]
fn test_cancel_stops_running_build() {
    let kitchen = TestKitchen::new();
    let (url, sha) = kitchen.publish_source("demo-1.0");
    let mut recipe = demo_recipe(&kitchen, &url, &sha);
    recipe.build_steps[1] = shell_step("build", "sleep 30");
    let executor = RecipeExecutor::new(kitchen.config.clone()).unwrap();

    let cancel = executor.cancel_token().clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
    });

    let started = Instant::now();
    let err = executor.execute(&recipe).unwrap_err();
    canceller.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(matches!(
        err.cause,
        StageError::Cancelled
            | StageError::Build(galley::kitchen::BuildStepError {
                reason: StepFailure::Cancelled,
                ..
            })
    ));
    assert!(executor.records().load("demo", "1.0").unwrap().is_none());
    assert!(!kitchen.prefix("demo").join("bin/demo").exists());
    assert_eq!(build_dirs_left(&kitchen), 0);
}
