// src/kitchen/executor.rs

//! Recipe execution
//!
//! One recipe moves through
//! `pending -> fetching -> patching -> building -> testing -> installed`.
//! Any stage can end in `failed`, attributed to the stage that was running.
//! Nothing is retried; a failed recipe is executed again from `pending`.
//!
//! The install record is written last, after the test passed, so its
//! presence means the whole recipe succeeded. A later execution that finds a
//! matching, intact record returns it without touching the network or the
//! build tools.

use crate::config::{InstallLayout, KitchenConfig};
use crate::kitchen::archive::{extract_archive, source_root};
use crate::kitchen::certs::{ExpiryCheck, X509Expiry};
use crate::kitchen::fetch::{FetchError, FetchResult, FetchSource, Fetcher, HttpTransport, Transport};
use crate::kitchen::patch::{PatchApplier, PatchCommand, PatchError, PatchFailure, PatchTool};
use crate::kitchen::process::{CancelToken, CapturedOutput};
use crate::kitchen::record::{InstallRecord, RecordStore, Snapshot};
use crate::kitchen::steps::{BuildStepError, BuildStepRunner, StepReport, TestError};
use crate::recipe::{Recipe, TemplateVars, substitute};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A non-terminal stage of execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pending,
    Fetching,
    Patching,
    Building,
    Testing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Patching => "patching",
            Self::Building => "building",
            Self::Testing => "testing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Running(Stage),
    Installed,
    Failed { at_stage: Stage },
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(stage) => stage.fmt(f),
            Self::Installed => f.write_str("installed"),
            Self::Failed { at_stage } => write!(f, "failed at {}", at_stage),
        }
    }
}

/// What went wrong inside a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to unpack source: {0}")]
    Unpack(#[source] io::Error),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Build(#[from] BuildStepError),

    #[error(transparent)]
    Test(#[from] TestError),

    #[error(transparent)]
    Template(crate::Error),

    #[error("failed to prepare build directory: {0}")]
    Workspace(#[source] io::Error),

    #[error("install record: {0}")]
    Record(crate::Error),

    #[error("not installed; run install first")]
    NotInstalled,

    #[error("cancelled")]
    Cancelled,
}

/// Failure of one recipe, attributed to a stage
#[derive(Debug, Error)]
#[error("{id}: failed at {stage}: {cause}")]
pub struct ExecutionError {
    pub id: String,
    pub stage: Stage,
    #[source]
    pub cause: StageError,
}

impl ExecutionError {
    pub fn state(&self) -> ExecutionState {
        ExecutionState::Failed {
            at_stage: self.stage,
        }
    }

    /// Output of the failing step or test, if the failure came from one
    pub fn captured_output(&self) -> Option<&CapturedOutput> {
        match &self.cause {
            StageError::Build(err) => Some(&err.output),
            StageError::Test(err) => Some(&err.output),
            _ => None,
        }
        .filter(|output| !output.is_empty())
    }
}

/// Successful execution of one recipe
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub record: InstallRecord,
    /// True when an existing record was reused and nothing ran
    pub reused: bool,
    /// Where the source came from (`None` when reused)
    pub source: Option<FetchSource>,
    pub steps: Vec<StepReport>,
    pub test: Option<StepReport>,
    /// States visited, in order
    pub transitions: Vec<ExecutionState>,
}

/// Tracks the state machine for one execution
struct Progress<'a> {
    id: &'a str,
    stage: Stage,
    transitions: Vec<ExecutionState>,
    cancel: &'a CancelToken,
}

impl<'a> Progress<'a> {
    fn new(id: &'a str, cancel: &'a CancelToken) -> Self {
        Self {
            id,
            stage: Stage::Pending,
            transitions: vec![ExecutionState::Running(Stage::Pending)],
            cancel,
        }
    }

    fn enter(&mut self, stage: Stage) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(StageError::Cancelled));
        }
        info!("{}: {} -> {}", self.id, self.stage, stage);
        self.stage = stage;
        self.transitions.push(ExecutionState::Running(stage));
        Ok(())
    }

    fn fail(&self, cause: impl Into<StageError>) -> ExecutionError {
        let cause = cause.into();
        warn!("{}: failed at {}: {}", self.id, self.stage, cause);
        ExecutionError {
            id: self.id.to_string(),
            stage: self.stage,
            cause,
        }
    }

    fn finish(mut self) -> Vec<ExecutionState> {
        info!("{}: {} -> installed", self.id, self.stage);
        self.transitions.push(ExecutionState::Installed);
        self.transitions
    }
}

/// Runs recipes through fetch, patch, build, test and record
pub struct RecipeExecutor {
    config: KitchenConfig,
    fetcher: Fetcher,
    patch_tool: Arc<dyn PatchTool>,
    expiry: Arc<dyn ExpiryCheck>,
    records: RecordStore,
    cancel: CancelToken,
}

impl RecipeExecutor {
    /// Executor with the HTTP transport, `patch(1)` and X.509 parsing
    pub fn new(config: KitchenConfig) -> crate::Result<Self> {
        let transport = HttpTransport::new(config.http_timeout())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: KitchenConfig, transport: Arc<dyn Transport>) -> Self {
        let fetcher =
            Fetcher::new(transport, &config.source_cache).with_policy(config.on_hash_mismatch);
        let records = RecordStore::new(&config.state_dir);
        Self {
            config,
            fetcher,
            patch_tool: Arc::new(PatchCommand),
            expiry: Arc::new(X509Expiry),
            records,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_patch_tool(mut self, tool: Arc<dyn PatchTool>) -> Self {
        self.patch_tool = tool;
        self
    }

    pub fn with_expiry_check(mut self, check: Arc<dyn ExpiryCheck>) -> Self {
        self.expiry = check;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &KitchenConfig {
        &self.config
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Execute one recipe, or return its existing install record
    pub fn execute(&self, recipe: &Recipe) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        let mut progress = Progress::new(&recipe.id, &self.cancel);
        let layout = self.config.layout_for(recipe);

        let _lock = self
            .records
            .lock(&recipe.id)
            .map_err(|e| progress.fail(StageError::Record(e)))?;

        let previous = self.load_record(recipe);
        if let Some(record) = previous
            .as_ref()
            .filter(|record| Self::is_reusable(record, recipe, &layout))
        {
            info!(
                "{} is already installed ({} files), skipping",
                recipe.full_version(),
                record.files.len()
            );
            return Ok(ExecutionResult {
                record: record.clone(),
                reused: true,
                source: None,
                steps: Vec::new(),
                test: None,
                transitions: progress.finish(),
            });
        }
        if previous.is_some() {
            // The stale record must not outlive a failed rebuild
            debug!("Existing record for {} is stale", recipe.full_version());
            self.records
                .remove(&recipe.id, &recipe.version)
                .map_err(|e| progress.fail(StageError::Record(e)))?;
        }

        progress.enter(Stage::Fetching)?;
        let fetched = self
            .fetcher
            .fetch_source(recipe)
            .map_err(|e| progress.fail(e))?;

        let build_dir = self
            .create_build_dir(recipe)
            .map_err(|e| progress.fail(StageError::Workspace(e)))?;
        let outcome = self.cook(recipe, &fetched, build_dir.path(), &mut progress, started);

        if self.config.keep_builddir {
            let kept = build_dir.keep();
            info!("Keeping build directory {}", kept.display());
        }

        let (built, test) = outcome?;
        let files = built
            .snapshot
            .manifest(&layout.roots(), previous.as_ref())
            .map_err(|e| progress.fail(StageError::Record(e.into())))?;
        let record = InstallRecord::new(recipe, layout, files);
        self.records
            .save(&record)
            .map_err(|e| progress.fail(StageError::Record(e)))?;

        info!(
            "Installed {} ({} files) in {:.1}s",
            recipe.full_version(),
            record.files.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(ExecutionResult {
            record,
            reused: false,
            source: Some(fetched.source),
            steps: built.reports,
            test,
            transitions: progress.finish(),
        })
    }

    fn load_record(&self, recipe: &Recipe) -> Option<InstallRecord> {
        self.records
            .load(&recipe.id, &recipe.version)
            .unwrap_or_else(|e| {
                warn!("Failed to read install record for {}: {}", recipe.id, e);
                None
            })
    }

    fn is_reusable(record: &InstallRecord, recipe: &Recipe, layout: &InstallLayout) -> bool {
        record.matches(recipe, layout) && record.is_intact()
    }

    fn create_build_dir(&self, recipe: &Recipe) -> io::Result<TempDir> {
        let root = self
            .config
            .build_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&root)?;
        tempfile::Builder::new()
            .prefix(&format!("galley-{}-", recipe.full_version()))
            .tempdir_in(root)
    }

    /// Unpack, patch, build and test inside `build_dir`
    fn cook(
        &self,
        recipe: &Recipe,
        fetched: &FetchResult,
        build_dir: &Path,
        progress: &mut Progress<'_>,
        started: Instant,
    ) -> Result<(BuildOutcome, Option<StepReport>), ExecutionError> {
        let extract_dir = build_dir.join("source");
        extract_archive(&fetched.path, &recipe.archive_filename(), &extract_dir)
            .map_err(|e| progress.fail(StageError::Unpack(e)))?;
        let source_dir = source_root(&extract_dir).map_err(|e| progress.fail(StageError::Unpack(e)))?;
        debug!("Source directory: {}", source_dir.display());

        if !recipe.patches.is_empty() {
            progress.enter(Stage::Patching)?;
            PatchApplier::new(&self.fetcher, self.patch_tool.as_ref())
                .apply_all(&source_dir, &recipe.patches)
                .map_err(|e| progress.fail(e))?;
        }

        progress.enter(Stage::Building)?;
        let layout = self.config.layout_for(recipe);
        let vars = TemplateVars::for_recipe(recipe, &layout, &source_dir, self.config.jobs)
            .map_err(|e| progress.fail(StageError::Template(e)))?;
        let env = self
            .step_env(recipe, &vars)
            .map_err(|e| progress.fail(StageError::Template(e)))?;

        let runner = BuildStepRunner::new(&vars, &source_dir, self.expiry.as_ref())
            .with_env(env)
            .with_deadline(Some(started + self.config.recipe_timeout()))
            .with_cancel_token(self.cancel.clone());

        let snapshot = Snapshot::capture(&layout.roots());
        let reports = runner
            .run_all(&recipe.build_steps)
            .map_err(|e| progress.fail(e))?;

        let test = match &recipe.test_step {
            Some(test) => {
                progress.enter(Stage::Testing)?;
                Some(runner.run_test(test).map_err(|e| progress.fail(e))?)
            }
            None => None,
        };

        Ok((BuildOutcome { reports, snapshot }, test))
    }

    fn step_env(&self, recipe: &Recipe, vars: &TemplateVars) -> crate::Result<Vec<(String, String)>> {
        let mut env = vec![("MAKEFLAGS".to_string(), format!("-j{}", self.config.jobs))];
        for (key, value) in &recipe.env {
            env.push((key.clone(), substitute(value, vars)?));
        }
        Ok(env)
    }

    /// Run the test step against an existing install
    ///
    /// Returns `None` when the recipe declares no test.
    pub fn run_test(&self, recipe: &Recipe) -> Result<Option<StepReport>, ExecutionError> {
        let mut progress = Progress::new(&recipe.id, &self.cancel);
        let Some(test) = &recipe.test_step else {
            return Ok(None);
        };

        progress.enter(Stage::Testing)?;
        let _lock = self
            .records
            .lock(&recipe.id)
            .map_err(|e| progress.fail(StageError::Record(e)))?;
        let layout = self.config.layout_for(recipe);
        let installed = self.load_record(recipe);
        if !installed.is_some_and(|record| Self::is_reusable(&record, recipe, &layout)) {
            return Err(progress.fail(StageError::NotInstalled));
        }

        let vars = TemplateVars::for_recipe(recipe, &layout, &layout.prefix, self.config.jobs)
            .map_err(|e| progress.fail(StageError::Template(e)))?;
        let env = self
            .step_env(recipe, &vars)
            .map_err(|e| progress.fail(StageError::Template(e)))?;

        let report = BuildStepRunner::new(&vars, &layout.prefix, self.expiry.as_ref())
            .with_env(env)
            .with_deadline(Some(Instant::now() + self.config.recipe_timeout()))
            .with_cancel_token(self.cancel.clone())
            .run_test(test)
            .map_err(|e| progress.fail(e))?;
        Ok(Some(report))
    }

    /// Fetch the source and every patch into the cache without building
    pub fn fetch_only(&self, recipe: &Recipe) -> Result<Vec<FetchResult>, ExecutionError> {
        let mut progress = Progress::new(&recipe.id, &self.cancel);
        progress.enter(Stage::Fetching)?;
        let mut fetched = vec![
            self.fetcher
                .fetch_source(recipe)
                .map_err(|e| progress.fail(e))?,
        ];

        if !recipe.patches.is_empty() {
            progress.enter(Stage::Patching)?;
            for (index, patch) in recipe.patches.iter().enumerate() {
                let result = self
                    .fetcher
                    .fetch(&[patch.url.as_str()], &patch.sha256)
                    .map_err(|e| {
                        progress.fail(PatchError {
                            index,
                            url: patch.url.clone(),
                            reason: PatchFailure::FetchFailed(e),
                        })
                    })?;
                fetched.push(result);
            }
        }
        Ok(fetched)
    }

    /// Execute several recipes, in parallel where that is safe
    ///
    /// Recipes sharing an identifier or an install prefix run one after the
    /// other in input order; unrelated recipes run concurrently. Results are
    /// returned in input order.
    pub fn execute_batch(&self, recipes: &[Recipe]) -> Vec<Result<ExecutionResult, ExecutionError>> {
        let groups = self.serial_groups(recipes);
        info!(
            "Executing {} recipes in {} independent groups",
            recipes.len(),
            groups.len()
        );

        let mut results: Vec<_> = groups
            .par_iter()
            .flat_map_iter(|group| {
                group
                    .iter()
                    .map(|&index| (index, self.execute(&recipes[index])))
                    .collect::<Vec<_>>()
            })
            .collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Partition recipe indices into groups that must run sequentially
    fn serial_groups(&self, recipes: &[Recipe]) -> Vec<Vec<usize>> {
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut parent: Vec<usize> = (0..recipes.len()).collect();
        let mut first_with_key: HashMap<String, usize> = HashMap::new();

        for (index, recipe) in recipes.iter().enumerate() {
            let prefix: PathBuf = self.config.layout_for(recipe).prefix;
            for key in [format!("id:{}", recipe.id), format!("prefix:{}", prefix.display())] {
                match first_with_key.get(&key) {
                    Some(&other) => {
                        let (a, b) = (find(&mut parent, index), find(&mut parent, other));
                        parent[a.max(b)] = a.min(b);
                    }
                    None => {
                        first_with_key.insert(key, index);
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for index in 0..recipes.len() {
            let root = find(&mut parent, index);
            groups.entry(root).or_default().push(index);
        }
        groups.into_values().collect()
    }
}

/// Build output carried from the build directory scope to the record
struct BuildOutcome {
    reports: Vec<StepReport>,
    snapshot: Snapshot,
}
