// src/kitchen/steps.rs

//! Build step execution
//!
//! Steps run strictly in list order; the first failure stops the run and
//! nothing after it executes. Every external program is started directly
//! (no shell) with its arguments produced by template substitution.

use crate::kitchen::certs::{CertificateFilter, ExpiryCheck};
use crate::kitchen::fsutil::{atomic_write, move_path, resolve};
use crate::kitchen::process::{
    CancelToken, CapturedOutput, ProcessOutcome, ProcessResult, run_process,
};
use crate::recipe::{
    BuildAction, BuildStep, CertSource, CommandTemplate, Phase, TemplateVars, TestStep,
    expand_args, substitute,
};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, info};

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Why a build step failed
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("exited with {}", describe_code(.code))]
    NonZeroExit { code: Option<i32> },

    #[error("timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("could not start: {0}")]
    Spawn(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("{0}")]
    Action(String),
}

/// First failing step of a build
#[derive(Debug, Error)]
#[error("{phase} step #{step} ({description}) failed: {reason}")]
pub struct BuildStepError {
    pub phase: Phase,
    /// Position of the step in the recipe's list
    pub step: usize,
    pub description: String,
    pub exit_code: Option<i32>,
    /// Everything the failing step printed, verbatim
    pub output: CapturedOutput,
    #[source]
    pub reason: StepFailure,
}

/// Why a verification test failed
#[derive(Debug, Error)]
pub enum TestFailure {
    #[error("exited with {}", describe_code(.code))]
    NonZeroExit { code: Option<i32> },

    #[error("timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("could not start: {0}")]
    Spawn(String),

    #[error("output does not contain {expected:?}")]
    OutputMismatch { expected: String },

    #[error("setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Error)]
#[error("test {reason}")]
pub struct TestError {
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    #[source]
    pub reason: TestFailure,
}

/// A step that completed successfully
#[derive(Debug, Clone)]
pub struct StepReport {
    pub phase: Phase,
    pub description: String,
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub duration: Duration,
}

/// Failure inside one step, before it is attributed to a phase
struct StepFault {
    exit_code: Option<i32>,
    output: CapturedOutput,
    reason: StepFailure,
}

impl StepFault {
    fn new(reason: StepFailure) -> Self {
        Self {
            exit_code: None,
            output: CapturedOutput::default(),
            reason,
        }
    }
}

impl From<crate::Error> for StepFault {
    fn from(err: crate::Error) -> Self {
        Self::new(StepFailure::Template(err.to_string()))
    }
}

/// Turn anything but a successful exit into a fault carrying the output
fn check_outcome(result: ProcessResult) -> Result<ProcessResult, StepFault> {
    let reason = match result.outcome {
        ProcessOutcome::Exited { success: true, .. } => return Ok(result),
        ProcessOutcome::Exited { code, .. } => StepFailure::NonZeroExit { code },
        ProcessOutcome::TimedOut => StepFailure::Timeout,
        ProcessOutcome::Cancelled => StepFailure::Cancelled,
    };
    Err(StepFault {
        exit_code: result.exit_code(),
        output: result.output,
        reason,
    })
}

fn action_error(context: &str, err: impl std::fmt::Display) -> StepFault {
    StepFault::new(StepFailure::Action(format!("{}: {}", context, err)))
}

/// Executes build steps and the verification test for one recipe
pub struct BuildStepRunner<'a> {
    vars: &'a TemplateVars,
    source_dir: &'a Path,
    env: Vec<(String, String)>,
    deadline: Option<Instant>,
    cancel: CancelToken,
    expiry: &'a dyn ExpiryCheck,
}

impl<'a> BuildStepRunner<'a> {
    pub fn new(vars: &'a TemplateVars, source_dir: &'a Path, expiry: &'a dyn ExpiryCheck) -> Self {
        Self {
            vars,
            source_dir,
            env: Vec::new(),
            deadline: None,
            cancel: CancelToken::new(),
            expiry,
        }
    }

    /// Environment applied to every command, after the inherited one
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Wall-clock limit shared by every process this runner starts
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `steps` in order, stopping at the first failure
    pub fn run_all(&self, steps: &[BuildStep]) -> Result<Vec<StepReport>, BuildStepError> {
        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            reports.push(self.run_step(index, step)?);
        }
        Ok(reports)
    }

    /// Run a single step
    pub fn run_step(&self, index: usize, step: &BuildStep) -> Result<StepReport, BuildStepError> {
        let description = step.action.describe();
        info!("Running {} step #{}: {}", step.phase, index, description);

        let started = Instant::now();
        self.execute(step)
            .map(|(exit_code, output)| StepReport {
                phase: step.phase,
                description: description.clone(),
                exit_code,
                output,
                duration: started.elapsed(),
            })
            .map_err(|fault| BuildStepError {
                phase: step.phase,
                step: index,
                description,
                exit_code: fault.exit_code,
                output: fault.output,
                reason: fault.reason,
            })
    }

    fn check_interrupted(&self) -> Result<(), StepFault> {
        if self.cancel.is_cancelled() {
            return Err(StepFault::new(StepFailure::Cancelled));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StepFault::new(StepFailure::Timeout));
        }
        Ok(())
    }

    fn execute(&self, step: &BuildStep) -> Result<(Option<i32>, CapturedOutput), StepFault> {
        self.check_interrupted()?;

        let workdir = match &step.workdir {
            Some(dir) => resolve(self.source_dir, &substitute(dir, self.vars)?),
            None => self.source_dir.to_path_buf(),
        };
        let path = |template: &str| -> Result<PathBuf, StepFault> {
            Ok(resolve(&workdir, &substitute(template, self.vars)?))
        };

        match &step.action {
            BuildAction::Run(cmd) => {
                let result = check_outcome(self.run_command(cmd, &workdir, step.phase.as_str())?)?;
                Ok((result.exit_code(), result.output))
            }
            BuildAction::Inreplace { path: file, find, replace } => {
                let file = path(file)?;
                let content = fs::read_to_string(&file)
                    .map_err(|e| action_error(&format!("read {}", file.display()), e))?;
                if !content.contains(find.as_str()) {
                    return Err(StepFault::new(StepFailure::Action(format!(
                        "inreplace: {:?} not found in {}",
                        find,
                        file.display()
                    ))));
                }
                fs::write(&file, content.replace(find.as_str(), replace))
                    .map_err(|e| action_error(&format!("write {}", file.display()), e))?;
                Ok((None, CapturedOutput::default()))
            }
            BuildAction::Move { from, to } => {
                let (from, to) = (path(from)?, path(to)?);
                move_path(&from, &to).map_err(|e| {
                    action_error(&format!("move {} -> {}", from.display(), to.display()), e)
                })?;
                Ok((None, CapturedOutput::default()))
            }
            BuildAction::WriteFile { path: file, contents } => {
                let file = path(file)?;
                atomic_write(&file, contents.as_bytes())
                    .map_err(|e| action_error(&format!("write {}", file.display()), e))?;
                Ok((None, CapturedOutput::default()))
            }
            BuildAction::FilterCertificates { source, output } => {
                let input = self.read_certificates(source, &workdir)?;
                let output = path(output)?;
                let outcome = CertificateFilter::new(self.expiry)
                    .write(&input, &output, SystemTime::now())
                    .map_err(|e| action_error(&format!("write {}", output.display()), e))?;
                Ok((
                    None,
                    CapturedOutput::from_stdout(format!(
                        "kept {} certificates, dropped {} expired and {} malformed\n",
                        outcome.kept.len(),
                        outcome.expired,
                        outcome.malformed
                    )),
                ))
            }
        }
    }

    fn read_certificates(&self, source: &CertSource, workdir: &Path) -> Result<String, StepFault> {
        match source {
            CertSource::Bundle(bundle) => {
                let bundle = resolve(workdir, &substitute(bundle, self.vars)?);
                fs::read_to_string(&bundle)
                    .map_err(|e| action_error(&format!("read {}", bundle.display()), e))
            }
            CertSource::Command(cmd) => {
                let result = self.run_command(cmd, workdir, "certificates")?;
                Ok(check_outcome(result)?.output.stdout)
            }
        }
    }

    fn run_command(
        &self,
        template: &CommandTemplate,
        cwd: &Path,
        label: &str,
    ) -> Result<ProcessResult, StepFault> {
        let cmd = self.build_command(template, self.vars, cwd)?;
        self.spawn(cmd, label)
            .map_err(|e| StepFault::new(StepFailure::Spawn(format!("{}: {}", template.program, e))))
    }

    fn build_command(
        &self,
        template: &CommandTemplate,
        vars: &TemplateVars,
        cwd: &Path,
    ) -> crate::Result<Command> {
        let program = substitute(&template.program, vars)?;
        let args = expand_args(&template.args, vars)?;
        debug!("Command: {} {}", program, args.join(" "));

        let mut cmd = Command::new(program_path(&program, cwd));
        cmd.args(&args).current_dir(cwd);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for (key, value) in &template.env {
            cmd.env(key, substitute(value, vars)?);
        }
        Ok(cmd)
    }

    fn spawn(&self, mut cmd: Command, label: &str) -> std::io::Result<ProcessResult> {
        run_process(&mut cmd, self.deadline, &self.cancel, label)
    }

    /// Run the verification test in a scratch `{testpath}` directory
    pub fn run_test(&self, test: &TestStep) -> Result<StepReport, TestError> {
        let setup = |reason: String| TestError {
            exit_code: None,
            output: CapturedOutput::default(),
            reason: TestFailure::Setup(reason),
        };

        if self.cancel.is_cancelled() {
            return Err(TestError {
                exit_code: None,
                output: CapturedOutput::default(),
                reason: TestFailure::Cancelled,
            });
        }

        let testpath = tempfile::Builder::new()
            .prefix("galley-test-")
            .tempdir()
            .map_err(|e| setup(format!("failed to create test directory: {}", e)))?;

        for file in &test.files {
            let relative = Path::new(&file.path);
            if !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(setup(format!("fixture {} escapes the test directory", file.path)));
            }
            let target = testpath.path().join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| setup(e.to_string()))?;
            }
            fs::write(&target, &file.contents)
                .map_err(|e| setup(format!("write {}: {}", target.display(), e)))?;
        }

        let mut vars = self.vars.clone();
        vars.set("testpath", testpath.path().to_string_lossy().into_owned());

        info!("Running test: {}", test.command.display());
        let started = Instant::now();
        let cmd = self
            .build_command(&test.command, &vars, testpath.path())
            .map_err(|e| setup(e.to_string()))?;
        let result = self.spawn(cmd, "test").map_err(|e| TestError {
            exit_code: None,
            output: CapturedOutput::default(),
            reason: TestFailure::Spawn(format!("{}: {}", test.command.program, e)),
        })?;

        let exit_code = result.exit_code();
        let reason = match result.outcome {
            ProcessOutcome::TimedOut => Some(TestFailure::Timeout),
            ProcessOutcome::Cancelled => Some(TestFailure::Cancelled),
            ProcessOutcome::Exited { success: false, code } => Some(TestFailure::NonZeroExit { code }),
            ProcessOutcome::Exited { success: true, .. } => match &test.expect_output {
                Some(expected) if !result.output.stdout.contains(expected.as_str()) => {
                    Some(TestFailure::OutputMismatch {
                        expected: expected.clone(),
                    })
                }
                _ => None,
            },
        };

        match reason {
            Some(reason) => Err(TestError {
                exit_code,
                output: result.output,
                reason,
            }),
            None => Ok(StepReport {
                phase: Phase::PostInstall,
                description: format!("test {}", test.command.display()),
                exit_code,
                output: result.output,
                duration: started.elapsed(),
            }),
        }
    }
}

/// Relative paths with a directory component (`./configure`) name a file
/// under the working directory; bare names are looked up on `PATH`.
fn program_path(program: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && program.contains('/') {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::TestFile;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    struct NeverExpires;

    impl ExpiryCheck for NeverExpires {
        fn not_after(&self, pem: &str) -> Result<SystemTime, String> {
            if pem.contains("QUFB") {
                Ok(UNIX_EPOCH + Duration::from_secs(u32::MAX as u64 * 4))
            } else {
                Err("bad".to_string())
            }
        }
    }

    fn sh(phase: Phase, script: &str) -> BuildStep {
        BuildStep {
            phase,
            action: BuildAction::Run(CommandTemplate::new("sh", ["-c", script])),
            workdir: None,
        }
    }

    fn vars(dir: &Path) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.set("prefix", dir.join("prefix").to_string_lossy().into_owned());
        vars
    }

    #[test]
    fn test_steps_run_in_order() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let reports = runner
            .run_all(&[
                sh(Phase::Configure, "echo configure >> log"),
                sh(Phase::Build, "echo build >> log"),
                sh(Phase::Install, "echo install >> log"),
            ])
            .unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(
            fs::read_to_string(dir.path().join("log")).unwrap(),
            "configure\nbuild\ninstall\n"
        );
    }

    #[test]
    fn test_failed_build_skips_install() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let err = runner
            .run_all(&[
                sh(Phase::Build, "echo compiling; echo 'error: boom' >&2; exit 2"),
                sh(Phase::Install, "touch installed"),
            ])
            .unwrap_err();

        assert_eq!(err.phase, Phase::Build);
        assert_eq!(err.step, 0);
        assert_eq!(err.exit_code, Some(2));
        assert!(matches!(err.reason, StepFailure::NonZeroExit { code: Some(2) }));
        assert_eq!(err.output.stdout, "compiling\n");
        assert_eq!(err.output.stderr, "error: boom\n");
        assert!(!dir.path().join("installed").exists());
    }

    #[test]
    fn test_template_args_and_env() {
        let dir = TempDir::new().unwrap();
        let mut vars = vars(dir.path());
        vars.set_list("flags", vec!["a".to_string(), "b c".to_string()]);
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires)
            .with_env(vec![("MAKEFLAGS".to_string(), "-j3".to_string())]);

        let mut cmd = CommandTemplate::new(
            "sh",
            ["-c", "printf '%s|' \"$@\" \"$MAKEFLAGS\" \"$EXTRA\"", "sh", "{flags}", "--prefix={prefix}"],
        );
        cmd.env.insert("EXTRA".to_string(), "{prefix}/x".to_string());
        let step = BuildStep {
            phase: Phase::Configure,
            action: BuildAction::Run(cmd),
            workdir: None,
        };

        let report = runner.run_step(0, &step).unwrap();
        let prefix = dir.path().join("prefix");
        assert_eq!(
            report.output.stdout,
            format!("a|b c|--prefix={}|-j3|{}/x|", prefix.display(), prefix.display())
        );
    }

    #[test]
    fn test_unknown_variable_fails_step() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let err = runner.run_step(0, &sh(Phase::Build, "make {nope}")).unwrap_err();
        assert!(matches!(err.reason, StepFailure::Template(_)));
    }

    #[test]
    fn test_workdir_and_relative_program() {
        let dir = TempDir::new().unwrap();
        let generic = dir.path().join("build/generic");
        fs::create_dir_all(&generic).unwrap();
        let script = generic.join("configure");
        fs::write(&script, "#!/bin/sh\npwd\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&script, perms).unwrap();

        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);
        let step = BuildStep {
            phase: Phase::Configure,
            action: BuildAction::Run(CommandTemplate::new("./configure", Vec::<String>::new())),
            workdir: Some("build/generic".to_string()),
        };

        let report = runner.run_step(0, &step).unwrap();
        assert_eq!(
            Path::new(report.output.stdout.trim()).canonicalize().unwrap(),
            generic.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_inreplace_requires_match() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("symbols"), "lame_init_old\nlame_init\n").unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let step = |find: &str| BuildStep {
            phase: Phase::Configure,
            action: BuildAction::Inreplace {
                path: "symbols".to_string(),
                find: find.to_string(),
                replace: String::new(),
            },
            workdir: None,
        };

        runner.run_step(0, &step("lame_init_old\n")).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("symbols")).unwrap(), "lame_init\n");

        let err = runner.run_step(1, &step("lame_init_old\n")).unwrap_err();
        assert!(matches!(err.reason, StepFailure::Action(ref msg) if msg.contains("not found")));
    }

    #[test]
    fn test_move_and_write_file() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        runner
            .run_all(&[
                BuildStep {
                    phase: Phase::Install,
                    action: BuildAction::WriteFile {
                        path: "{prefix}/bin/certtool".to_string(),
                        contents: "tool {not a var}".to_string(),
                    },
                    workdir: None,
                },
                BuildStep {
                    phase: Phase::PostInstall,
                    action: BuildAction::Move {
                        from: "{prefix}/bin/certtool".to_string(),
                        to: "{prefix}/bin/gnutls-certtool".to_string(),
                    },
                    workdir: None,
                },
            ])
            .unwrap();

        let bin = dir.path().join("prefix/bin");
        assert!(!bin.join("certtool").exists());
        assert_eq!(
            fs::read_to_string(bin.join("gnutls-certtool")).unwrap(),
            "tool {not a var}"
        );
    }

    #[test]
    fn test_filter_certificates_from_command() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let export = "printf '%s\\n' -----BEGIN' 'CERTIFICATE----- QUFB -----END' 'CERTIFICATE----- \
                      -----BEGIN' 'CERTIFICATE----- ZZZZ -----END' 'CERTIFICATE-----";
        let step = BuildStep {
            phase: Phase::PostInstall,
            action: BuildAction::FilterCertificates {
                source: CertSource::Command(CommandTemplate::new("sh", ["-c", export])),
                output: "{prefix}/etc/cert.pem".to_string(),
            },
            workdir: None,
        };

        let report = runner.run_step(0, &step).unwrap();
        assert!(report.output.stdout.contains("kept 1"));
        assert_eq!(
            fs::read_to_string(dir.path().join("prefix/etc/cert.pem")).unwrap(),
            "-----BEGIN CERTIFICATE-----\nQUFB\n-----END CERTIFICATE-----\n"
        );
    }

    #[test]
    fn test_deadline_times_out_step() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires)
            .with_deadline(Some(Instant::now() + Duration::from_millis(200)));

        let err = runner.run_step(0, &sh(Phase::Build, "sleep 30")).unwrap_err();
        assert!(matches!(err.reason, StepFailure::Timeout));
    }

    #[test]
    fn test_cancelled_runner_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let runner =
            BuildStepRunner::new(&vars, dir.path(), &NeverExpires).with_cancel_token(cancel);

        let err = runner.run_all(&[sh(Phase::Build, "touch ran")]).unwrap_err();
        assert!(matches!(err.reason, StepFailure::Cancelled));
        assert!(!dir.path().join("ran").exists());
    }

    #[test]
    fn test_run_test_with_fixture_and_expected_output() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let test = TestStep {
            command: CommandTemplate::new("sh", ["-c", "cat {testpath}/test.txt"]),
            files: vec![TestFile {
                path: "test.txt".to_string(),
                contents: "TagLib 1.11.1\n".to_string(),
            }],
            expect_output: Some("1.11.1".to_string()),
        };
        runner.run_test(&test).unwrap();

        let mismatch = TestStep {
            expect_output: Some("2.0".to_string()),
            ..test
        };
        let err = runner.run_test(&mismatch).unwrap_err();
        assert!(matches!(err.reason, TestFailure::OutputMismatch { .. }));
        assert_eq!(err.output.stdout, "TagLib 1.11.1\n");
    }

    #[test]
    fn test_run_test_failure_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let test = TestStep {
            command: CommandTemplate::new("sh", ["-c", "echo nope >&2; exit 1"]),
            files: Vec::new(),
            expect_output: None,
        };
        let err = runner.run_test(&test).unwrap_err();
        assert_eq!(err.exit_code, Some(1));
        assert_eq!(err.output.stderr, "nope\n");
    }

    #[test]
    fn test_fixture_cannot_escape_testpath() {
        let dir = TempDir::new().unwrap();
        let vars = vars(dir.path());
        let runner = BuildStepRunner::new(&vars, dir.path(), &NeverExpires);

        let test = TestStep {
            command: CommandTemplate::new("true", Vec::<String>::new()),
            files: vec![TestFile {
                path: "/tmp/evil".to_string(),
                contents: String::new(),
            }],
            expect_output: None,
        };
        let err = runner.run_test(&test).unwrap_err();
        assert!(matches!(err.reason, TestFailure::Setup(_)));
    }
}
