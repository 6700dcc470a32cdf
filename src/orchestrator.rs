//! Dependency build orchestration.
//!
//! A run moves through
//!
//! ```text
//! Init -> Extracting -> [PlatformSetup] -> Building(0..n) -> Installing -> Done
//! ```
//!
//! and drops into `Failed` from wherever the first error occurs. Nothing is
//! retried or rolled back: extracted and half-built trees stay in build-temp
//! next to a `failed` run record.

use std::fmt;
use std::path::PathBuf;

use tracing::{error, info};

use crate::error::Result;
use crate::install::install_artifacts;
use crate::layout::WorkspaceLayout;
use crate::manifest::{DependencySpec, Manifest};
use crate::platform::{driver_for_host, PlatformDriver};
use crate::preflight;
use crate::run_manifest::{write_record, RunRecord, RunStatus, WorkspaceLock};
use crate::toolchain::{EnvInjector, InjectionAudit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Init,
    Extracting,
    PlatformSetup,
    Building { index: usize, name: String },
    Installing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Init => write!(f, "init"),
            RunState::Extracting => write!(f, "extracting"),
            RunState::PlatformSetup => write!(f, "platform setup"),
            RunState::Building { index, name } => write!(f, "building #{} ({})", index + 1, name),
            RunState::Installing => write!(f, "installing"),
            RunState::Done => write!(f, "done"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub built: Vec<String>,
    pub installed: Vec<PathBuf>,
    pub environment: Option<InjectionAudit>,
    pub record: PathBuf,
}

#[derive(Debug, Default)]
struct StateTracker {
    history: Vec<RunState>,
}

impl StateTracker {
    fn enter(&mut self, state: RunState) {
        info!("==> {}", state);
        self.history.push(state);
    }

    fn current(&self) -> &RunState {
        self.history.last().unwrap_or(&RunState::Init)
    }
}

pub struct Orchestrator {
    layout: WorkspaceLayout,
    dependencies: Vec<DependencySpec>,
    driver: Box<dyn PlatformDriver>,
    injector: EnvInjector,
    tracker: StateTracker,
    record: RunRecord,
}

impl Orchestrator {
    pub fn new(
        layout: WorkspaceLayout,
        dependencies: Vec<DependencySpec>,
        driver: Box<dyn PlatformDriver>,
    ) -> Self {
        let record = RunRecord::started(driver.platform());
        let mut tracker = StateTracker::default();
        tracker.enter(RunState::Init);
        Self {
            layout,
            dependencies,
            driver,
            injector: EnvInjector::new(),
            tracker,
            record,
        }
    }

    /// Orchestrator for the host platform, driven by `manifest`.
    pub fn for_host(layout: WorkspaceLayout, manifest: &Manifest) -> Result<Self> {
        let driver = driver_for_host(manifest);
        let dependencies = manifest.dependencies_for(driver.platform(), &layout)?;
        Ok(Self::new(layout, dependencies, driver))
    }

    pub fn state(&self) -> &RunState {
        self.tracker.current()
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[RunState] {
        &self.tracker.history
    }

    pub fn dependencies(&self) -> &[DependencySpec] {
        &self.dependencies
    }

    /// Execute the whole run. The workspace is locked for its duration.
    ///
    /// A run that cannot take the lock still ends in `Failed`, but leaves no
    /// record behind: build-temp belongs to whoever holds the lock.
    pub fn run(&mut self) -> Result<RunReport> {
        let (lock, outcome) = match WorkspaceLock::acquire(&self.layout.base) {
            Ok(lock) => {
                let outcome = self.execute();
                (Some(lock), outcome)
            }
            Err(e) => (None, Err(e)),
        };

        match outcome {
            Ok(()) => {
                self.tracker.enter(RunState::Done);
                self.record.finish(RunStatus::Success);
                let record = write_record(&self.layout.install, &self.record)?;
                Ok(RunReport {
                    built: self.record.built.clone(),
                    installed: self.record.installed.clone(),
                    environment: self.record.environment.clone(),
                    record,
                })
            }
            Err(e) => {
                let during = self.tracker.current().clone();
                self.tracker.enter(RunState::Failed);
                error!("run failed while {}: {}", during, e);
                self.record.error = Some(e.to_string());
                self.record.finish(RunStatus::Failed);
                if lock.is_some() {
                    if let Err(write_err) = write_record(&self.layout.build_tmp, &self.record) {
                        error!("could not write failure record: {}", write_err);
                    }
                }
                Err(e)
            }
        }
    }

    fn execute(&mut self) -> Result<()> {
        self.tracker.enter(RunState::Extracting);
        self.layout.prepare()?;
        self.driver.extract_deps(&self.layout, &self.dependencies)?;

        if self.driver.needs_environment() {
            self.tracker.enter(RunState::PlatformSetup);
            self.record.environment = self.driver.prepare_environment(&mut self.injector)?;
        }

        preflight::check_required_tools(&preflight::required_tools(&self.dependencies))?;

        for (index, dep) in self.dependencies.iter().enumerate() {
            self.tracker.enter(RunState::Building {
                index,
                name: dep.name.clone(),
            });
            self.driver.build_dependency(&self.layout, dep)?;
            self.record.built.push(dep.name.clone());
        }

        self.tracker.enter(RunState::Installing);
        for dep in &self.dependencies {
            let installed =
                install_artifacts(&dep.source_dir, &self.layout.install, &dep.recipe.install)?;
            self.record.installed.extend(installed);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::archive::tests::write_tar_gz;
    use crate::error::BuildError;
    use crate::manifest::Platform;
    use crate::platform::PosixDriver;
    use crate::process::test_support::process_serial;
    use crate::run_manifest::load_record;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn workspace(archives: &[&str], manifest: &str) -> (TempDir, WorkspaceLayout, Orchestrator) {
        let temp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::resolve(temp.path());
        fs::create_dir_all(&layout.sources).unwrap();
        for stem in archives {
            let readme = format!("{stem}/README");
            let header = format!("{stem}/include/{stem}.h");
            write_tar_gz(
                &layout.sources.join(format!("{stem}.tar.gz")),
                &[(readme.as_str(), "readme\n"), (header.as_str(), "/* api */\n")],
            );
        }
        let manifest = Manifest::parse(manifest, Path::new("thirdparty.toml")).unwrap();
        let deps = manifest.dependencies_for(Platform::Linux, &layout).unwrap();
        let orchestrator = Orchestrator::new(layout.clone(), deps, Box::new(PosixDriver));
        (temp, layout, orchestrator)
    }

    const FAILING_MIDDLE: &str = r#"
[[dependency]]
archive = "a-1.0.0.tar.gz"
[dependency.linux]
steps = [{ run = "touch built-a" }]
install = [{ from = "built-a", to = "lib" }]

[[dependency]]
archive = "b-2.0.0.tar.gz"
[dependency.linux]
steps = [{ run = "exit 5" }, { run = "touch built-b" }]

[[dependency]]
archive = "c-3.0.0.tar.gz"
[dependency.linux]
steps = [{ run = "touch built-c" }]
"#;

    #[test]
    fn failing_dependency_halts_the_run() {
        let _serial = process_serial();
        let (_temp, layout, mut orchestrator) =
            workspace(&["a-1.0.0", "b-2.0.0", "c-3.0.0"], FAILING_MIDDLE);
        let cwd_before = std::env::current_dir().unwrap();

        let err = orchestrator.run().unwrap_err();

        match &err {
            BuildError::CommandFailed { command, code } => {
                assert_eq!(command, "exit 5");
                assert_eq!(*code, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // every archive was extracted, only A was built
        for dir in ["a-1.0.0", "b-2.0.0", "c-3.0.0"] {
            assert!(layout.build_tmp.join(dir).join("README").is_file());
        }
        assert!(layout.build_tmp.join("a-1.0.0/built-a").is_file());
        assert!(!layout.build_tmp.join("b-2.0.0/built-b").exists());
        assert!(!layout.build_tmp.join("c-3.0.0/built-c").exists());

        assert_eq!(orchestrator.state(), &RunState::Failed);
        assert!(!orchestrator.history().contains(&RunState::Installing));
        assert!(!orchestrator
            .history()
            .iter()
            .any(|s| matches!(s, RunState::Building { name, .. } if name == "c-3.0.0")));
        assert!(!layout.lib.join("built-a").exists());
        assert_eq!(std::env::current_dir().unwrap(), cwd_before);

        let record = load_record(&layout.build_tmp).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.built, vec!["a-1.0.0".to_string()]);
        assert!(record.error.unwrap().contains("exit 5"));
        assert!(load_record(&layout.install).unwrap().is_none());
    }

    #[test]
    fn successful_run_installs_artifacts_and_discards_stale_files() {
        let _serial = process_serial();
        let manifest = r#"
[[dependency]]
archive = "a-1.0.0.tar.gz"
[dependency.linux]
requires = ["sh"]
steps = [
  { run = "mkdir -p out && echo lib > out/liba.a" },
  { run = "printf '%s' \"{include}\" > include-dir.txt" },
]
install = [
  { from = "out/*.a", to = "lib" },
  { from = "include/*.h", to = "include/a" },
]
"#;
        let (_temp, layout, mut orchestrator) = workspace(&["a-1.0.0"], manifest);
        fs::create_dir_all(&layout.lib).unwrap();
        fs::write(layout.lib.join("stale.a"), "old").unwrap();

        let report = orchestrator.run().unwrap();

        assert_eq!(report.built, vec!["a-1.0.0".to_string()]);
        assert_eq!(report.installed.len(), 2);
        assert!(report.environment.is_none());
        assert!(layout.lib.join("liba.a").is_file());
        assert!(layout.include.join("a/a-1.0.0.h").is_file());
        assert!(!layout.lib.join("stale.a").exists());
        assert_eq!(
            fs::read_to_string(layout.build_tmp.join("a-1.0.0/include-dir.txt")).unwrap(),
            layout.include.display().to_string()
        );

        let states: Vec<_> = orchestrator.history().to_vec();
        assert_eq!(
            states,
            vec![
                RunState::Init,
                RunState::Extracting,
                RunState::Building { index: 0, name: "a-1.0.0".into() },
                RunState::Installing,
                RunState::Done,
            ]
        );
        let record = load_record(&layout.install).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(report.record, layout.install.join("tps-run.json"));
    }

    #[test]
    fn missing_archive_fails_during_extraction() {
        let _serial = process_serial();
        let (_temp, layout, mut orchestrator) = workspace(&[], FAILING_MIDDLE);

        let err = orchestrator.run().unwrap_err();

        assert!(matches!(err, BuildError::Extraction { .. }));
        assert!(orchestrator.history().contains(&RunState::Extracting));
        assert!(!orchestrator
            .history()
            .iter()
            .any(|s| matches!(s, RunState::Building { .. })));
        assert!(layout.install.is_dir());
    }

    #[test]
    fn missing_required_tool_fails_before_building() {
        let _serial = process_serial();
        let manifest = r#"
[[dependency]]
archive = "a-1.0.0.tar.gz"
[dependency.linux]
requires = ["definitely_not_a_real_command_12345"]
steps = [{ run = "touch built-a" }]
"#;
        let (_temp, layout, mut orchestrator) = workspace(&["a-1.0.0"], manifest);

        let err = orchestrator.run().unwrap_err();

        assert!(matches!(err, BuildError::ToolchainUnavailable { .. }));
        assert!(!layout.build_tmp.join("a-1.0.0/built-a").exists());
    }

    #[test]
    fn concurrent_run_on_same_workspace_is_refused() {
        let _serial = process_serial();
        let (_temp, layout, mut orchestrator) = workspace(&["a-1.0.0"], FAILING_MIDDLE);
        let _held = WorkspaceLock::acquire(&layout.base).unwrap();

        let err = orchestrator.run().unwrap_err();

        assert!(matches!(err, BuildError::WorkspaceLocked { .. }));
        assert_eq!(orchestrator.state(), &RunState::Failed);
        assert_eq!(orchestrator.history(), &[RunState::Init, RunState::Failed]);
        assert!(!layout.build_tmp.exists());
    }
}
