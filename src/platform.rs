//! Per-platform build drivers.
//!
//! A driver is picked once at startup ([`driver_for_host`]) and supplies the
//! three platform-dependent capabilities of a run: unpacking the sources,
//! preparing the process environment, and running one dependency's steps.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::archive;
use crate::error::{IoContext, Result};
use crate::layout::WorkspaceLayout;
use crate::manifest::{BuildStep, DependencySpec, Manifest, Platform, StepContext, ToolchainConfig};
use crate::process::{in_dir, Cmd};
use crate::toolchain::msvc::ToolchainResolver;
use crate::toolchain::{EnvInjector, InjectionAudit};

pub trait PlatformDriver {
    fn platform(&self) -> Platform;

    /// Verify and unpack every dependency archive into build-temp.
    fn extract_deps(&self, layout: &WorkspaceLayout, deps: &[DependencySpec]) -> Result<()> {
        for dep in deps {
            if let Some(expected) = &dep.sha256 {
                archive::verify_sha256(&dep.archive, expected)?;
            }
            archive::extract(&dep.archive, &layout.build_tmp)?;
        }
        Ok(())
    }

    /// Whether [`PlatformDriver::prepare_environment`] has work to do.
    fn needs_environment(&self) -> bool;

    /// Make the native toolchain visible to later commands.
    fn prepare_environment(&self, injector: &mut EnvInjector) -> Result<Option<InjectionAudit>>;

    /// Run a dependency's steps in order from inside its extracted root.
    fn build_dependency(&self, layout: &WorkspaceLayout, dep: &DependencySpec) -> Result<()> {
        in_dir(&dep.source_dir, |dir| {
            let ctx = StepContext::new(layout, dir);
            for step in &dep.recipe.steps {
                run_step(step, dir, &ctx)?;
            }
            Ok(())
        })
    }
}

/// Execute one build step with `dir` as the working directory.
pub fn run_step(step: &BuildStep, dir: &Path, ctx: &StepContext) -> Result<()> {
    match step {
        BuildStep::Run { run } => Cmd::shell(ctx.render(run)).current_dir(dir).exec_or_fail(),
        BuildStep::Patch { patch, replace } => {
            let path = dir.join(patch);
            let original = fs::read_to_string(&path)
                .io_context(|| format!("reading '{}' for patching", path.display()))?;
            let patched = replace
                .iter()
                .fold(original, |text, (from, to)| text.replace(from.as_str(), to));
            fs::write(&path, patched).io_context(|| format!("writing '{}'", path.display()))?;
            info!("PATCHED: {}", path.display());
            Ok(())
        }
    }
}

/// configure/make style builds; the inherited environment is used as-is.
#[derive(Debug, Default)]
pub struct PosixDriver;

impl PlatformDriver for PosixDriver {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn needs_environment(&self) -> bool {
        false
    }

    fn prepare_environment(&self, _injector: &mut EnvInjector) -> Result<Option<InjectionAudit>> {
        Ok(None)
    }
}

/// Visual C++ builds; captures the vcvars environment before building.
#[derive(Debug)]
pub struct MsvcDriver {
    config: ToolchainConfig,
    resolver: Option<ToolchainResolver>,
}

impl MsvcDriver {
    pub fn new(config: ToolchainConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    /// Use a prepared resolver instead of building one from configuration.
    pub fn with_resolver(resolver: ToolchainResolver) -> Self {
        Self {
            config: ToolchainConfig::default(),
            resolver: Some(resolver),
        }
    }
}

impl PlatformDriver for MsvcDriver {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn needs_environment(&self) -> bool {
        true
    }

    fn prepare_environment(&self, injector: &mut EnvInjector) -> Result<Option<InjectionAudit>> {
        let resolver = match &self.resolver {
            Some(resolver) => resolver.clone(),
            None => ToolchainResolver::from_config(&self.config)?,
        };
        info!(
            "capturing toolchain environment from {}",
            resolver.setup_script().display()
        );
        resolver.prepare(injector).map(Some)
    }
}

/// Select the driver for the platform this binary runs on.
pub fn driver_for_host(manifest: &Manifest) -> Box<dyn PlatformDriver> {
    match Platform::host() {
        Platform::Windows => Box::new(MsvcDriver::new(manifest.toolchain().clone())),
        Platform::Linux => Box::new(PosixDriver),
    }
}
