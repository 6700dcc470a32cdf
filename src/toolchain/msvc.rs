//! Visual C++ environment discovery.
//!
//! Runs the vendor setup script (`vcvarsall.bat`, `vcvars32.bat`, ...) for an
//! architecture, chained with `set`, and turns the dump into an
//! [`EnvironmentSnapshot`].
//!
//! Setup script resolution order:
//! 1. `TPS_VCVARSALL` env var
//! 2. `toolchain.setup_script` in the manifest

use std::env;
use std::path::{Path, PathBuf};

use tracing::info;

use super::{
    parse_env_output, plan_merge, EnvInjector, EnvironmentSnapshot, InjectionAudit, OutputEncoding,
    PathStyle,
};
use crate::error::{BuildError, Result};
use crate::manifest::ToolchainConfig;
use crate::process::Cmd;

/// Env var overriding the configured setup script.
pub const SETUP_SCRIPT_ENV: &str = "TPS_VCVARSALL";

/// Commands that must succeed once the environment is in place.
pub const DEFAULT_PROBES: &[&str] = &["msbuild /version"];

#[derive(Debug, Clone)]
pub struct ToolchainResolver {
    setup_script: PathBuf,
    architecture: String,
    dump_command: String,
    style: PathStyle,
    encoding: OutputEncoding,
    probes: Vec<String>,
}

impl ToolchainResolver {
    pub fn new(setup_script: impl Into<PathBuf>, architecture: impl Into<String>) -> Self {
        Self {
            setup_script: setup_script.into(),
            architecture: architecture.into(),
            dump_command: default_dump_command().to_string(),
            style: PathStyle::host(),
            encoding: OutputEncoding::native(),
            probes: DEFAULT_PROBES.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Build a resolver from manifest settings, honouring [`SETUP_SCRIPT_ENV`].
    pub fn from_config(config: &ToolchainConfig) -> Result<Self> {
        let script = match env::var_os(SETUP_SCRIPT_ENV) {
            Some(path) => PathBuf::from(path),
            None => config.setup_script.clone().ok_or_else(|| {
                BuildError::toolchain(format!(
                    "no setup script configured; set {} or toolchain.setup_script",
                    SETUP_SCRIPT_ENV
                ))
            })?,
        };
        Ok(Self::new(script, config.architecture.clone()).with_probes(config.probes.clone()))
    }

    pub fn with_dump_command(mut self, command: impl Into<String>) -> Self {
        self.dump_command = command.into();
        self
    }

    pub fn with_style(mut self, style: PathStyle) -> Self {
        self.style = style;
        self
    }

    /// Override how the variable dump is decoded.
    pub fn with_encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_probes(mut self, probes: Vec<String>) -> Self {
        self.probes = probes;
        self
    }

    pub fn setup_script(&self) -> &Path {
        &self.setup_script
    }

    fn query_line(&self) -> String {
        format!(
            "\"{}\" {} && {}",
            self.setup_script.display(),
            self.architecture,
            self.dump_command
        )
    }

    /// Capture the toolchain's interesting variables.
    pub fn resolve(&self) -> Result<EnvironmentSnapshot> {
        if !self.setup_script.is_file() {
            return Err(BuildError::toolchain(format!(
                "could not open \"{}\"",
                self.setup_script.display()
            )));
        }

        let output = Cmd::shell(self.query_line())
            .allow_fail()
            .run()
            .map_err(|e| BuildError::toolchain(format!("could not start setup script: {e}")))?;

        if !output.success() {
            return Err(BuildError::toolchain(format!(
                "\"{}\" {} exited with {}: {}",
                self.setup_script.display(),
                self.architecture,
                output.code(),
                output.stderr_lossy().trim()
            )));
        }

        let snapshot = parse_env_output(&output.stdout, self.style, self.encoding).interesting();
        if snapshot.get("path").is_none() {
            return Err(BuildError::toolchain(format!(
                "\"{}\" did not report a PATH",
                self.setup_script.display()
            )));
        }
        info!(
            "toolchain environment captured from {} ({} variables)",
            self.setup_script.display(),
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Run every probe; any failure means the environment is unusable.
    pub fn probe(&self) -> Result<()> {
        for probe in &self.probes {
            let status = Cmd::shell(probe.as_str())
                .status()
                .map_err(|e| BuildError::toolchain(format!("'{probe}' could not be started: {e}")))?;
            if !status.success() {
                return Err(BuildError::toolchain(format!(
                    "'{}' exited with {}; toolchain command unavailable",
                    probe,
                    status.code().unwrap_or(-1)
                )));
            }
        }
        Ok(())
    }

    /// Resolve, merge into the process environment, then validate.
    pub fn prepare(&self, injector: &mut EnvInjector) -> Result<InjectionAudit> {
        let snapshot = self.resolve()?;
        let plan = plan_merge(&snapshot, current_var, self.style)?;
        let audit = injector.inject(plan)?.clone();
        self.probe()?;
        Ok(audit)
    }
}

/// Value of `name` in this process. A set variable that is not valid
/// Unicode still counts as present.
fn current_var(name: &str) -> Option<String> {
    env::var_os(name).map(|value| value.to_string_lossy().into_owned())
}

fn default_dump_command() -> &'static str {
    if cfg!(windows) {
        "set"
    } else {
        "env"
    }
}
