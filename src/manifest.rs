//! Dependency manifest.
//!
//! Dependencies are declared statically in `thirdparty.toml` next to the
//! `sources/` directory. When no manifest exists the built-in one is used.
//!
//! # Example
//!
//! ```toml
//! [[dependency]]
//! archive = "lame-3.99.5.tar.gz"
//!
//! [dependency.linux]
//! requires = ["make"]
//! steps = [
//!   { run = "./configure --prefix=\"{install}\"" },
//!   { run = "make" },
//!   { run = "make install" },
//! ]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive;
use crate::error::{BuildError, Result};
use crate::layout::WorkspaceLayout;
use crate::toolchain::msvc::DEFAULT_PROBES;

/// Manifest file name, looked up in the base directory.
pub const MANIFEST_FILE: &str = "thirdparty.toml";

/// Manifest used when the base directory has no `thirdparty.toml`.
pub const BUILTIN_MANIFEST: &str = r#"
[toolchain]
architecture = "x86"
probes = ["msbuild /version"]

[[dependency]]
archive = "lame-3.99.5.tar.gz"

[dependency.linux]
requires = ["make"]
steps = [
  { run = "./configure --enable-shared=no --enable-static=yes --prefix=\"{install}\" --enable-nasm" },
  { run = "make" },
  { run = "make install" },
]

[dependency.windows]
requires = ["nmake"]
steps = [
  { run = "copy configMS.h config.h" },
  { patch = "Makefile.MSVC", replace = { "/opt:NOWIN98" = "", "/MT" = "/MD" } },
  { run = "nmake -f Makefile.MSVC comp=msvc asm=no gtk=no cpu=p3" },
]
install = [
  { from = "include/*.h", to = "include/lame" },
  { from = "output/*.lib", to = "lib" },
]

[[dependency]]
archive = "pthreads-w32-2.9.1.tar.gz"
platforms = ["windows"]

[dependency.windows]
requires = ["nmake"]
steps = [{ run = "nmake clean VC-static" }]
install = [
  { from = "pthread.h", to = "include" },
  { from = "sched.h", to = "include" },
  { from = "*.lib", to = "lib" },
]
"#;

/// Build platform. Every non-Windows host uses the `linux` recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

/// `[toolchain]` section, only consulted on Windows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolchainConfig {
    pub setup_script: Option<PathBuf>,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_probes")]
    pub probes: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            setup_script: None,
            architecture: default_architecture(),
            probes: default_probes(),
        }
    }
}

fn default_architecture() -> String {
    "x86".to_string()
}

fn default_probes() -> Vec<String> {
    DEFAULT_PROBES.iter().map(|p| p.to_string()).collect()
}

/// One build step, executed inside the dependency's extracted root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BuildStep {
    /// A command line handed to the platform shell; placeholders are expanded.
    Run { run: String },
    /// Literal in-place text replacement in a file.
    Patch {
        patch: String,
        replace: BTreeMap<String, String>,
    },
}

/// Copy files matching `from` (relative to the extracted root, `*`/`?`
/// allowed in the last component) into `to` (relative to the install root).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallRule {
    pub from: String,
    pub to: String,
}

/// Per-platform build recipe of one dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformRecipe {
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub steps: Vec<BuildStep>,
    #[serde(default)]
    pub install: Vec<InstallRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyToml {
    archive: String,
    sha256: Option<String>,
    source_dir: Option<String>,
    platforms: Option<Vec<Platform>>,
    linux: Option<PlatformRecipe>,
    windows: Option<PlatformRecipe>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    toolchain: Option<ToolchainConfig>,
    #[serde(default, rename = "dependency")]
    dependencies: Vec<DependencyToml>,
}

/// A dependency resolved against a workspace layout and a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    /// Extraction directory name, e.g. `lame-3.99.5`.
    pub name: String,
    pub archive: PathBuf,
    pub sha256: Option<String>,
    /// Absolute path of the extracted root inside build-temp.
    pub source_dir: PathBuf,
    pub recipe: PlatformRecipe,
}

/// Parsed manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    origin: PathBuf,
    toolchain: ToolchainConfig,
    dependencies: Vec<DependencyToml>,
}

impl Manifest {
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let parsed: ManifestToml = toml::from_str(text).map_err(|e| BuildError::Config {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        let manifest = Self {
            origin: origin.to_path_buf(),
            toolchain: parsed.toolchain.unwrap_or_default(),
            dependencies: parsed.dependencies,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_MANIFEST, Path::new("<builtin>"))
    }

    /// Load `<base>/thirdparty.toml`, or the built-in manifest when absent.
    pub fn load_or_builtin(base: &Path) -> Result<Self> {
        let path = base.join(MANIFEST_FILE);
        if !path.is_file() {
            return Self::builtin();
        }
        let text = fs::read_to_string(&path).map_err(|e| BuildError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, &path)
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn toolchain(&self) -> &ToolchainConfig {
        &self.toolchain
    }

    fn invalid(&self, reason: impl Into<String>) -> BuildError {
        BuildError::Config {
            path: self.origin.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        for dep in &self.dependencies {
            if dep.source_dir.is_none() {
                archive::extraction_dir_name(Path::new(&dep.archive))?;
            }
            if let Some(dir) = &dep.source_dir {
                require_relative(dir, "source_dir").map_err(|r| self.invalid(r))?;
            }
            for platform in dep.platforms.iter().flatten() {
                if recipe_for(dep, *platform).is_none() {
                    return Err(self.invalid(format!(
                        "'{}' lists platform '{}' but has no [dependency.{}] recipe",
                        dep.archive, platform, platform
                    )));
                }
            }
            for recipe in [&dep.linux, &dep.windows].into_iter().flatten() {
                for rule in &recipe.install {
                    require_relative(&rule.from, "install.from").map_err(|r| self.invalid(r))?;
                    require_relative(&rule.to, "install.to").map_err(|r| self.invalid(r))?;
                }
                for step in &recipe.steps {
                    if let BuildStep::Patch { patch, .. } = step {
                        require_relative(patch, "patch").map_err(|r| self.invalid(r))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dependencies that apply to `platform`, in declaration order.
    pub fn dependencies_for(
        &self,
        platform: Platform,
        layout: &WorkspaceLayout,
    ) -> Result<Vec<DependencySpec>> {
        let mut out = Vec::new();
        for dep in &self.dependencies {
            let listed = dep
                .platforms
                .as_ref()
                .map_or(true, |platforms| platforms.contains(&platform));
            let Some(recipe) = recipe_for(dep, platform).filter(|_| listed) else {
                continue;
            };
            let archive_path = layout.sources.join(&dep.archive);
            let name = match &dep.source_dir {
                Some(dir) => dir.clone(),
                None => archive::extraction_dir_name(&archive_path)?,
            };
            out.push(DependencySpec {
                source_dir: layout.extracted_dir(&name),
                name,
                archive: archive_path,
                sha256: dep.sha256.clone(),
                recipe: recipe.clone(),
            });
        }
        Ok(out)
    }
}

fn recipe_for(dep: &DependencyToml, platform: Platform) -> Option<&PlatformRecipe> {
    match platform {
        Platform::Linux => dep.linux.as_ref(),
        Platform::Windows => dep.windows.as_ref(),
    }
}

fn require_relative(raw: &str, field: &str) -> std::result::Result<(), String> {
    let candidate = Path::new(raw);
    if raw.is_empty() && field != "install.to" {
        return Err(format!("{field} must not be empty"));
    }
    if candidate.is_absolute() {
        return Err(format!("{field} must be relative, got absolute path '{raw}'"));
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return Err(format!(
                "{field} contains invalid traversal/root component in '{raw}'"
            ));
        }
    }
    Ok(())
}

/// Values substituted into `run` command templates.
#[derive(Debug, Clone)]
pub struct StepContext {
    vars: Vec<(&'static str, String)>,
}

impl StepContext {
    pub fn new(layout: &WorkspaceLayout, source_dir: &Path) -> Self {
        let show = |p: &Path| p.display().to_string();
        Self {
            vars: vec![
                ("{install}", show(&layout.install)),
                ("{bin}", show(&layout.bin)),
                ("{include}", show(&layout.include)),
                ("{lib}", show(&layout.lib)),
                ("{build}", show(&layout.build_tmp)),
                ("{sources}", show(&layout.sources)),
                ("{src}", show(source_dir)),
            ],
        }
    }

    pub fn render(&self, template: &str) -> String {
        self.vars
            .iter()
            .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
    }
}
