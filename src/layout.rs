//! Workspace directory layout.
//!
//! All paths are derived from a single base directory:
//!
//! ```text
//! <base>/
//!   sources/      archived third-party sources (read-only input)
//!   build.tmp/    scratch area, archives are extracted here
//!   build/        install prefix
//!     bin/
//!     include/
//!     lib/
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{IoContext, Result};

pub const SOURCES_DIR: &str = "sources";
pub const BUILD_TMP_DIR: &str = "build.tmp";
pub const INSTALL_DIR: &str = "build";

/// Fixed set of directories used by one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub base: PathBuf,
    pub sources: PathBuf,
    pub build_tmp: PathBuf,
    pub install: PathBuf,
    pub bin: PathBuf,
    pub include: PathBuf,
    pub lib: PathBuf,
}

impl WorkspaceLayout {
    /// Derive the layout from `base`. Touches nothing on disk.
    pub fn resolve(base: &Path) -> Self {
        let install = base.join(INSTALL_DIR);
        Self {
            base: base.to_path_buf(),
            sources: base.join(SOURCES_DIR),
            build_tmp: base.join(BUILD_TMP_DIR),
            bin: install.join("bin"),
            include: install.join("include"),
            lib: install.join("lib"),
            install,
        }
    }

    /// Wipe the install prefix and scratch area, then recreate them empty.
    ///
    /// The sources directory is never touched.
    pub fn prepare(&self) -> Result<()> {
        remove_dir_if_exists(&self.install)?;
        remove_dir_if_exists(&self.build_tmp)?;

        make_dir(&self.build_tmp)?;
        for dir in [&self.install, &self.bin, &self.include, &self.lib] {
            make_dir(dir)?;
        }
        Ok(())
    }

    /// Remove install prefix and scratch area without recreating them.
    pub fn clean(&self) -> Result<()> {
        remove_dir_if_exists(&self.install)?;
        remove_dir_if_exists(&self.build_tmp)
    }

    /// Directory an archive with the given extraction name unpacks to.
    pub fn extracted_dir(&self, dir_name: &str) -> PathBuf {
        self.build_tmp.join(dir_name)
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            info!("RMDIR: {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).io_context(|| format!("removing '{}'", dir.display())),
    }
}

fn make_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).io_context(|| format!("creating '{}'", dir.display()))?;
    info!("MKDIR: {}", dir.display());
    Ok(())
}
