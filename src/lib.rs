//! Builds a fixed set of third-party C libraries from source archives into
//! a local install prefix.
//!
//! A workspace looks like this:
//!
//! ```text
//! <base>/
//!     thirdparty.toml   optional; the built-in manifest is used otherwise
//!     sources/          <library>-<version>.tar.gz archives
//!     build.tmp/        extracted trees, rebuilt from scratch every run
//!     build/            install prefix: bin/ include/ lib/
//! ```
//!
//! A run ([`Orchestrator::run`]) wipes and recreates `build.tmp/` and `build/`,
//! unpacks every archive, prepares the toolchain environment when the host
//! platform needs one (Visual C++ on Windows), builds each dependency in
//! declaration order and finally installs the configured artifacts. The
//! first failing step aborts the run.
//!
//! # Example
//!
//! ```rust,ignore
//! use tps_builder::{Manifest, Orchestrator, WorkspaceLayout};
//!
//! let layout = WorkspaceLayout::resolve(base);
//! let manifest = Manifest::load_or_builtin(base)?;
//! let report = Orchestrator::for_host(layout, &manifest)?.run()?;
//! println!("built {}", report.built.join(", "));
//! ```

pub mod archive;
pub mod error;
pub mod install;
pub mod layout;
pub mod manifest;
pub mod orchestrator;
pub mod platform;
pub mod preflight;
pub mod process;
pub mod run_manifest;
pub mod toolchain;

pub use error::{BuildError, Result};
pub use layout::WorkspaceLayout;
pub use manifest::{DependencySpec, Manifest, Platform};
pub use orchestrator::{Orchestrator, RunReport, RunState};
