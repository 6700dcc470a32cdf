//! Preflight checks for build validation.
//!
//! Verifies that every host tool a dependency recipe `requires` can be found
//! on `PATH` before the first build step runs. On Windows this happens after
//! the toolchain environment has been injected, so `nmake`/`cl` are visible.
//!
//! # Example
//!
//! ```rust
//! use tps_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("make") {
//!     println!("make is not installed");
//! }
//!
//! let tools = vec!["sh".to_string()];
//! if let Err(e) = check_required_tools(&tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{BuildError, Result};
use crate::manifest::DependencySpec;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Reports every missing tool at once rather than stopping at the first.
pub fn check_required_tools(tools: &[String]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .map(String::as_str)
        .filter(|tool| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        return Err(BuildError::toolchain(format!(
            "missing required host tools: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Collect the tools required by `deps`, de-duplicated in declaration order.
pub fn required_tools(deps: &[DependencySpec]) -> Vec<String> {
    let mut tools: Vec<String> = Vec::new();
    for tool in deps.iter().flat_map(|d| d.recipe.requires.iter()) {
        if !tools.contains(tool) {
            tools.push(tool.clone());
        }
    }
    tools
}
