use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tps_builder::manifest::{BuildStep, StepContext};
use tps_builder::toolchain::msvc::ToolchainResolver;
use tps_builder::{Manifest, Orchestrator, Platform, WorkspaceLayout};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  tps-builder build [BASE_DIR]\n  tps-builder plan [BASE_DIR]\n  tps-builder clean [BASE_DIR]\n  tps-builder env [BASE_DIR]\n\nBASE_DIR defaults to the current directory."
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .without_time()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd] => dispatch(cmd, None),
        [cmd, base] => dispatch(cmd, Some(Path::new(base))),
        _ => bail!(usage()),
    }
}

fn dispatch(cmd: &str, base: Option<&Path>) -> Result<()> {
    match cmd {
        "build" => build(&base_dir(base)?),
        "plan" => plan(&base_dir(base)?),
        "clean" => clean(&base_dir(base)?),
        "env" => env(&base_dir(base)?),
        _ => bail!(usage()),
    }
}

fn base_dir(arg: Option<&Path>) -> Result<PathBuf> {
    let raw = match arg {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("reading current directory")?,
    };
    let base = std::path::absolute(&raw)
        .with_context(|| format!("resolving base directory '{}'", raw.display()))?;
    if !base.is_dir() {
        bail!("base directory '{}' does not exist", base.display());
    }
    Ok(base)
}

fn build(base: &Path) -> Result<()> {
    let layout = WorkspaceLayout::resolve(base);
    let manifest = Manifest::load_or_builtin(base)?;
    println!("Using manifest {}", manifest.origin().display());

    let mut orchestrator = Orchestrator::for_host(layout.clone(), &manifest)?;
    let report = orchestrator
        .run()
        .with_context(|| format!("building third-party dependencies in '{}'", base.display()))?;

    println!();
    println!("Built: {}", report.built.join(", "));
    println!("Installed {} artifact(s) into {}", report.installed.len(), layout.install.display());
    if let Some(audit) = &report.environment {
        println!(
            "Toolchain environment: {} set, {} kept",
            audit.set.len(),
            audit.kept.len()
        );
    }
    println!("Run record: {}", report.record.display());
    Ok(())
}

fn plan(base: &Path) -> Result<()> {
    let layout = WorkspaceLayout::resolve(base);
    let manifest = Manifest::load_or_builtin(base)?;
    let platform = Platform::host();
    let deps = manifest.dependencies_for(platform, &layout)?;

    println!("Manifest: {}", manifest.origin().display());
    println!("Platform: {}", platform);
    println!("Install root: {}", layout.install.display());
    if deps.is_empty() {
        println!("(no dependencies for this platform)");
    }

    for (i, dep) in deps.iter().enumerate() {
        let ctx = StepContext::new(&layout, &dep.source_dir);
        println!();
        println!("[{}] {}", i + 1, dep.name);
        println!("    archive: {}", dep.archive.display());
        if !dep.recipe.requires.is_empty() {
            println!("    requires: {}", dep.recipe.requires.join(", "));
        }
        for step in &dep.recipe.steps {
            match step {
                BuildStep::Run { run } => {
                    println!("    run: {}", ctx.render(run))
                }
                BuildStep::Patch { patch, replace } => {
                    println!("    patch: {} ({} replacement(s))", patch, replace.len())
                }
            }
        }
        for rule in &dep.recipe.install {
            println!("    install: {} -> {}", rule.from, layout.install.join(&rule.to).display());
        }
    }
    Ok(())
}

fn clean(base: &Path) -> Result<()> {
    let layout = WorkspaceLayout::resolve(base);
    layout
        .clean()
        .with_context(|| format!("cleaning workspace '{}'", base.display()))?;
    println!("Removed {} and {}", layout.build_tmp.display(), layout.install.display());
    Ok(())
}

fn env(base: &Path) -> Result<()> {
    if Platform::host() != Platform::Windows {
        bail!("the 'env' command captures the Visual C++ environment and is only available on Windows");
    }
    let manifest = Manifest::load_or_builtin(base)?;
    let resolver = ToolchainResolver::from_config(manifest.toolchain())?;
    let snapshot = resolver
        .resolve()
        .with_context(|| format!("running '{}'", resolver.setup_script().display()))?;
    for (name, value) in snapshot.iter() {
        println!("{}={}", name, value);
    }
    Ok(())
}
