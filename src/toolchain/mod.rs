//! Native toolchain environment capture and injection.
//!
//! The vendor setup script (e.g. `vcvarsall.bat`) only mutates the
//! environment of the shell it runs in. To reuse that environment we run the
//! script followed by a command that prints every variable, parse the dump
//! into an [`EnvironmentSnapshot`], and merge the result into our own process
//! environment once, before any build step runs.
//!
//! Parsing, de-duplication and merge planning are pure and work on either
//! path convention ([`PathStyle`]); only [`EnvInjector::inject`] touches the
//! process environment.

pub mod codepage;
pub mod msvc;

use std::collections::{BTreeMap, HashSet};
use std::env;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// Variables we take from the toolchain dump.
pub const INTERESTING: &[&str] = &["include", "lib", "libpath", "path"];

/// Path conventions for list-valued variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// `;`-separated lists, `\` separators, drive prefixes.
    Windows,
    /// `:`-separated lists, `/` separators.
    Posix,
}

impl PathStyle {
    pub fn host() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Posix
        }
    }

    /// Separator between entries of `PATH`-like variables.
    pub fn list_separator(self) -> char {
        match self {
            PathStyle::Windows => ';',
            PathStyle::Posix => ':',
        }
    }

    fn dir_separator(self) -> char {
        match self {
            PathStyle::Windows => '\\',
            PathStyle::Posix => '/',
        }
    }

    fn is_dir_separator(self, c: char) -> bool {
        match self {
            PathStyle::Windows => c == '\\' || c == '/',
            PathStyle::Posix => c == '/',
        }
    }
}

/// Byte encoding of a captured variable dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEncoding {
    Utf8,
    /// A Windows code page number. [`codepage::ANSI`] is the active ANSI page.
    CodePage(u32),
}

impl OutputEncoding {
    /// The host's native multi-byte encoding.
    pub fn native() -> Self {
        if cfg!(windows) {
            OutputEncoding::CodePage(codepage::ANSI)
        } else {
            OutputEncoding::Utf8
        }
    }

    /// Decode one line, or `None` if the bytes are invalid in this encoding.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            OutputEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            OutputEncoding::CodePage(page) => codepage::decode(page, bytes),
        }
    }
}

/// Toolchain variables keyed by lower-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Keep only the [`INTERESTING`] variables.
    pub fn interesting(mut self) -> Self {
        self.vars.retain(|k, _| INTERESTING.contains(&k.as_str()));
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into().to_lowercase(), v.into()))
                .collect(),
        }
    }
}

/// Parse the output of a "print all variables" command.
///
/// Lines are decoded one at a time with `encoding`; a line that is not valid
/// text is skipped without affecting the others. A line is an assignment iff
/// it contains exactly one `=`.
pub fn parse_env_output(raw: &[u8], style: PathStyle, encoding: OutputEncoding) -> EnvironmentSnapshot {
    let sep = style.list_separator();
    let mut vars = BTreeMap::new();
    let mut undecodable = 0usize;

    for bytes in raw.split(|b| *b == b'\n') {
        let Some(line) = encoding.decode(bytes) else {
            undecodable += 1;
            continue;
        };
        let line = line.trim();
        if line.matches('=').count() != 1 {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let value = value.strip_suffix(sep).unwrap_or(value);
        vars.insert(key.to_lowercase(), dedupe_segments(value, sep));
    }

    if undecodable > 0 {
        debug!("skipped {} undecodable line(s) of toolchain output", undecodable);
    }
    EnvironmentSnapshot { vars }
}

/// Remove repeated entries from a separator-joined list, keeping the first
/// occurrence of each.
pub fn dedupe_segments(value: &str, sep: char) -> String {
    let mut seen = HashSet::new();
    value
        .split(sep)
        .filter(|segment| seen.insert(*segment))
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}

/// Lexically normalize one path entry: unify separators, collapse `.` and
/// `..`, drop redundant and trailing separators. Case is preserved.
///
/// On Windows a `C:` drive or a `\\server\share` UNC prefix is kept intact and
/// `..` never climbs above it.
pub fn normalize_segment(segment: &str, style: PathStyle) -> String {
    let sep = style.dir_separator();

    if style == PathStyle::Windows {
        if let Some((mut out, remainder)) = split_unc(segment, style) {
            for part in collapse(remainder, style, true) {
                out.push(sep);
                out.push_str(part);
            }
            return out;
        }
    }

    let mut rest = segment;
    let mut prefix = String::new();
    if style == PathStyle::Windows {
        let bytes = rest.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
            prefix.push_str(&rest[..2]);
            rest = &rest[2..];
        }
    }
    let rooted = rest.starts_with(|c: char| style.is_dir_separator(c));

    let mut out = prefix;
    if rooted {
        out.push(sep);
    }
    out.push_str(&collapse(rest, style, rooted).join(&sep.to_string()));
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Split `\\server\share\rest` into the `\\server\share` prefix and `rest`.
fn split_unc(segment: &str, style: PathStyle) -> Option<(String, &str)> {
    let is_sep = |c: char| style.is_dir_separator(c);
    let mut chars = segment.chars();
    if !(chars.next().is_some_and(is_sep) && chars.next().is_some_and(is_sep)) {
        return None;
    }
    let after = &segment[2..];
    if after.is_empty() || after.starts_with(is_sep) {
        return None;
    }

    let mut components = after.splitn(3, is_sep);
    let server = components.next().unwrap_or_default();
    let share = components.next().unwrap_or_default();
    let remainder = components.next().unwrap_or_default();

    let sep = style.dir_separator();
    let mut prefix = format!("{sep}{sep}{server}");
    if !share.is_empty() {
        prefix.push(sep);
        prefix.push_str(share);
    }
    Some((prefix, remainder))
}

/// Resolve `.` and `..` components. A rooted path drops `..` at the root.
fn collapse(rest: &str, style: PathStyle, rooted: bool) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split(|c: char| style.is_dir_separator(c)) {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    parts
}

/// Concatenate two path lists, normalizing every entry and keeping the first
/// occurrence of each normalized form. Empty entries are dropped.
pub fn merge_path_lists(first: &str, second: &str, style: PathStyle) -> String {
    let sep = style.list_separator();
    let mut seen = HashSet::new();
    first
        .split(sep)
        .chain(second.split(sep))
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| normalize_segment(segment.trim(), style))
        .filter(|normalized| seen.insert(normalized.clone()))
        .collect::<Vec<_>>()
        .join(&sep.to_string())
}

/// One variable to write into the process environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvAssignment {
    pub name: String,
    pub value: String,
}

/// Fully computed merge, applied all at once or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub assignments: Vec<EnvAssignment>,
    /// Upper-cased names left alone because the process already had them.
    pub kept: Vec<String>,
}

/// Decide how a resolved snapshot merges into an environment.
///
/// Non-`path` variables are only set when `current` has no value for the
/// upper-cased name. `PATH` is always rewritten to the toolchain entries
/// followed by the existing entries.
pub fn plan_merge<F>(snapshot: &EnvironmentSnapshot, current: F, style: PathStyle) -> Result<MergePlan>
where
    F: Fn(&str) -> Option<String>,
{
    let resolved_path = snapshot
        .get("path")
        .ok_or_else(|| BuildError::toolchain("toolchain environment does not define PATH"))?;

    let mut plan = MergePlan::default();
    for (key, value) in snapshot.iter() {
        if key == "path" {
            continue;
        }
        let name = key.to_uppercase();
        if current(&name).is_some() {
            plan.kept.push(name);
        } else {
            plan.assignments.push(EnvAssignment {
                name,
                value: value.to_string(),
            });
        }
    }

    let existing_path = current("PATH").unwrap_or_default();
    plan.assignments.push(EnvAssignment {
        name: "PATH".to_string(),
        value: merge_path_lists(resolved_path, &existing_path, style),
    });
    Ok(plan)
}

/// Record of what an injection changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionAudit {
    pub set: Vec<String>,
    pub kept: Vec<String>,
}

/// Write-once gate for process environment mutation.
///
/// One injector exists per run; a second injection is refused.
#[derive(Debug, Default)]
pub struct EnvInjector {
    audit: Option<InjectionAudit>,
}

impl EnvInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, plan: MergePlan) -> Result<&InjectionAudit> {
        if self.audit.is_some() {
            return Err(BuildError::toolchain(
                "toolchain environment was already injected for this run",
            ));
        }

        let mut audit = InjectionAudit {
            set: Vec::with_capacity(plan.assignments.len()),
            kept: plan.kept,
        };
        for assignment in plan.assignments {
            env::set_var(&assignment.name, &assignment.value);
            info!("SETENV: {}", assignment.name);
            audit.set.push(assignment.name);
        }
        for name in &audit.kept {
            info!("KEEPENV: {} (already set)", name);
        }
        Ok(self.audit.insert(audit))
    }

    pub fn audit(&self) -> Option<&InjectionAudit> {
        self.audit.as_ref()
    }
}
