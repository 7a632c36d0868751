//! DLC manifest parsing and semver dependency-constraint resolution.
//!
//! The constraint grammar (`name<op><version>[,<op><version>...]`) and
//! the "does this name refer to the kernel itself" special case follow
//! `BrainCore._parse_dependency` / `_validate_dependency` in the
//! original kernel; `semver`'s `Version`/`VersionReq` replace Python's
//! `packaging.specifiers.SpecifierSet` as the idiomatic Rust
//! equivalent (first seen in this form among the broader example pack,
//! not the donor crate itself — see `DESIGN.md`).

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid semver version {0:?}: {1}")]
    InvalidVersion(String, semver::Error),

    #[error("invalid dependency constraint {0:?}: {1}")]
    InvalidConstraint(String, semver::Error),

    #[error("dependency {name:?} requires version {constraint}, kernel is {actual}")]
    KernelVersionMismatch {
        name: String,
        constraint: String,
        actual: String,
    },

    #[error("dependency {0:?} is not registered")]
    UnresolvedDependency(String),

    #[error("dependency {name:?} version {actual} does not satisfy {constraint}")]
    VersionMismatch {
        name: String,
        actual: String,
        constraint: String,
    },

    #[error("dependency string is empty")]
    EmptyDependency,
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// The category of functionality a bundle provides, matching the
/// kernel's `BrainDLCType` enumeration exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlcKind {
    Core,
    Optimization,
    Processor,
    Manager,
    Resolver,
}

/// Immutable bundle metadata, deserialized from the manifest the
/// bundle carries alongside its binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub kind: DlcKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A parsed `name<op><version>[,<op><version>...]` dependency
/// constraint.
#[derive(Debug, Clone)]
pub struct DependencyConstraint {
    pub name: String,
    pub requirement: Option<VersionReq>,
}

/// Split at the first version-operator character, matching
/// `_parse_dependency`'s `"<>=!~"` split set.
pub fn parse_constraint(raw: &str) -> Result<DependencyConstraint> {
    if raw.trim().is_empty() {
        return Err(ManifestError::EmptyDependency);
    }

    let split_at = raw.find(['<', '>', '=', '!', '~']);

    let Some(idx) = split_at else {
        let name = raw.trim().to_string();
        if name.is_empty() {
            return Err(ManifestError::EmptyDependency);
        }
        return Ok(DependencyConstraint { name, requirement: None });
    };

    let name = raw[..idx].trim().to_string();
    if name.is_empty() {
        return Err(ManifestError::EmptyDependency);
    }
    let spec = raw[idx..].trim();
    let requirement = VersionReq::parse(&normalize_requirement(spec))
        .map_err(|e| ManifestError::InvalidConstraint(raw.to_string(), e))?;

    Ok(DependencyConstraint {
        name,
        requirement: Some(requirement),
    })
}

/// `semver::VersionReq` expects a leading comparator per clause and no
/// bare `!=`; translate the kernel's comma-separated clauses into that
/// form (`~=` becomes `~`, the closest semver-crate equivalent of a
/// compatible-release constraint).
fn normalize_requirement(spec: &str) -> String {
    spec.split(',')
        .map(|clause| clause.trim().replace("~=", "~"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate a dependency constraint against either the kernel's own
/// identity (when `name` matches `kernel_name` or one of
/// `kernel_aliases`) or a registered peer's manifest.
pub fn validate_dependency(
    raw: &str,
    kernel_name: &str,
    kernel_version: &str,
    kernel_aliases: &[&str],
    registered: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let constraint = parse_constraint(raw)?;

    let is_kernel_alias =
        constraint.name == kernel_name || kernel_aliases.contains(&constraint.name.as_str());

    if is_kernel_alias {
        let actual = Version::parse(kernel_version)
            .map_err(|e| ManifestError::InvalidVersion(kernel_version.to_string(), e))?;
        if let Some(req) = &constraint.requirement {
            if !req.matches(&actual) {
                return Err(ManifestError::KernelVersionMismatch {
                    name: constraint.name,
                    constraint: raw.to_string(),
                    actual: kernel_version.to_string(),
                });
            }
        }
        return Ok(());
    }

    let Some(actual_version) = registered(&constraint.name) else {
        return Err(ManifestError::UnresolvedDependency(constraint.name));
    };

    if let Some(req) = &constraint.requirement {
        let actual = Version::parse(&actual_version)
            .map_err(|e| ManifestError::InvalidVersion(actual_version.clone(), e))?;
        if !req.matches(&actual) {
            return Err(ManifestError::VersionMismatch {
                name: constraint.name,
                actual: actual_version,
                constraint: raw.to_string(),
            });
        }
    }

    Ok(())
}
