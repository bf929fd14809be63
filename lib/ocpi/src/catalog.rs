//! Version catalog and version selection.
//!
//! The local party's catalog lists the versions it can speak, each with the
//! module endpoints it exposes under that version. Selection picks the
//! version to negotiate from a peer's advertised list:
//!
//! 1. If a version is pinned, the first peer entry with exactly that id is
//!    chosen, provided the catalog accepts it.
//! 2. Otherwise the numerically highest entry the catalog accepts wins.
//!    Numerically equal ids (`2.2` / `2.2.0`) keep the peer's listing order,
//!    so the first one listed is chosen.

use std::cmp::Ordering;

use crate::error::OcpiError;
use crate::types::{Endpoint, ModuleId, VersionDetail, VersionId, VersionInformation};

/// Versions the local party supports.
#[derive(Debug, Clone, Default)]
pub struct VersionCatalog {
    entries: Vec<(VersionInformation, VersionDetail)>,
}

impl VersionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog that accepts the given ids without describing local endpoints.
    pub fn accepting<I, V>(versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<VersionId>,
    {
        let mut catalog = Self::new();
        for version in versions {
            let version = version.into();
            catalog = catalog.with_version(
                VersionInformation::new(version.clone(), String::new()),
                Vec::new(),
            );
        }
        catalog
    }

    /// Add (or replace) a version and the endpoints exposed under it.
    pub fn with_version(mut self, info: VersionInformation, endpoints: Vec<Endpoint>) -> Self {
        self.entries.retain(|(i, _)| i.version != info.version);
        let detail = VersionDetail {
            version: info.version.clone(),
            endpoints,
        };
        self.entries.push((info, detail));
        self
    }

    pub fn accepts(&self, version: &VersionId) -> bool {
        self.entries.iter().any(|(i, _)| &i.version == version)
    }

    pub fn versions(&self) -> Vec<VersionInformation> {
        self.entries.iter().map(|(i, _)| i.clone()).collect()
    }

    pub fn detail(&self, version: &VersionId) -> Option<&VersionDetail> {
        self.entries
            .iter()
            .find(|(i, _)| &i.version == version)
            .map(|(_, d)| d)
    }

    /// Whether we expose `module` under `version`.
    pub fn supports_module(&self, version: &VersionId, module: &ModuleId) -> bool {
        self.detail(version)
            .map(|d| d.endpoint(module).is_some())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick the version to negotiate from a peer's list.
    pub fn select(
        &self,
        offered: &[VersionInformation],
        pinned: Option<&VersionId>,
    ) -> Result<VersionInformation, OcpiError> {
        if offered.is_empty() {
            return Err(OcpiError::NoCompatibleVersion(
                "peer advertised no versions".to_string(),
            ));
        }

        if let Some(pin) = pinned {
            if !self.accepts(pin) {
                return Err(OcpiError::NoCompatibleVersion(format!(
                    "pinned version {} is not supported locally",
                    pin
                )));
            }
            return offered
                .iter()
                .find(|v| &v.version == pin)
                .cloned()
                .ok_or_else(|| {
                    OcpiError::NoCompatibleVersion(format!(
                        "peer does not offer pinned version {}",
                        pin
                    ))
                });
        }

        let mut best: Option<&VersionInformation> = None;
        for candidate in offered.iter().filter(|v| self.accepts(&v.version)) {
            best = match best {
                Some(current)
                    if candidate.version.cmp_numeric(&current.version) != Ordering::Greater =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }

        best.cloned().ok_or_else(|| {
            let offered: Vec<&str> = offered.iter().map(|v| v.version.as_str()).collect();
            OcpiError::NoCompatibleVersion(format!(
                "none of [{}] is supported locally",
                offered.join(", ")
            ))
        })
    }
}
