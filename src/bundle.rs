//! Read-only model bundles.
//!
//! A bundle is a directory with a `bundle.json` manifest naming its
//! submodel files, how they connect and which analyses can be run on them.
//! Paths in the manifest are relative to the bundle directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PbpkError;
use crate::model::{compose, load_definition, CompartmentalModel, CompositionMap, Submodel};
use crate::scenario::Scenario;

pub const MANIFEST: &str = "bundle.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmodelEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub path: PathBuf,
}

/// A scenario given inline or as a file next to the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioSource {
    Path(PathBuf),
    Inline(Box<Scenario>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub scenario: ScenarioSource,
    /// Submodels to compose; empty means all of them
    #[serde(default)]
    pub submodels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub submodels: Vec<SubmodelEntry>,
    #[serde(default)]
    pub composition: CompositionMap,
    #[serde(default)]
    pub analyses: BTreeMap<String, AnalysisEntry>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Series of the dosed substance, used when the run options name none
    #[serde(default)]
    pub dosed_observables: Vec<String>,
}

/// An opened bundle with every submodel loaded and validated
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
    manifest: BundleManifest,
    submodels: Vec<Submodel>,
}

impl Bundle {
    /// Open the bundle in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PbpkError> {
        let root = dir.as_ref().to_path_buf();
        let path = root.join(MANIFEST);
        let text = std::fs::read_to_string(&path).map_err(|e| PbpkError::io(&path, e))?;
        let manifest: BundleManifest = serde_json::from_str(&text)
            .map_err(|e| PbpkError::parse(path.display().to_string(), e.to_string()))?;

        let mut submodels = Vec::with_capacity(manifest.submodels.len());
        for entry in &manifest.submodels {
            let definition = load_definition(root.join(&entry.path))?;
            submodels.push(Submodel::new(
                entry.id.clone(),
                entry.namespace.clone(),
                definition,
            )?);
        }

        let bundle = Self {
            root,
            manifest,
            submodels,
        };
        bundle.check_references()?;
        tracing::info!(
            bundle = %bundle.manifest.id,
            submodels = bundle.submodels.len(),
            analyses = bundle.manifest.analyses.len(),
            "opened bundle"
        );
        Ok(bundle)
    }

    fn check_references(&self) -> Result<(), PbpkError> {
        for (name, analysis) in &self.manifest.analyses {
            if let Some(unknown) = analysis
                .submodels
                .iter()
                .find(|s| !self.submodels.iter().any(|m| &m.id == *s))
            {
                return Err(PbpkError::scenario(
                    name,
                    format!("unknown submodel '{}'", unknown),
                ));
            }
        }
        for (group, members) in &self.manifest.groups {
            if let Some(unknown) = members
                .iter()
                .find(|m| !self.manifest.analyses.contains_key(*m))
            {
                return Err(PbpkError::scenario(
                    group,
                    format!("group refers to unknown analysis '{}'", unknown),
                ));
            }
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub fn submodels(&self) -> &[Submodel] {
        &self.submodels
    }

    /// Analysis names in lexicographic order
    pub fn analysis_names(&self) -> Vec<&str> {
        self.manifest.analyses.keys().map(String::as_str).collect()
    }

    fn analysis(&self, name: &str) -> Result<&AnalysisEntry, PbpkError> {
        self.manifest
            .analyses
            .get(name)
            .ok_or_else(|| PbpkError::scenario(name, "unknown analysis"))
    }

    /// The scenario of analysis `name`
    pub fn scenario(&self, name: &str) -> Result<Scenario, PbpkError> {
        match &self.analysis(name)?.scenario {
            ScenarioSource::Inline(scenario) => Ok(scenario.as_ref().clone()),
            ScenarioSource::Path(relative) => {
                let path = self.root.join(relative);
                let text =
                    std::fs::read_to_string(&path).map_err(|e| PbpkError::io(&path, e))?;
                serde_json::from_str(&text)
                    .map_err(|e| PbpkError::scenario(name, format!("{}: {}", path.display(), e)))
            }
        }
    }

    /// Compose the submodels analysis `name` runs on
    pub fn model(&self, name: &str) -> Result<CompartmentalModel, PbpkError> {
        let analysis = self.analysis(name)?;
        let selected: Vec<Submodel> = self
            .submodels
            .iter()
            .filter(|s| analysis.submodels.is_empty() || analysis.submodels.contains(&s.id))
            .cloned()
            .collect();
        let ids: Vec<&str> = selected.iter().map(|s| s.id.as_str()).collect();
        let map = self.manifest.composition.restricted_to(&ids);
        compose(&format!("{}_{}", self.manifest.id, name), &selected, &map)
    }

    /// Names of the analyses in group `name`
    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.manifest.groups.get(name).map(Vec::as_slice)
    }
}
