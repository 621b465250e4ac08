use anyhow::{ensure, Context};
use clap::ArgMatches;
use parsimony_core::{
    group::Group,
    inference::InferenceMethod,
    psm::{PsmId, PsmSetSettings},
    registry::RegistrySnapshot,
    scoring::ScoringSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Serialize)]
/// Actual assembly parameters - may include overrides or default values not set by user
pub struct Settings {
    pub version: String,
    pub evidence: String,
    pub inference: InferenceMethod,
    pub consider_modifications: bool,
    pub psm_set_settings: PsmSetSettings,
    pub filters: Vec<String>,
    pub scoring: Option<ScoringSettings>,
    pub threads: i32,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

#[derive(Deserialize)]
/// Input parameters deserialized from JSON file
pub struct Input {
    evidence: Option<String>,
    output_directory: Option<String>,
    threads: Option<i32>,
    consider_modifications: Option<bool>,
    psm_set_settings: Option<PsmSetSettings>,
    filters: Option<Vec<String>>,
    inference: Option<InferenceMethod>,
    scoring: Option<ScoringSettings>,
}

/// Report-level annotation of a committed PSM
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct ReportPsmEntry {
    pub psm: PsmId,
    /// Accessions the PSM maps to; taken from the connectivity of its
    /// peptide when absent
    #[serde(default)]
    pub accessions: Option<Vec<String>>,
    #[serde(default)]
    pub decoy: bool,
    #[serde(default)]
    pub ranks: BTreeMap<String, u32>,
    #[serde(default)]
    pub fdr_score: Option<f64>,
    #[serde(default)]
    pub q_value: Option<f64>,
}

/// FDR data computed upstream for a whole PSM set
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct PsmSetEntry {
    pub key: String,
    #[serde(default)]
    pub fdr: Option<f64>,
    #[serde(default)]
    pub fdr_score: Option<f64>,
    #[serde(default)]
    pub q_value: Option<f64>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub fdr_good: bool,
}

/// Registry contents, the group graph from clustering, and report-level
/// PSM annotations
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct Evidence {
    pub registry: RegistrySnapshot,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub report_psms: Vec<ReportPsmEntry>,
    #[serde(default)]
    pub psm_sets: Vec<PsmSetEntry>,
}

impl Evidence {
    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        parsimony_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("missing parameter file")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(evidence) = matches.get_one::<String>("evidence") {
            log::trace!("overriding `evidence` parameter.");
            input.evidence = Some(evidence.into());
        }
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(threads) = matches.get_one::<i32>("threads").copied() {
            log::trace!("overriding `threads` parameter.");
            input.threads = Some(threads);
        }
        if let Some(filters) = matches.get_many::<String>("filter") {
            let filters = filters.cloned().collect::<Vec<_>>();
            log::trace!("adding {} filters from the command line.", filters.len());
            input
                .filters
                .get_or_insert_with(Vec::new)
                .extend(filters);
        }

        ensure!(
            input.evidence.is_some(),
            "`evidence` must be set. For more information try '--help'"
        );

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        parsimony_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }

    pub fn build(self) -> anyhow::Result<Settings> {
        let evidence = self
            .evidence
            .context("'evidence' must be provided!")?;

        if let Some(scoring) = &self.scoring {
            ensure!(
                !scoring.score.is_empty(),
                "`scoring.score` must name a PSM score"
            );
        }

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create `{}`", path.display()))?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(Settings {
            version: clap::crate_version!().into(),
            evidence,
            inference: self.inference.unwrap_or_default(),
            consider_modifications: self.consider_modifications.unwrap_or(false),
            psm_set_settings: self.psm_set_settings.unwrap_or_default(),
            filters: self.filters.unwrap_or_default(),
            scoring: self.scoring,
            threads: self.threads.unwrap_or(num_cpus::get() as i32),
            output_paths: Vec::new(),
            output_directory,
        })
    }
}
