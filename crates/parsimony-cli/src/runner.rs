use crate::input::{Evidence, Settings};
use anyhow::Context;
use fnv::FnvHashMap;
use log::info;
use parsimony_core::connectivity::ConnectionMap;
use parsimony_core::group::GroupGraph;
use parsimony_core::inference::ProteinInference;
use parsimony_core::psm::{ReportPsm, ReportPsmSet};
use parsimony_core::registry::Registry;
use parsimony_core::scoring::build_scoring;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub struct Runner {
    pub parameters: Settings,
    pub registry: Registry,
    pub graph: GroupGraph,
    pub canonical: FnvHashMap<String, ReportPsmSet>,
    start: Instant,
}

impl Runner {
    pub fn new(parameters: Settings) -> anyhow::Result<Self> {
        let start = Instant::now();
        let evidence = Evidence::load(&parameters.evidence)
            .with_context(|| format!("Failed to read evidence from `{}`", parameters.evidence))?;

        let Evidence {
            registry,
            groups,
            report_psms,
            psm_sets,
        } = evidence;
        let (registry, connections) = registry.restore()?;
        info!(
            "loaded {} accessions, {} peptides, {} PSMs from {} files",
            registry.accession_count(),
            registry.peptide_count(),
            registry.psm_count(),
            registry.files().count()
        );

        let graph = GroupGraph::new(groups);
        info!("- {} groups", graph.len());

        let psms = Self::report_psms(&registry, &connections, report_psms)?;
        let mut canonical = ReportPsmSet::collect(psms, &parameters.psm_set_settings);
        for entry in psm_sets {
            match canonical.get_mut(&entry.key) {
                Some(set) => {
                    set.fdr = entry.fdr;
                    set.fdr_score = entry.fdr_score;
                    set.q_value = entry.q_value;
                    set.rank = entry.rank;
                    set.fdr_good = entry.fdr_good;
                }
                None => log::warn!("no PSM set with key `{}`, ignoring its FDR data", entry.key),
            }
        }
        info!(
            "- built {} PSM sets in {:?}ms",
            canonical.len(),
            start.elapsed().as_millis()
        );

        Ok(Self {
            parameters,
            registry,
            graph,
            canonical,
            start,
        })
    }

    /// Wrap every committed PSM for reporting, annotated by its entry in the
    /// evidence file if one exists
    fn report_psms(
        registry: &Registry,
        connections: &ConnectionMap,
        entries: Vec<crate::input::ReportPsmEntry>,
    ) -> anyhow::Result<Vec<Arc<ReportPsm>>> {
        let mut entries = entries
            .into_iter()
            .map(|entry| (entry.psm, entry))
            .collect::<FnvHashMap<_, _>>();

        let mut psms = Vec::with_capacity(registry.psm_count());
        for id in registry.psm_ids() {
            let psm = registry
                .psm(id)
                .with_context(|| format!("PSM {} vanished from the registry", id.0))?;
            let entry = entries.remove(&id).unwrap_or_default();

            let mut report = ReportPsm::new(psm.clone());
            report.accessions = match entry.accessions {
                Some(accessions) => accessions,
                None => connections
                    .accessions_of_sequence(registry, &psm.sequence)
                    .map(|accs| {
                        let mut names = accs
                            .into_iter()
                            .map(|a| a.accession.clone())
                            .collect::<Vec<_>>();
                        names.sort();
                        names
                    })
                    .unwrap_or_default(),
            };
            report.decoy = entry.decoy;
            report.ranks = entry.ranks;
            report.fdr_score = entry.fdr_score;
            report.q_value = entry.q_value;
            psms.push(Arc::new(report));
        }

        for id in entries.keys() {
            log::warn!("report entry for unknown PSM {}", id.0);
        }
        Ok(psms)
    }

    // Create a path for `file_name` in the specified output directory
    pub fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        let mut path = self.parameters.output_directory.clone();
        path.push(file_name.as_ref());
        path
    }

    pub fn run(mut self) -> anyhow::Result<Settings> {
        let mut inference = ProteinInference::new(self.parameters.inference)
            .with_psm_set_settings(self.parameters.psm_set_settings)
            .with_modifications(self.parameters.consider_modifications)
            .with_threads(self.parameters.threads);
        if let Some(scoring) = &self.parameters.scoring {
            inference = inference.with_scoring(build_scoring(scoring));
        }

        if let Err(errors) = inference.add_filters_from_strings(&self.parameters.filters) {
            log::warn!(
                "{} of {} filters could not be parsed and are ignored",
                errors.0.len(),
                self.parameters.filters.len()
            );
        }
        info!("- {} filters active", inference.filters().len());

        let time = Instant::now();
        let proteins = inference.assemble(&self.registry, &self.graph, &self.canonical)?;
        info!(
            "- inference: {:8} ms ({} proteins)",
            time.elapsed().as_millis(),
            proteins.len()
        );
        let decoys = proteins.iter().filter(|p| p.is_decoy()).count();
        info!(
            "reported {} target and {} decoy proteins",
            proteins.len() - decoys,
            decoys
        );

        let path = self.write_proteins(&proteins)?;
        self.parameters.output_paths.push(path);

        let path = self.make_path("results.json");
        self.parameters.output_paths.push(path.display().to_string());
        println!("{}", serde_json::to_string_pretty(&self.parameters)?);

        let bytes = serde_json::to_vec_pretty(&self.parameters)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;

        info!("finished in {}s", self.start.elapsed().as_secs());
        Ok(self.parameters)
    }
}
