use crate::filter::{Builtin, FileScope, FilterKind, FilterLevel, Filterable, Value};
use crate::group::GroupId;
use crate::peptide::ReportPeptide;
use crate::registry::Accession;
use std::borrow::Cow;
use std::sync::Arc;

/// One reportable protein: the accessions of a seed group and its same-set
/// groups, every peptide below the seed, and links to subset proteins.
///
/// Subset proteins are only referenced. Their peptides and accessions never
/// flow into the parent.
#[derive(Debug, Clone, Default)]
pub struct ReportProtein {
    id: GroupId,
    accessions: Vec<Accession>,
    peptides: Vec<Arc<ReportPeptide>>,
    subsets: Vec<Arc<ReportProtein>>,
    score: Option<f64>,
}

impl ReportProtein {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn accessions(&self) -> &[Accession] {
        &self.accessions
    }

    pub fn accession_names(&self) -> Vec<&str> {
        self.accessions.iter().map(|a| a.accession.as_str()).collect()
    }

    /// Returns false if the accession was already present
    pub fn add_accession(&mut self, accession: Accession) -> bool {
        if self.accessions.iter().any(|a| a.id == accession.id) {
            return false;
        }
        self.accessions.push(accession);
        true
    }

    pub fn peptides(&self) -> &[Arc<ReportPeptide>] {
        &self.peptides
    }

    /// Peptides are unique by string id. Returns false for a duplicate.
    pub fn add_peptide(&mut self, peptide: Arc<ReportPeptide>) -> bool {
        if self
            .peptides
            .iter()
            .any(|p| p.string_id() == peptide.string_id())
        {
            return false;
        }
        self.peptides.push(peptide);
        true
    }

    pub fn subsets(&self) -> &[Arc<ReportProtein>] {
        &self.subsets
    }

    pub fn add_subset(&mut self, subset: Arc<ReportProtein>) {
        if !self.subsets.iter().any(|s| s.id == subset.id) {
            self.subsets.push(subset);
        }
    }

    pub fn score(&self) -> Option<f64> {
        self.score
    }

    pub fn set_score(&mut self, score: Option<f64>) {
        self.score = score;
    }

    pub fn nr_peptides(&self, scope: FileScope) -> usize {
        self.peptides
            .iter()
            .filter(|p| p.nr_psms(scope) > 0)
            .count()
    }

    pub fn nr_psms(&self, scope: FileScope) -> usize {
        self.peptides.iter().map(|p| p.nr_psms(scope)).sum()
    }

    pub fn nr_spectra(&self, scope: FileScope) -> usize {
        self.peptides.iter().map(|p| p.nr_spectra(scope)).sum()
    }

    pub fn nr_unique_peptides(&self, scope: FileScope) -> usize {
        self.peptides
            .iter()
            .filter(|p| p.is_unique() && p.nr_psms(scope) > 0)
            .count()
    }

    /// A protein is a decoy if every PSM supporting it is
    pub fn is_decoy(&self) -> bool {
        let mut psms = self
            .peptides
            .iter()
            .flat_map(|p| p.psms(FileScope::All))
            .peekable();
        psms.peek().is_some() && psms.all(|p| p.decoy)
    }
}

impl Filterable for ReportProtein {
    fn level(&self) -> FilterLevel {
        FilterLevel::Protein
    }

    fn value(&self, kind: &FilterKind, scope: FileScope) -> Option<Value<'_>> {
        let builtin = match kind {
            FilterKind::Builtin(builtin) => builtin,
            FilterKind::Score { .. } => return None,
        };
        let value = match builtin {
            Builtin::ProteinAccessions => Value::List(
                self.accession_names()
                    .into_iter()
                    .map(Cow::Borrowed)
                    .collect(),
            ),
            Builtin::NrPeptidesPerProtein => Value::Number(self.nr_peptides(scope) as f64),
            Builtin::NrPsmsPerProtein => Value::Number(self.nr_psms(scope) as f64),
            Builtin::NrSpectraPerProtein => Value::Number(self.nr_spectra(scope) as f64),
            Builtin::NrUniquePeptidesPerProtein => {
                Value::Number(self.nr_unique_peptides(scope) as f64)
            }
            Builtin::ProteinScore => Value::Number(self.score?),
            _ => return None,
        };
        Some(value)
    }
}
