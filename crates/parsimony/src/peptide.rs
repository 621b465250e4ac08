use crate::filter::{Builtin, FileScope, FilterKind, FilterLevel, Filterable, ScoreFamily, Value};
use crate::psm::{best_score, Modification, Psm, ReportPsm, ReportPsmSet};
use crate::registry::Peptide;
use itertools::Itertools;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A peptide as reported for one assembly pass: the registered `Peptide`
/// and the PSM sets supporting it, keyed by identification key
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPeptide {
    string_id: String,
    peptide: Peptide,
    psm_sets: BTreeMap<String, ReportPsmSet>,
}

impl ReportPeptide {
    /// Canonical identifier of the peptide a PSM reports: the sequence, or the
    /// sequence followed by its modifications (sorted by position)
    pub fn string_id_of(psm: &Psm, consider_modifications: bool) -> String {
        if consider_modifications && !psm.modifications.is_empty() {
            format!("{}{}", psm.sequence, psm.modification_string())
        } else {
            psm.sequence.clone()
        }
    }

    pub fn new(string_id: String, peptide: Peptide) -> Self {
        Self {
            string_id,
            peptide,
            psm_sets: BTreeMap::new(),
        }
    }

    pub fn string_id(&self) -> &str {
        &self.string_id
    }

    pub fn peptide(&self) -> &Peptide {
        &self.peptide
    }

    pub fn sequence(&self) -> &str {
        &self.peptide.sequence
    }

    /// Attach a PSM to the set for `key`, creating the set if needed
    pub fn add_psm(&mut self, key: String, psm: Arc<ReportPsm>) {
        match self.psm_sets.get_mut(&key) {
            Some(set) => set.add(psm),
            None => {
                self.psm_sets
                    .insert(key.clone(), ReportPsmSet::new(key, psm));
            }
        }
    }

    pub fn psm_set(&self, key: &str) -> Option<&ReportPsmSet> {
        self.psm_sets.get(key)
    }

    pub fn psm_sets(&self) -> impl Iterator<Item = &ReportPsmSet> + '_ {
        self.psm_sets.values()
    }

    pub fn psm_sets_mut(&mut self) -> impl Iterator<Item = &mut ReportPsmSet> + '_ {
        self.psm_sets.values_mut()
    }

    pub fn retain_psm_sets<F: FnMut(&ReportPsmSet) -> bool>(&mut self, mut f: F) {
        self.psm_sets.retain(|_, set| f(set));
    }

    pub fn psms(&self, scope: FileScope) -> impl Iterator<Item = &ReportPsm> + '_ {
        self.psm_sets.values().flat_map(move |set| set.psms_in(scope))
    }

    pub fn nr_psms(&self, scope: FileScope) -> usize {
        self.psms(scope).count()
    }

    /// Number of PSM sets (distinct spectrum identifications) with at least
    /// one PSM in scope
    pub fn nr_spectra(&self, scope: FileScope) -> usize {
        self.psm_sets
            .values()
            .filter(|set| set.psms_in(scope).next().is_some())
            .count()
    }

    pub fn accessions(&self) -> Vec<&str> {
        self.psm_sets
            .values()
            .flat_map(|set| set.psms())
            .flat_map(|psm| psm.accessions.iter().map(|s| s.as_str()))
            .unique()
            .sorted()
            .collect()
    }

    pub fn is_unique(&self) -> bool {
        self.accessions().len() == 1
    }

    pub fn modifications(&self) -> Vec<&Modification> {
        self.psm_sets
            .values()
            .flat_map(|set| set.psms())
            .flat_map(|psm| psm.psm.modifications.iter())
            .unique_by(|m| m.to_string())
            .collect()
    }

    pub fn missed_cleavages(&self) -> Option<u8> {
        self.psm_sets
            .values()
            .flat_map(|set| set.psms())
            .map(|psm| psm.psm.missed_cleavages)
            .next()
    }

    /// Best value of `score` over all PSM sets in scope
    pub fn score(&self, score: &str, scope: FileScope) -> Option<f64> {
        best_score(
            score,
            self.psm_sets
                .values()
                .filter_map(|set| set.score(score, scope)),
        )
    }

    /// Same owning peptide and identical PSM membership in every set
    pub fn is_equivalent(&self, other: &ReportPeptide) -> bool {
        self.string_id == other.string_id
            && self.peptide.id == other.peptide.id
            && self.psm_sets.len() == other.psm_sets.len()
            && self
                .psm_sets
                .iter()
                .zip(other.psm_sets.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.same_members(b))
    }
}

impl Filterable for ReportPeptide {
    fn level(&self) -> FilterLevel {
        FilterLevel::Peptide
    }

    fn value(&self, kind: &FilterKind, scope: FileScope) -> Option<Value<'_>> {
        match kind {
            FilterKind::Builtin(builtin) => {
                let value = match builtin {
                    Builtin::PeptideSequence => Value::Text(Cow::Borrowed(self.sequence())),
                    Builtin::PeptideAccessions => Value::List(
                        self.accessions().into_iter().map(Cow::Borrowed).collect(),
                    ),
                    Builtin::NrPsmsPerPeptide => Value::Number(self.nr_psms(scope) as f64),
                    Builtin::NrSpectraPerPeptide => Value::Number(self.nr_spectra(scope) as f64),
                    Builtin::PeptideMissedCleavages => {
                        Value::Number(self.missed_cleavages()? as f64)
                    }
                    Builtin::PeptideUnique => Value::Bool(self.is_unique()),
                    Builtin::PeptideModifications => Value::Modifications(self.modifications()),
                    _ => return None,
                };
                Some(value)
            }
            FilterKind::Score {
                family: ScoreFamily::PeptideScore,
                score,
            } => self.score(score, scope).map(Value::Number),
            FilterKind::Score { .. } => None,
        }
    }
}
