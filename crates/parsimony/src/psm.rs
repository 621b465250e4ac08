//! Peptide-spectrum matches, their identification keys, and the report-level
//! wrappers (`ReportPsm`, `ReportPsmSet`) that carry scores and FDR data into
//! protein assembly.

use crate::filter::{Builtin, FileScope, FilterKind, FilterLevel, Filterable, ScoreFamily, Value};
use crate::registry::FileId;
use fnv::FnvHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PsmId(pub u64);

/// Score identifiers for which smaller values are better. Everything else
/// is treated as "higher is better".
pub const LOWER_IS_BETTER: &[&str] = &[
    "fdr_score",
    "combined_fdr_score",
    "q_value",
    "expect",
    "evalue",
    "pep",
    "mascot_expect",
    "xtandem_expect",
    "msgf_specevalue",
    "msgf_evalue",
];

/// The set-level FDR score, answered by a `ReportPsmSet` itself rather than
/// by its members
pub const FDR_SCORE: &str = "fdr_score";

pub fn higher_is_better(score: &str) -> bool {
    !LOWER_IS_BETTER.contains(&score)
}

/// Pick the best of a series of values for `score`, ignoring NaNs
pub fn best_score<I: IntoIterator<Item = f64>>(score: &str, values: I) -> Option<f64> {
    let values = values.into_iter().filter(|v| !v.is_nan());
    if higher_is_better(score) {
        values.max_by(|a, b| a.total_cmp(b))
    } else {
        values.min_by(|a, b| a.total_cmp(b))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    /// 0 is the N-terminus, `len + 1` the C-terminus
    pub position: usize,
    pub residue: char,
    pub mass: f64,
    #[serde(default)]
    pub description: Option<String>,
}

impl Display for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]{}({:.4})", self.position, self.residue, self.mass)
    }
}

/// A single spectrum identification, as delivered by an input-file parser
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Psm {
    pub id: PsmId,
    pub charge: i32,
    pub mz: f64,
    pub delta_mass: f64,
    pub rt: Option<f64>,
    pub sequence: String,
    pub missed_cleavages: u8,
    pub source_id: String,
    pub spectrum_title: String,
    pub file: FileId,
    #[serde(default)]
    pub modifications: Vec<Modification>,
    /// Search engine scores, keyed by score identifier
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

impl Psm {
    /// Modifications sorted by position, joined into a stable string
    pub fn modification_string(&self) -> String {
        self.modifications
            .iter()
            .sorted_by_key(|m| m.position)
            .map(|m| m.to_string())
            .join("")
    }

    /// Deterministic fingerprint of this PSM over the fields enabled in
    /// `settings`. PSMs with equal keys are merged into one `ReportPsmSet`.
    pub fn identification_key(&self, settings: &PsmSetSettings) -> String {
        let mut parts = Vec::with_capacity(7);
        if settings.source_id {
            parts.push(self.source_id.clone());
        }
        if settings.spectrum_title {
            parts.push(self.spectrum_title.clone());
        }
        if settings.charge {
            parts.push(self.charge.to_string());
        }
        if settings.mz {
            parts.push(format!("{:.4}", self.mz));
        }
        if settings.rt {
            parts.push(
                self.rt
                    .map(|rt| format!("{:.2}", rt))
                    .unwrap_or_else(|| "null".into()),
            );
        }
        if settings.sequence {
            parts.push(self.sequence.clone());
        }
        if settings.modifications {
            parts.push(self.modification_string());
        }
        parts.join(":")
    }
}

/// Which PSM fields take part in the identification key
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsmSetSettings {
    pub charge: bool,
    pub mz: bool,
    pub rt: bool,
    pub source_id: bool,
    pub spectrum_title: bool,
    pub sequence: bool,
    pub modifications: bool,
}

impl Default for PsmSetSettings {
    fn default() -> Self {
        Self {
            charge: true,
            mz: true,
            rt: true,
            source_id: true,
            spectrum_title: true,
            sequence: true,
            modifications: true,
        }
    }
}

/// A committed `Psm` prepared for reporting: accessions it maps to, target/decoy
/// state and per-score identification ranks
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportPsm {
    pub psm: Psm,
    #[serde(default)]
    pub accessions: Vec<String>,
    #[serde(default)]
    pub decoy: bool,
    /// Rank of this identification within its spectrum, per score
    #[serde(default)]
    pub ranks: BTreeMap<String, u32>,
    #[serde(default)]
    pub fdr_score: Option<f64>,
    #[serde(default)]
    pub q_value: Option<f64>,
}

impl ReportPsm {
    pub fn new(psm: Psm) -> Self {
        Self {
            psm,
            ..Default::default()
        }
    }

    pub fn id(&self) -> PsmId {
        self.psm.id
    }

    pub fn sequence(&self) -> &str {
        &self.psm.sequence
    }

    pub fn score(&self, score: &str) -> Option<f64> {
        if score == FDR_SCORE {
            if let Some(fdr_score) = self.fdr_score {
                return Some(fdr_score);
            }
        }
        self.psm.scores.get(score).copied()
    }

    pub fn rank(&self, score: &str) -> Option<u32> {
        self.ranks.get(score).copied()
    }

    pub fn identification_key(&self, settings: &PsmSetSettings) -> String {
        self.psm.identification_key(settings)
    }

    pub fn is_unique(&self) -> bool {
        self.accessions.len() == 1
    }
}

impl Filterable for ReportPsm {
    fn level(&self) -> FilterLevel {
        FilterLevel::Psm
    }

    fn value(&self, kind: &FilterKind, scope: FileScope) -> Option<Value<'_>> {
        if !scope.contains(self.psm.file) {
            return None;
        }
        match kind {
            FilterKind::Builtin(builtin) => {
                psm_value(*builtin, &[self], self.fdr_score, self.q_value)
            }
            FilterKind::Score { family, score } => match family {
                ScoreFamily::PsmScore => self.score(score).map(Value::Number),
                ScoreFamily::PsmTopRank => self.rank(score).map(|r| Value::Number(r as f64)),
                ScoreFamily::PeptideScore => None,
            },
        }
    }
}

/// Field values shared by `ReportPsm` and `ReportPsmSet`. Scalar fields are
/// taken from the first member, list fields are unions over all members.
fn psm_value<'a>(
    builtin: Builtin,
    members: &[&'a ReportPsm],
    fdr_score: Option<f64>,
    q_value: Option<f64>,
) -> Option<Value<'a>> {
    let first: &'a ReportPsm = members.first().copied()?;
    let value = match builtin {
        Builtin::Charge => Value::Number(first.psm.charge as f64),
        Builtin::PsmSequence => Value::Text(Cow::Borrowed(&first.psm.sequence)),
        Builtin::PsmAccessions => Value::List(
            members
                .iter()
                .copied()
                .flat_map(|m| m.accessions.iter())
                .unique()
                .map(|s| Cow::Borrowed(s.as_str()))
                .collect(),
        ),
        Builtin::PsmMissedCleavages => Value::Number(first.psm.missed_cleavages as f64),
        Builtin::PsmDeltaMass => Value::Number(first.psm.delta_mass),
        Builtin::PsmMz => Value::Number(first.psm.mz),
        Builtin::PsmRt => Value::Number(members.iter().find_map(|m| m.psm.rt)?),
        Builtin::PsmSourceId => Value::Text(Cow::Borrowed(&first.psm.source_id)),
        Builtin::PsmFileList => Value::List(
            members
                .iter()
                .map(|m| Cow::Owned(m.psm.file.0.to_string()))
                .unique()
                .collect(),
        ),
        Builtin::PsmModifications => {
            Value::Modifications(first.psm.modifications.iter().collect())
        }
        Builtin::PsmUnique => Value::Bool(members.iter().all(|m| m.is_unique())),
        Builtin::PsmDecoy => Value::Bool(members.iter().all(|m| m.decoy)),
        Builtin::PsmQValue => Value::Number(q_value?),
        Builtin::PsmFdrScore => Value::Number(fdr_score?),
        _ => return None,
    };
    Some(value)
}

/// All PSMs sharing one identification key, plus the FDR data computed for
/// the set as a whole
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPsmSet {
    pub key: String,
    psms: Vec<Arc<ReportPsm>>,
    pub fdr: Option<f64>,
    pub fdr_score: Option<f64>,
    pub q_value: Option<f64>,
    pub rank: Option<u32>,
    pub fdr_good: bool,
}

impl ReportPsmSet {
    /// Sets are never empty: construction requires the first member
    pub fn new(key: String, first: Arc<ReportPsm>) -> Self {
        Self {
            key,
            psms: vec![first],
            fdr: None,
            fdr_score: None,
            q_value: None,
            rank: None,
            fdr_good: false,
        }
    }

    /// Group report PSMs by identification key. Used when no upstream FDR
    /// stage supplies canonical sets.
    pub fn collect<I>(psms: I, settings: &PsmSetSettings) -> FnvHashMap<String, ReportPsmSet>
    where
        I: IntoIterator<Item = Arc<ReportPsm>>,
    {
        let mut sets: FnvHashMap<String, ReportPsmSet> = FnvHashMap::default();
        for psm in psms {
            let key = psm.identification_key(settings);
            match sets.get_mut(&key) {
                Some(set) => set.add(psm),
                None => {
                    sets.insert(key.clone(), ReportPsmSet::new(key, psm));
                }
            }
        }
        sets
    }

    /// Add a member, ignoring PSMs that are already part of the set
    pub fn add(&mut self, psm: Arc<ReportPsm>) {
        if !self.psms.iter().any(|p| p.id() == psm.id()) {
            self.psms.push(psm);
        }
    }

    pub fn psms(&self) -> &[Arc<ReportPsm>] {
        &self.psms
    }

    pub fn len(&self) -> usize {
        self.psms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.psms.is_empty()
    }

    pub fn find(&self, id: PsmId) -> Option<&Arc<ReportPsm>> {
        self.psms.iter().find(|p| p.id() == id)
    }

    /// Members restricted to a file scope
    pub fn psms_in(&self, scope: FileScope) -> impl Iterator<Item = &ReportPsm> + '_ {
        self.psms
            .iter()
            .map(|p| p.as_ref())
            .filter(move |p| scope.contains(p.psm.file))
    }

    pub fn member_ids(&self) -> Vec<PsmId> {
        self.psms.iter().map(|p| p.id()).sorted().collect()
    }

    /// Do both sets contain exactly the same underlying PSMs?
    pub fn same_members(&self, other: &ReportPsmSet) -> bool {
        self.psms.len() == other.psms.len() && self.member_ids() == other.member_ids()
    }

    /// Copy FDR data from the globally computed set, if it has any
    pub fn adopt_fdr(&mut self, canonical: &ReportPsmSet) {
        if canonical.fdr_score.is_some() {
            self.fdr = canonical.fdr;
            self.fdr_score = canonical.fdr_score;
            self.fdr_good = canonical.fdr_good;
            self.q_value = canonical.q_value;
            self.rank = canonical.rank;
        }
    }

    pub fn score(&self, score: &str, scope: FileScope) -> Option<f64> {
        if score == FDR_SCORE && self.fdr_score.is_some() {
            return self.fdr_score;
        }
        best_score(score, self.psms_in(scope).filter_map(|p| p.score(score)))
    }

    pub fn best_rank(&self, score: &str, scope: FileScope) -> Option<u32> {
        self.psms_in(scope).filter_map(|p| p.rank(score)).min()
    }

    pub fn is_decoy(&self) -> bool {
        self.psms.iter().all(|p| p.decoy)
    }
}

impl Filterable for ReportPsmSet {
    fn level(&self) -> FilterLevel {
        FilterLevel::Psm
    }

    fn value(&self, kind: &FilterKind, scope: FileScope) -> Option<Value<'_>> {
        match kind {
            FilterKind::Builtin(builtin) => {
                let members = self.psms_in(scope).collect::<Vec<_>>();
                psm_value(*builtin, &members, self.fdr_score, self.q_value)
            }
            FilterKind::Score { family, score } => match family {
                ScoreFamily::PsmScore => self.score(score, scope).map(Value::Number),
                ScoreFamily::PsmTopRank => self
                    .best_rank(score, scope)
                    .map(|r| Value::Number(r as f64)),
                ScoreFamily::PeptideScore => None,
            },
        }
    }
}
