//! Pluggable protein scores, computed from the PSM-set scores of a
//! protein's peptides.

use crate::filter::FileScope;
use crate::protein::ReportProtein;
use crate::psm::{best_score, higher_is_better};
use serde::{Deserialize, Serialize};

pub trait ProteinScoring: Send + Sync {
    fn score(&self, protein: &ReportProtein) -> Option<f64>;

    /// Orientation of the resulting protein score, used for ranking
    fn higher_is_better(&self) -> bool {
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    #[default]
    Additive,
    Multiplicative,
    GeometricMean,
}

/// Which PSM sets of a peptide contribute to the protein score
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PsmForScoring {
    #[default]
    Best,
    All,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringSettings {
    #[serde(default)]
    pub method: ScoringMethod,
    /// PSM score identifier
    pub score: String,
    #[serde(default)]
    pub psms: PsmForScoring,
}

/// Scores contributed by the peptides of `protein`, NaNs removed
pub fn contributing_scores(protein: &ReportProtein, score: &str, psms: PsmForScoring) -> Vec<f64> {
    let mut scores = Vec::new();
    for peptide in protein.peptides() {
        let sets = peptide
            .psm_sets()
            .filter_map(|set| set.score(score, FileScope::All))
            .filter(|s| !s.is_nan());
        match psms {
            PsmForScoring::Best => scores.extend(best_score(score, sets)),
            PsmForScoring::All => scores.extend(sets),
        }
    }
    scores
}

pub struct Additive {
    score: String,
    psms: PsmForScoring,
}

impl ProteinScoring for Additive {
    fn score(&self, protein: &ReportProtein) -> Option<f64> {
        let scores = contributing_scores(protein, &self.score, self.psms);
        (!scores.is_empty()).then(|| scores.iter().sum())
    }

    fn higher_is_better(&self) -> bool {
        higher_is_better(&self.score)
    }
}

pub struct Multiplicative {
    score: String,
    psms: PsmForScoring,
}

impl ProteinScoring for Multiplicative {
    fn score(&self, protein: &ReportProtein) -> Option<f64> {
        let scores = contributing_scores(protein, &self.score, self.psms);
        (!scores.is_empty()).then(|| scores.iter().product())
    }

    fn higher_is_better(&self) -> bool {
        higher_is_better(&self.score)
    }
}

pub struct GeometricMean {
    score: String,
    psms: PsmForScoring,
}

impl ProteinScoring for GeometricMean {
    fn score(&self, protein: &ReportProtein) -> Option<f64> {
        let scores = contributing_scores(protein, &self.score, self.psms);
        if scores.is_empty() {
            return None;
        }
        let product: f64 = scores.iter().product();
        Some(product.powf(1.0 / scores.len() as f64))
    }

    fn higher_is_better(&self) -> bool {
        higher_is_better(&self.score)
    }
}

pub fn build_scoring(settings: &ScoringSettings) -> Box<dyn ProteinScoring> {
    let score = settings.score.clone();
    let psms = settings.psms;
    match settings.method {
        ScoringMethod::Additive => Box::new(Additive { score, psms }),
        ScoringMethod::Multiplicative => Box::new(Multiplicative { score, psms }),
        ScoringMethod::GeometricMean => Box::new(GeometricMean { score, psms }),
    }
}
