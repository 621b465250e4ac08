//! Typed, composable filters over PSMs, peptides and proteins
//!
//! A filter is written as `<short_name> [not|!]<comparator> <value>`:
//!
//! ```ignore
//! charge_filter >= 2
//! psmscore_xtandem_expect <= 0.05
//! pepscore_mascot_score > 20
//! psmtop_mascot_score = 1
//! protein_accessions_filter !regex ^DECOY_
//! nr_peptides_per_protein_filter >= 2
//! ```
//!
//! Besides the built-in filters there are three open families of score
//! filters, selected by prefix: `psmscore_`, `pepscore_` and `psmtop_`.
//! Anything after the prefix is taken as the score identifier.
//!
//! A list of filters is a conjunction. Filters only ever apply to items of
//! their own level: a protein filter in a list evaluated against a PSM is
//! skipped, which allows one list to be used for PSMs, peptides and proteins
//! alike.
use crate::psm::Modification;
use crate::registry::FileId;
use regex::Regex;
use std::borrow::Cow;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

mod parse;

pub use parse::{
    available_comparators, build_filter, build_filters, parse_filter_expression, FilterError,
    FilterErrors,
};

/// Maximum mass difference for a modification descriptor to match
pub const MODIFICATION_MASS_TOLERANCE: f64 = 0.001;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterLevel {
    Psm,
    Peptide,
    Protein,
}

/// Restricts counts and scores to the evidence of a single input file
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum FileScope {
    #[default]
    All,
    File(FileId),
}

impl FileScope {
    pub fn contains(&self, file: FileId) -> bool {
        match self {
            FileScope::All => true,
            FileScope::File(f) => *f == file,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Numerical,
    Bool,
    Literal,
    LiteralList,
    Modification,
}

impl ValueType {
    pub fn comparators(&self) -> &'static [Comparator] {
        use Comparator::*;
        match self {
            ValueType::Numerical => &[Equal, NotEqual, Less, LessEqual, Greater, GreaterEqual],
            ValueType::Bool => &[Equal, NotEqual],
            ValueType::Literal => &[Equal, NotEqual, Contains, Regex, In],
            ValueType::LiteralList => &[Contains, Regex, In],
            ValueType::Modification => &[Contains],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Comparator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Contains,
    Regex,
    /// List membership: the value is a comma separated list
    In,
}

impl FromStr for Comparator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "==" | "equal" => Ok(Comparator::Equal),
            "!=" | "not_equal" => Ok(Comparator::NotEqual),
            "<" | "less" => Ok(Comparator::Less),
            "<=" | "less_equal" => Ok(Comparator::LessEqual),
            ">" | "greater" => Ok(Comparator::Greater),
            ">=" | "greater_equal" => Ok(Comparator::GreaterEqual),
            "contains" => Ok(Comparator::Contains),
            "regex" => Ok(Comparator::Regex),
            "in" => Ok(Comparator::In),
            _ => Err(()),
        }
    }
}

impl Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Comparator::Equal => "=",
            Comparator::NotEqual => "!=",
            Comparator::Less => "<",
            Comparator::LessEqual => "<=",
            Comparator::Greater => ">",
            Comparator::GreaterEqual => ">=",
            Comparator::Contains => "contains",
            Comparator::Regex => "regex",
            Comparator::In => "in",
        };
        f.write_str(s)
    }
}

/// Filters with a fixed short name
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    Charge,
    PsmSequence,
    PsmAccessions,
    PsmMissedCleavages,
    PsmDeltaMass,
    PsmMz,
    PsmRt,
    PsmSourceId,
    PsmFileList,
    PsmModifications,
    PsmUnique,
    PsmDecoy,
    PsmQValue,
    PsmFdrScore,

    PeptideSequence,
    PeptideAccessions,
    NrPsmsPerPeptide,
    NrSpectraPerPeptide,
    PeptideMissedCleavages,
    PeptideUnique,
    PeptideModifications,

    ProteinAccessions,
    NrPeptidesPerProtein,
    NrPsmsPerProtein,
    NrSpectraPerProtein,
    NrUniquePeptidesPerProtein,
    ProteinScore,
}

impl Builtin {
    pub const ALL: [Builtin; 27] = [
        Builtin::Charge,
        Builtin::PsmSequence,
        Builtin::PsmAccessions,
        Builtin::PsmMissedCleavages,
        Builtin::PsmDeltaMass,
        Builtin::PsmMz,
        Builtin::PsmRt,
        Builtin::PsmSourceId,
        Builtin::PsmFileList,
        Builtin::PsmModifications,
        Builtin::PsmUnique,
        Builtin::PsmDecoy,
        Builtin::PsmQValue,
        Builtin::PsmFdrScore,
        Builtin::PeptideSequence,
        Builtin::PeptideAccessions,
        Builtin::NrPsmsPerPeptide,
        Builtin::NrSpectraPerPeptide,
        Builtin::PeptideMissedCleavages,
        Builtin::PeptideUnique,
        Builtin::PeptideModifications,
        Builtin::ProteinAccessions,
        Builtin::NrPeptidesPerProtein,
        Builtin::NrPsmsPerProtein,
        Builtin::NrSpectraPerProtein,
        Builtin::NrUniquePeptidesPerProtein,
        Builtin::ProteinScore,
    ];

    pub fn short_name(&self) -> &'static str {
        match self {
            Builtin::Charge => "charge_filter",
            Builtin::PsmSequence => "psm_sequence_filter",
            Builtin::PsmAccessions => "psm_accessions_filter",
            Builtin::PsmMissedCleavages => "psm_missed_cleavages_filter",
            Builtin::PsmDeltaMass => "psm_delta_mass_filter",
            Builtin::PsmMz => "psm_mz_filter",
            Builtin::PsmRt => "psm_rt_filter",
            Builtin::PsmSourceId => "psm_source_id_filter",
            Builtin::PsmFileList => "psm_file_list_filter",
            Builtin::PsmModifications => "psm_modifications_filter",
            Builtin::PsmUnique => "psm_unique_filter",
            Builtin::PsmDecoy => "psm_decoy_filter",
            Builtin::PsmQValue => "psm_q_value_filter",
            Builtin::PsmFdrScore => "psm_fdr_score_filter",
            Builtin::PeptideSequence => "peptide_sequence_filter",
            Builtin::PeptideAccessions => "peptide_accessions_filter",
            Builtin::NrPsmsPerPeptide => "nr_psms_per_peptide_filter",
            Builtin::NrSpectraPerPeptide => "nr_spectra_per_peptide_filter",
            Builtin::PeptideMissedCleavages => "peptide_missed_cleavages_filter",
            Builtin::PeptideUnique => "peptide_unique_filter",
            Builtin::PeptideModifications => "peptide_modifications_filter",
            Builtin::ProteinAccessions => "protein_accessions_filter",
            Builtin::NrPeptidesPerProtein => "nr_peptides_per_protein_filter",
            Builtin::NrPsmsPerProtein => "nr_psms_per_protein_filter",
            Builtin::NrSpectraPerProtein => "nr_spectra_per_protein_filter",
            Builtin::NrUniquePeptidesPerProtein => "nr_unique_peptides_per_protein_filter",
            Builtin::ProteinScore => "protein_score_filter",
        }
    }

    pub fn from_short_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.short_name() == s)
    }

    pub fn level(&self) -> FilterLevel {
        use Builtin::*;
        match self {
            Charge | PsmSequence | PsmAccessions | PsmMissedCleavages | PsmDeltaMass | PsmMz
            | PsmRt | PsmSourceId | PsmFileList | PsmModifications | PsmUnique | PsmDecoy
            | PsmQValue | PsmFdrScore => FilterLevel::Psm,
            PeptideSequence | PeptideAccessions | NrPsmsPerPeptide | NrSpectraPerPeptide
            | PeptideMissedCleavages | PeptideUnique | PeptideModifications => {
                FilterLevel::Peptide
            }
            ProteinAccessions | NrPeptidesPerProtein | NrPsmsPerProtein | NrSpectraPerProtein
            | NrUniquePeptidesPerProtein | ProteinScore => FilterLevel::Protein,
        }
    }

    pub fn value_type(&self) -> ValueType {
        use Builtin::*;
        match self {
            PsmSequence | PsmSourceId | PeptideSequence => ValueType::Literal,
            PsmAccessions | PsmFileList | PeptideAccessions | ProteinAccessions => {
                ValueType::LiteralList
            }
            PsmModifications | PeptideModifications => ValueType::Modification,
            PsmUnique | PsmDecoy | PeptideUnique => ValueType::Bool,
            _ => ValueType::Numerical,
        }
    }
}

/// Parametric filter families; the score identifier is an open-ended suffix
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScoreFamily {
    PsmScore,
    PeptideScore,
    PsmTopRank,
}

impl ScoreFamily {
    pub const ALL: [ScoreFamily; 3] = [
        ScoreFamily::PsmScore,
        ScoreFamily::PeptideScore,
        ScoreFamily::PsmTopRank,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            ScoreFamily::PsmScore => "psmscore_",
            ScoreFamily::PeptideScore => "pepscore_",
            ScoreFamily::PsmTopRank => "psmtop_",
        }
    }

    pub fn level(&self) -> FilterLevel {
        match self {
            ScoreFamily::PeptideScore => FilterLevel::Peptide,
            _ => FilterLevel::Psm,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Builtin(Builtin),
    Score { family: ScoreFamily, score: String },
}

impl FilterKind {
    /// Resolve a short name, trying the score families' prefixes first
    pub fn resolve(short_name: &str) -> Option<Self> {
        for family in ScoreFamily::ALL {
            if let Some(score) = short_name.strip_prefix(family.prefix()) {
                if score.is_empty() {
                    return None;
                }
                return Some(FilterKind::Score {
                    family,
                    score: score.to_string(),
                });
            }
        }
        Builtin::from_short_name(short_name).map(FilterKind::Builtin)
    }

    pub fn short_name(&self) -> Cow<'_, str> {
        match self {
            FilterKind::Builtin(b) => Cow::Borrowed(b.short_name()),
            FilterKind::Score { family, score } => {
                Cow::Owned(format!("{}{}", family.prefix(), score))
            }
        }
    }

    pub fn level(&self) -> FilterLevel {
        match self {
            FilterKind::Builtin(b) => b.level(),
            FilterKind::Score { family, .. } => family.level(),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            FilterKind::Builtin(b) => b.value_type(),
            FilterKind::Score { .. } => ValueType::Numerical,
        }
    }
}

/// Describes a modification by any combination of residue, mass and name:
/// `M`, `15.9949`, `M+15.9949`, `Oxidation`
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ModificationDescriptor {
    pub residue: Option<char>,
    pub mass: Option<f64>,
    pub description: Option<String>,
}

impl ModificationDescriptor {
    pub fn matches(&self, modification: &Modification) -> bool {
        self.residue.map_or(true, |r| r == modification.residue)
            && self.mass.map_or(true, |m| {
                (m - modification.mass).abs() <= MODIFICATION_MASS_TOLERANCE
            })
            && self.description.as_ref().map_or(true, |d| {
                modification
                    .description
                    .as_ref()
                    .map_or(false, |md| md.eq_ignore_ascii_case(d))
            })
    }
}

impl FromStr for ModificationDescriptor {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let first = chars.next().ok_or(())?;
        let rest = chars.as_str();

        if let Ok(mass) = s.parse::<f64>() {
            return Ok(Self {
                mass: Some(mass),
                ..Default::default()
            });
        }
        if first.is_ascii_uppercase() {
            if rest.is_empty() {
                return Ok(Self {
                    residue: Some(first),
                    ..Default::default()
                });
            }
            if let Ok(mass) = rest.trim_start_matches('+').parse::<f64>() {
                return Ok(Self {
                    residue: Some(first),
                    mass: Some(mass),
                    ..Default::default()
                });
            }
        }
        Ok(Self {
            description: Some(s.to_string()),
            ..Default::default()
        })
    }
}

impl Display for ModificationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.residue, self.mass, &self.description) {
            (_, _, Some(d)) => f.write_str(d),
            (Some(r), Some(m), None) => write!(f, "{}+{}", r, m),
            (Some(r), None, None) => write!(f, "{}", r),
            (None, Some(m), None) => write!(f, "{}", m),
            (None, None, None) => Ok(()),
        }
    }
}

/// Parsed filter argument
#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    Number(f64),
    Bool(bool),
    Literal(String),
    List(Vec<String>),
    Modification(ModificationDescriptor),
}

impl Display for FilterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterValue::Number(n) => write!(f, "{}", n),
            FilterValue::Bool(b) => write!(f, "{}", b),
            FilterValue::Literal(s) => f.write_str(s),
            FilterValue::List(l) => f.write_str(&l.join(",")),
            FilterValue::Modification(m) => m.fmt(f),
        }
    }
}

/// A field value extracted from a filterable item
#[derive(Clone, Debug, PartialEq)]
pub enum Value<'a> {
    Number(f64),
    Bool(bool),
    Text(Cow<'a, str>),
    List(Vec<Cow<'a, str>>),
    Modifications(Vec<&'a Modification>),
}

/// Anything a filter can be evaluated against
pub trait Filterable {
    fn level(&self) -> FilterLevel;

    /// The item's value for the given filter, or `None` if the item does not
    /// carry it (e.g. a score it was never assigned)
    fn value(&self, kind: &FilterKind, scope: FileScope) -> Option<Value<'_>>;
}

impl<T: Filterable + ?Sized> Filterable for Arc<T> {
    fn level(&self) -> FilterLevel {
        self.as_ref().level()
    }

    fn value(&self, kind: &FilterKind, scope: FileScope) -> Option<Value<'_>> {
        self.as_ref().value(kind, scope)
    }
}

#[derive(Clone, Debug)]
pub struct Filter {
    kind: FilterKind,
    comparator: Comparator,
    value: FilterValue,
    negate: bool,
    regex: Option<Regex>,
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.comparator == other.comparator
            && self.value == other.value
            && self.negate == other.negate
    }
}

impl Filter {
    pub fn kind(&self) -> &FilterKind {
        &self.kind
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn value(&self) -> &FilterValue {
        &self.value
    }

    pub fn negate(&self) -> bool {
        self.negate
    }

    pub fn level(&self) -> FilterLevel {
        self.kind.level()
    }

    pub fn short_name(&self) -> Cow<'_, str> {
        self.kind.short_name()
    }

    /// Does the item satisfy this filter? Does not check the level
    pub fn satisfied_by<T: Filterable + ?Sized>(&self, item: &T, scope: FileScope) -> bool {
        let pass = item
            .value(&self.kind, scope)
            .map_or(false, |value| self.compare(&value));
        pass ^ self.negate
    }

    fn compare(&self, value: &Value<'_>) -> bool {
        use Comparator::*;
        match (value, &self.value) {
            (Value::Number(a), FilterValue::Number(b)) => match self.comparator {
                Equal => a == b,
                NotEqual => a != b,
                Less => a < b,
                LessEqual => a <= b,
                Greater => a > b,
                GreaterEqual => a >= b,
                _ => false,
            },
            (Value::Bool(a), FilterValue::Bool(b)) => match self.comparator {
                Equal => a == b,
                NotEqual => a != b,
                _ => false,
            },
            (Value::Text(a), FilterValue::Literal(b)) => match self.comparator {
                Equal => a == b,
                NotEqual => a != b,
                Contains => a.contains(b.as_str()),
                Regex => self.regex.as_ref().map_or(false, |re| re.is_match(a)),
                _ => false,
            },
            (Value::Text(a), FilterValue::List(list)) => list.iter().any(|b| a == b),
            (Value::List(items), FilterValue::Literal(b)) => match self.comparator {
                Contains => items.iter().any(|a| a.contains(b.as_str())),
                Regex => self
                    .regex
                    .as_ref()
                    .map_or(false, |re| items.iter().any(|a| re.is_match(a))),
                _ => false,
            },
            (Value::List(items), FilterValue::List(list)) => {
                items.iter().any(|a| list.iter().any(|b| a == b))
            }
            (Value::Modifications(mods), FilterValue::Modification(desc)) => {
                mods.iter().any(|m| desc.matches(m))
            }
            _ => false,
        }
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ", self.kind.short_name())?;
        if self.negate {
            f.write_str("not ")?;
        }
        write!(f, "{} {}", self.comparator, self.value)
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_filter_expression(s)
    }
}

/// Conjunction over `filters`. Filters whose level differs from the item's
/// are skipped, so an empty list, or one without any filter for this level,
/// is always satisfied.
pub fn evaluate<T: Filterable + ?Sized>(item: &T, scope: FileScope, filters: &[Filter]) -> bool {
    filters
        .iter()
        .filter(|filter| filter.level() == item.level())
        .all(|filter| filter.satisfied_by(item, scope))
}

/// Keep only the items satisfying every applicable filter
pub fn apply_filters<T: Filterable>(items: Vec<T>, filters: &[Filter], scope: FileScope) -> Vec<T> {
    if filters.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| evaluate(item, scope, filters))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    /// Minimal item used to exercise comparators independently of the report types
    struct Item {
        level: FilterLevel,
        number: Option<f64>,
        text: &'static str,
        list: Vec<&'static str>,
        mods: Vec<Modification>,
    }

    impl Filterable for Item {
        fn level(&self) -> FilterLevel {
            self.level
        }

        fn value(&self, kind: &FilterKind, _: FileScope) -> Option<Value<'_>> {
            match kind.value_type() {
                ValueType::Numerical => self.number.map(Value::Number),
                ValueType::Bool => Some(Value::Bool(self.number.is_some())),
                ValueType::Literal => Some(Value::Text(Cow::Borrowed(self.text))),
                ValueType::LiteralList => Some(Value::List(
                    self.list.iter().map(|s| Cow::Borrowed(*s)).collect(),
                )),
                ValueType::Modification => Some(Value::Modifications(self.mods.iter().collect())),
            }
        }
    }

    fn psm_item(number: Option<f64>) -> Item {
        Item {
            level: FilterLevel::Psm,
            number,
            text: "LQSRPAAPPAPGPGQLTLR",
            list: vec!["sp|Q99536|VAT1_HUMAN", "DECOY_sp|P12345"],
            mods: vec![Modification {
                position: 4,
                residue: 'M',
                mass: 15.9949,
                description: Some("Oxidation".into()),
            }],
        }
    }

    #[test]
    fn numeric_comparators() {
        let item = psm_item(Some(2.0));
        let f = |s: &str| parse_filter_expression(s).unwrap();
        assert!(f("charge_filter = 2").satisfied_by(&item, FileScope::All));
        assert!(f("charge_filter >= 2").satisfied_by(&item, FileScope::All));
        assert!(!f("charge_filter > 2").satisfied_by(&item, FileScope::All));
        assert!(f("charge_filter != 3").satisfied_by(&item, FileScope::All));
        assert!(f("charge_filter not > 2").satisfied_by(&item, FileScope::All));
    }

    #[test]
    fn missing_values_fail_before_negation() {
        let item = psm_item(None);
        let filter = parse_filter_expression("psmscore_mascot_score > 10").unwrap();
        assert!(!filter.satisfied_by(&item, FileScope::All));
        let negated = parse_filter_expression("psmscore_mascot_score !> 10").unwrap();
        assert!(negated.satisfied_by(&item, FileScope::All));
    }

    #[test]
    fn literal_and_list_comparators() {
        let item = psm_item(Some(1.0));
        let f = |s: &str| parse_filter_expression(s).unwrap();
        assert!(f("psm_sequence_filter contains PAAPP").satisfied_by(&item, FileScope::All));
        assert!(f("psm_sequence_filter regex ^LQS.*R$").satisfied_by(&item, FileScope::All));
        assert!(f("psm_sequence_filter in AAA,LQSRPAAPPAPGPGQLTLR").satisfied_by(&item, FileScope::All));
        assert!(f("psm_accessions_filter regex ^DECOY_").satisfied_by(&item, FileScope::All));
        assert!(f("psm_accessions_filter contains Q99536").satisfied_by(&item, FileScope::All));
        assert!(!f("psm_accessions_filter in P1,P2").satisfied_by(&item, FileScope::All));
    }

    #[test]
    fn modification_descriptors() {
        let item = psm_item(Some(1.0));
        let f = |s: &str| parse_filter_expression(s).unwrap();
        assert!(f("psm_modifications_filter contains M").satisfied_by(&item, FileScope::All));
        assert!(f("psm_modifications_filter contains 15.9949").satisfied_by(&item, FileScope::All));
        assert!(f("psm_modifications_filter contains M+15.995").satisfied_by(&item, FileScope::All));
        assert!(f("psm_modifications_filter contains oxidation").satisfied_by(&item, FileScope::All));
        assert!(!f("psm_modifications_filter contains C").satisfied_by(&item, FileScope::All));
        assert!(!f("psm_modifications_filter contains 79.9663").satisfied_by(&item, FileScope::All));
    }

    #[test]
    fn empty_filter_list_is_satisfied() {
        assert!(evaluate(&psm_item(None), FileScope::All, &[]));
    }

    #[test]
    fn conjunction_with_failing_filter() {
        let filters = vec![
            parse_filter_expression("charge_filter >= 1").unwrap(),
            parse_filter_expression("charge_filter > 100").unwrap(),
        ];
        assert!(!evaluate(&psm_item(Some(2.0)), FileScope::All, &filters));
    }

    #[test]
    fn mismatched_levels_are_skipped() {
        // a protein filter that no PSM could ever satisfy does not affect PSMs
        let filters = vec![
            parse_filter_expression("nr_peptides_per_protein_filter > 1000").unwrap(),
            parse_filter_expression("pepscore_mascot_score > 1000").unwrap(),
        ];
        assert!(evaluate(&psm_item(Some(2.0)), FileScope::All, &filters));
        let kept = apply_filters(vec![psm_item(Some(1.0)), psm_item(None)], &filters, FileScope::All);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn display_parses_back() {
        for s in [
            "charge_filter not >= 2",
            "protein_accessions_filter regex ^DECOY_",
            "psm_modifications_filter contains M+15.9949",
            "peptide_accessions_filter in P1,P2",
        ] {
            let filter = parse_filter_expression(s).unwrap();
            assert_eq!(filter.to_string(), s);
            assert_eq!(parse_filter_expression(&filter.to_string()).unwrap(), filter);
        }
    }
}
