//! # Protein report assembly
//!
//! Assembly runs in three passes over a read-only registry and group graph:
//!
//! 1. **Peptide report**: for every group, resolve the PSMs of its peptides
//!    against the canonical PSM sets, apply PSM filters, adopt set-level FDR
//!    data and drop empty peptides. Groups are processed in parallel;
//!    deduplication of structurally identical peptides then runs in
//!    ascending group id order, so the first group to report a peptide owns
//!    the shared instance.
//! 2. **Relations**: the inference method derives seeds, same-set and subset
//!    maps from the evidence of every group carrying accessions. Relations
//!    supplied by an upstream clustering stage may be used instead.
//! 3. **Proteins**: every seed is built recursively. A protein is built at
//!    most once per assembly, even when reached through several subset
//!    paths and several threads. Subset cycles abort the run.
//!
//! Protein filters, scoring and sorting are applied to the seeds last.
//!
//! ## References
// 1. Uszkoreit, J. et al. (2015). PIA: An intuitive protein inference engine with
// a web-based user interface. Journal of proteome research, 14(7), 2988-2997.
// 2. Zhang, B., Chambers, M. C., & Tabb, D. L. (2007). Proteomic parsimony through
// bipartite graph analysis improves accuracy and transparency. Journal of proteome
// research, 6(9), 3549-3557.
//!

use crate::filter::{
    apply_filters, evaluate, parse_filter_expression, FileScope, Filter, FilterErrors,
};
use crate::group::{GroupGraph, GroupId};
use crate::peptide::ReportPeptide;
use crate::protein::ReportProtein;
use crate::psm::{PsmSetSettings, ReportPsmSet};
use crate::registry::{PeptideId, Registry};
use crate::scoring::ProteinScoring;
use crate::Error;
use dashmap::DashMap;
use fnv::{FnvBuildHasher, FnvHashMap, FnvHashSet};
use log::{info, warn};
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMethod {
    /// Every group with evidence and accessions is reported
    ReportAll,
    /// Only an (almost) minimal set of groups explaining all peptides
    #[default]
    Parsimony,
}

/// Surviving report peptides per group, plus counts of PSMs that could not
/// be reconciled with the canonical PSM sets
#[derive(Debug, Default)]
pub struct PeptideReport {
    peptides: FnvHashMap<GroupId, Vec<Arc<ReportPeptide>>>,
    pub missing_sets: usize,
    pub missing_psms: usize,
}

impl PeptideReport {
    pub fn get(&self, group: GroupId) -> &[Arc<ReportPeptide>] {
        self.peptides
            .get(&group)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    pub fn groups(&self) -> impl Iterator<Item = (&GroupId, &Vec<Arc<ReportPeptide>>)> + '_ {
        self.peptides.iter()
    }

    /// Number of distinct peptide instances across all groups
    pub fn len(&self) -> usize {
        self.peptides
            .values()
            .flatten()
            .map(Arc::as_ptr)
            .collect::<FnvHashSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.peptides.is_empty()
    }
}

pub fn group_has_direct_peptides(group: GroupId, peptides: &PeptideReport) -> bool {
    !peptides.get(group).is_empty()
}

/// Does the group or any of its descendants report a peptide?
pub fn group_has_peptides(graph: &GroupGraph, group: GroupId, peptides: &PeptideReport) -> bool {
    group_has_direct_peptides(group, peptides)
        || graph
            .all_peptide_children(group)
            .into_iter()
            .any(|child| group_has_direct_peptides(child, peptides))
}

/// Seeds to build proteins from, and the equivalence relations between groups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRelations {
    pub seeds: Vec<GroupId>,
    /// Groups with identical evidence, in both directions
    pub same_sets: FnvHashMap<GroupId, Vec<GroupId>>,
    /// Groups whose evidence is a strict subset of the key's
    pub subsets: FnvHashMap<GroupId, Vec<GroupId>>,
}

impl GroupRelations {
    /// Verify that following subset links never leads back to a group
    /// already on the path
    pub fn check_acyclic(&self) -> Result<(), Error> {
        #[derive(Copy, Clone, PartialEq)]
        enum State {
            Active,
            Done,
        }

        let mut state: FnvHashMap<GroupId, State> = FnvHashMap::default();
        let mut roots = self.subsets.keys().copied().collect::<Vec<_>>();
        roots.sort_unstable();

        for root in roots {
            if state.contains_key(&root) {
                continue;
            }
            // (node, index of the next subset to visit)
            let mut stack = vec![(root, 0usize)];
            state.insert(root, State::Active);
            while let Some((node, next)) = stack.last().copied() {
                let children = self.subsets.get(&node).map(|c| c.as_slice()).unwrap_or(&[]);
                let child = match children.get(next) {
                    Some(&child) => child,
                    None => {
                        state.insert(node, State::Done);
                        stack.pop();
                        continue;
                    }
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match state.get(&child) {
                    Some(State::Active) => {
                        let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                        let mut cycle = stack[start..].iter().map(|(n, _)| *n).collect::<Vec<_>>();
                        cycle.push(child);
                        return Err(Error::MalformedGroupGraph(cycle));
                    }
                    Some(State::Done) => {}
                    None => {
                        state.insert(child, State::Active);
                        stack.push((child, 0));
                    }
                }
            }
        }
        Ok(())
    }
}

impl InferenceMethod {
    pub fn relations(&self, graph: &GroupGraph, peptides: &PeptideReport) -> GroupRelations {
        let time = Instant::now();
        let evidence = graph
            .ids()
            .into_par_iter()
            .filter(|&id| {
                graph.get(id).map_or(false, |g| !g.accessions.is_empty())
                    && group_has_peptides(graph, id, peptides)
            })
            .map(|id| (id, evidence_of(graph, id, peptides)))
            .collect::<Vec<_>>();

        // identical evidence collapses onto the lowest group id
        let mut classes: BTreeMap<&BTreeSet<String>, Vec<GroupId>> = BTreeMap::new();
        for (id, ev) in &evidence {
            classes.entry(ev).or_default().push(*id);
        }

        let mut relations = GroupRelations::default();
        let mut representatives = Vec::with_capacity(classes.len());
        for (ev, mut members) in classes {
            members.sort_unstable();
            if members.len() > 1 {
                for &m in &members {
                    let others = members.iter().copied().filter(|&o| o != m).collect();
                    relations.same_sets.insert(m, others);
                }
            }
            representatives.push((members[0], ev));
        }
        representatives.sort_unstable_by_key(|(id, _)| *id);

        let subsets = representatives
            .par_iter()
            .map(|(id, ev)| {
                let subs = representatives
                    .iter()
                    .filter(|(other, other_ev)| other != id && other_ev.is_subset(ev))
                    .map(|(other, _)| *other)
                    .collect::<Vec<_>>();
                (*id, subs)
            })
            .collect::<Vec<_>>();

        let mut is_subset = FnvHashSet::default();
        for (id, subs) in subsets {
            is_subset.extend(subs.iter().copied());
            if !subs.is_empty() {
                relations.subsets.insert(id, subs);
            }
        }

        let top_level = representatives
            .iter()
            .filter(|(id, _)| !is_subset.contains(id))
            .collect::<Vec<_>>();

        relations.seeds = match self {
            InferenceMethod::ReportAll => top_level.iter().map(|(id, _)| *id).collect(),
            InferenceMethod::Parsimony => {
                let mut graph = EvidenceGraph::new(&top_level);
                while !graph.is_empty() {
                    graph.claim_unique_evidence();
                    if !graph.is_empty() {
                        graph.add_largest_to_cover();
                    }
                }
                top_level
                    .iter()
                    .zip(graph.cover)
                    .filter(|(_, covered)| *covered)
                    .map(|((id, _), _)| *id)
                    .collect()
            }
        };

        info!(
            "-  inferred {} of {} candidate groups ({:?}) in {:?}ms",
            relations.seeds.len(),
            evidence.len(),
            self,
            time.elapsed().as_millis()
        );
        relations
    }
}

fn evidence_of(graph: &GroupGraph, id: GroupId, peptides: &PeptideReport) -> BTreeSet<String> {
    std::iter::once(id)
        .chain(graph.all_peptide_children(id))
        .flat_map(|g| peptides.get(g).iter())
        .map(|p| p.string_id().to_string())
        .collect()
}

/// Bipartite group/peptide graph used to pick a greedy minimal cover
struct EvidenceGraph {
    edges: Vec<(usize, usize)>,
    original_left: Vec<usize>,
    remaining_left: Vec<usize>,
    remaining_right: Vec<usize>,
    cover: Vec<bool>,
    explained: Vec<bool>,
}

impl EvidenceGraph {
    fn new(groups: &[&(GroupId, &BTreeSet<String>)]) -> Self {
        let mut peptide_ix: FnvHashMap<&str, usize> = FnvHashMap::default();
        let mut edges = Vec::new();
        for (left, (_, ev)) in groups.iter().enumerate() {
            for pep in ev.iter() {
                let next = peptide_ix.len();
                let right = *peptide_ix.entry(pep.as_str()).or_insert(next);
                edges.push((left, right));
            }
        }
        let mut remaining_left = vec![0; groups.len()];
        let mut remaining_right = vec![0; peptide_ix.len()];
        for &(l, r) in &edges {
            remaining_left[l] += 1;
            remaining_right[r] += 1;
        }
        Self {
            edges,
            original_left: remaining_left.clone(),
            remaining_left,
            remaining_right,
            cover: vec![false; groups.len()],
            explained: vec![false; peptide_ix.len()],
        }
    }

    fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Repeatedly add groups owning a peptide nobody else explains, then
    /// drop every edge touching a covered group or an explained peptide
    fn claim_unique_evidence(&mut self) {
        let mut edges = std::mem::take(&mut self.edges);
        let mut count = 0;
        while count != edges.len() {
            count = edges.len();
            for &(l, r) in &edges {
                if self.remaining_right[r] == 1 {
                    self.cover[l] = true;
                }
            }
            edges.retain(|&(l, r)| {
                if self.cover[l] {
                    self.explained[r] = true;
                    self.remaining_left[l] -= 1;
                    self.remaining_right[r] -= 1;
                    false
                } else {
                    true
                }
            });
            edges.retain(|&(l, r)| {
                if self.explained[r] {
                    self.remaining_left[l] -= 1;
                    self.remaining_right[r] -= 1;
                    false
                } else {
                    true
                }
            });
        }
        self.edges = edges;
    }

    /// Add the group explaining most of the remaining peptides; ties go to
    /// the larger group, then the lower id
    fn add_largest_to_cover(&mut self) {
        if let Some((ix, _)) = self
            .remaining_left
            .iter()
            .zip(&self.original_left)
            .enumerate()
            .filter(|(_, (remaining, _))| **remaining > 0)
            .max_by(|(a_ix, a), (b_ix, b)| a.cmp(b).then_with(|| b_ix.cmp(a_ix)))
        {
            self.cover[ix] = true;
        }
    }
}

/// Report peptide instances shared between groups, keyed by string id.
/// Structurally identical peptides collapse onto the first instance seen.
#[derive(Default)]
struct PeptidePool {
    instances: FnvHashMap<String, Vec<Arc<ReportPeptide>>>,
}

impl PeptidePool {
    fn intern(&mut self, peptide: ReportPeptide) -> Arc<ReportPeptide> {
        let candidates = self
            .instances
            .entry(peptide.string_id().to_string())
            .or_default();
        if let Some(existing) = candidates.iter().find(|c| c.is_equivalent(&peptide)) {
            return existing.clone();
        }
        let peptide = Arc::new(peptide);
        candidates.push(peptide.clone());
        peptide
    }

    fn len(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }
}

type ProteinMemo = DashMap<GroupId, Arc<OnceCell<Arc<ReportProtein>>>, FnvBuildHasher>;

/// Everything protein building reads, plus the memo of built proteins
pub struct Assembly<'a> {
    registry: &'a Registry,
    graph: &'a GroupGraph,
    peptides: &'a PeptideReport,
    relations: &'a GroupRelations,
    memo: ProteinMemo,
}

impl<'a> Assembly<'a> {
    pub fn new(
        registry: &'a Registry,
        graph: &'a GroupGraph,
        peptides: &'a PeptideReport,
        relations: &'a GroupRelations,
    ) -> Self {
        Self {
            registry,
            graph,
            peptides,
            relations,
            memo: DashMap::default(),
        }
    }

    /// Number of proteins built so far
    pub fn built(&self) -> usize {
        self.memo
            .iter()
            .filter(|cell| cell.value().get().is_some())
            .count()
    }
}

pub struct ProteinInference {
    filters: Vec<Filter>,
    scoring: Option<Box<dyn ProteinScoring>>,
    method: InferenceMethod,
    psm_set_settings: PsmSetSettings,
    consider_modifications: bool,
    scope: FileScope,
    allowed_threads: i32,
    progress: AtomicUsize,
}

impl Default for ProteinInference {
    fn default() -> Self {
        Self::new(InferenceMethod::default())
    }
}

impl ProteinInference {
    pub fn new(method: InferenceMethod) -> Self {
        Self {
            filters: Vec::new(),
            scoring: None,
            method,
            psm_set_settings: PsmSetSettings::default(),
            consider_modifications: false,
            scope: FileScope::All,
            allowed_threads: 0,
            progress: AtomicUsize::new(0),
        }
    }

    pub fn with_scoring(mut self, scoring: Box<dyn ProteinScoring>) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_psm_set_settings(mut self, settings: PsmSetSettings) -> Self {
        self.psm_set_settings = settings;
        self
    }

    pub fn with_modifications(mut self, consider_modifications: bool) -> Self {
        self.consider_modifications = consider_modifications;
        self
    }

    pub fn with_scope(mut self, scope: FileScope) -> Self {
        self.scope = scope;
        self
    }

    /// Worker threads for assembly; zero or less uses every available core
    pub fn with_threads(mut self, allowed_threads: i32) -> Self {
        self.allowed_threads = allowed_threads;
        self
    }

    pub fn method(&self) -> InferenceMethod {
        self.method
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn add_filter(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    /// Parse and add every expression. Failing expressions are skipped and
    /// reported together; valid ones are added regardless.
    pub fn add_filters_from_strings<S: AsRef<str>>(
        &mut self,
        expressions: &[S],
    ) -> Result<(), FilterErrors> {
        let mut errors = Vec::new();
        for expr in expressions {
            let expr = expr.as_ref();
            match parse_filter_expression(expr) {
                Ok(filter) => self.filters.push(filter),
                Err(err) => {
                    log::error!("skipping filter `{}`: {}", expr, err);
                    errors.push((expr.to_string(), err));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FilterErrors(errors))
        }
    }

    pub fn remove_filter(&mut self, index: usize) -> Option<Filter> {
        (index < self.filters.len()).then(|| self.filters.remove(index))
    }

    /// Progress of the current or last assembly run, 0 to 100
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool, Error> {
        let threads = if self.allowed_threads <= 0 {
            0
        } else {
            self.allowed_threads as usize
        };
        Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
    }

    pub fn build_filtered_peptides(
        &self,
        registry: &Registry,
        graph: &GroupGraph,
        canonical: &FnvHashMap<String, ReportPsmSet>,
    ) -> Result<PeptideReport, Error> {
        let pool = self.thread_pool()?;
        Ok(pool.install(|| self.filtered_peptides(registry, graph, canonical)))
    }

    fn filtered_peptides(
        &self,
        registry: &Registry,
        graph: &GroupGraph,
        canonical: &FnvHashMap<String, ReportPsmSet>,
    ) -> PeptideReport {
        let time = Instant::now();
        let built = graph
            .ids()
            .into_par_iter()
            .filter_map(|id| graph.get(id))
            .map(|group| {
                let (peptides, missing_sets, missing_psms) =
                    self.group_peptides(registry, &group.peptides, canonical);
                (group.id, peptides, missing_sets, missing_psms)
            })
            .collect::<Vec<_>>();

        let mut report = PeptideReport::default();
        let mut shared = PeptidePool::default();

        // `built` keeps the ascending group order of `graph.ids()`
        for (id, peptides, missing_sets, missing_psms) in built {
            report.missing_sets += missing_sets;
            report.missing_psms += missing_psms;

            let mut surviving = Vec::with_capacity(peptides.len());
            for peptide in peptides {
                let peptide = shared.intern(peptide);
                if evaluate(peptide.as_ref(), self.scope, &self.filters) {
                    surviving.push(peptide);
                }
            }
            if !surviving.is_empty() {
                report.peptides.insert(id, surviving);
            }
        }

        if report.missing_sets > 0 || report.missing_psms > 0 {
            warn!(
                "-  skipped {} PSMs without PSM set and {} PSMs missing from their set",
                report.missing_sets, report.missing_psms
            );
        }
        info!(
            "-  built {} report peptides for {} groups in {:?}ms",
            shared.len(),
            report.peptides.len(),
            time.elapsed().as_millis()
        );
        report
    }

    /// Report peptides of a single group, before deduplication
    fn group_peptides(
        &self,
        registry: &Registry,
        peptide_ids: &[PeptideId],
        canonical: &FnvHashMap<String, ReportPsmSet>,
    ) -> (Vec<ReportPeptide>, usize, usize) {
        let mut missing_sets = 0;
        let mut missing_psms = 0;
        let mut peptides: BTreeMap<String, ReportPeptide> = BTreeMap::new();

        for &peptide_id in peptide_ids {
            let peptide = match registry.peptide(peptide_id) {
                Some(peptide) => peptide,
                None => {
                    warn!("{}", Error::UnknownEntity(format!("peptide {}", peptide_id.0)));
                    continue;
                }
            };
            for psm in registry.psms_of(peptide_id) {
                let key = psm.identification_key(&self.psm_set_settings);
                let set = match canonical.get(&key) {
                    Some(set) => set,
                    None => {
                        warn!("{}", Error::MissingPsmSet(key));
                        missing_sets += 1;
                        continue;
                    }
                };
                let report_psm = match set.find(psm.id) {
                    Some(report_psm) => report_psm,
                    None => {
                        warn!("{}", Error::MissingReportPsm { psm: psm.id.0, key });
                        missing_psms += 1;
                        continue;
                    }
                };
                if !evaluate(report_psm.as_ref(), self.scope, &self.filters) {
                    continue;
                }
                let string_id = ReportPeptide::string_id_of(psm, self.consider_modifications);
                peptides
                    .entry(string_id)
                    .or_insert_with_key(|string_id| {
                        ReportPeptide::new(string_id.clone(), peptide.clone())
                    })
                    .add_psm(key, report_psm.clone());
            }
        }

        let peptides = peptides
            .into_values()
            .filter_map(|mut peptide| {
                for set in peptide.psm_sets_mut() {
                    if let Some(canonical) = canonical.get(&set.key) {
                        if canonical.same_members(set) {
                            set.adopt_fdr(canonical);
                        }
                    }
                }
                peptide.retain_psm_sets(|set| evaluate(set, self.scope, &self.filters));
                (peptide.nr_psms(FileScope::All) > 0).then(|| peptide)
            })
            .collect();
        (peptides, missing_sets, missing_psms)
    }

    /// Build (or fetch) the protein seeded by `id`
    pub fn build_protein(&self, id: GroupId, assembly: &Assembly) -> Result<Arc<ReportProtein>, Error> {
        self.build_protein_on_path(id, assembly, &mut Vec::new())
    }

    fn build_protein_on_path(
        &self,
        id: GroupId,
        assembly: &Assembly,
        path: &mut Vec<GroupId>,
    ) -> Result<Arc<ReportProtein>, Error> {
        // re-entering a cell that is being initialized would deadlock
        if let Some(start) = path.iter().position(|&p| p == id) {
            let mut cycle = path[start..].to_vec();
            cycle.push(id);
            return Err(Error::MalformedGroupGraph(cycle));
        }
        let cell = Arc::clone(&assembly.memo.entry(id).or_default());
        path.push(id);
        let protein = cell
            .get_or_try_init(|| self.assemble_protein(id, assembly, path).map(Arc::new))
            .cloned();
        path.pop();
        protein
    }

    fn assemble_protein(
        &self,
        id: GroupId,
        assembly: &Assembly,
        path: &mut Vec<GroupId>,
    ) -> Result<ReportProtein, Error> {
        let mut protein = ReportProtein::new(id);

        for group in std::iter::once(id).chain(assembly.graph.all_peptide_children(id)) {
            for peptide in assembly.peptides.get(group) {
                protein.add_peptide(peptide.clone());
            }
        }

        let same_sets = assembly
            .relations
            .same_sets
            .get(&id)
            .map(|s| s.as_slice())
            .unwrap_or(&[]);
        for group in std::iter::once(id).chain(same_sets.iter().copied().filter(|&g| g != id)) {
            let accessions = match assembly.graph.get(group) {
                Some(group) => &group.accessions,
                None => continue,
            };
            for &accession in accessions {
                match assembly.registry.accession(accession) {
                    Some(accession) => {
                        protein.add_accession(accession.clone());
                    }
                    None => warn!(
                        "{}",
                        Error::UnknownEntity(format!("accession {} of group {}", accession.0, group.0))
                    ),
                }
            }
        }

        if let Some(subsets) = assembly.relations.subsets.get(&id) {
            for &subset in subsets {
                let subset = self.build_protein_on_path(subset, assembly, path)?;
                protein.add_subset(subset);
            }
        }

        if let Some(scoring) = &self.scoring {
            protein.set_score(scoring.score(&protein));
        }
        Ok(protein)
    }

    /// Assemble the protein report, deriving relations with the configured
    /// inference method
    pub fn assemble(
        &self,
        registry: &Registry,
        graph: &GroupGraph,
        canonical: &FnvHashMap<String, ReportPsmSet>,
    ) -> Result<Vec<Arc<ReportProtein>>, Error> {
        self.run(registry, graph, canonical, None)
    }

    /// Assemble the protein report from externally supplied relations
    pub fn assemble_with_relations(
        &self,
        registry: &Registry,
        graph: &GroupGraph,
        canonical: &FnvHashMap<String, ReportPsmSet>,
        relations: &GroupRelations,
    ) -> Result<Vec<Arc<ReportProtein>>, Error> {
        self.run(registry, graph, canonical, Some(relations))
    }

    fn run(
        &self,
        registry: &Registry,
        graph: &GroupGraph,
        canonical: &FnvHashMap<String, ReportPsmSet>,
        relations: Option<&GroupRelations>,
    ) -> Result<Vec<Arc<ReportProtein>>, Error> {
        let time = Instant::now();
        self.progress.store(0, Ordering::Relaxed);
        let pool = self.thread_pool()?;

        pool.install(|| {
            let peptides = self.filtered_peptides(registry, graph, canonical);
            self.progress.store(40, Ordering::Relaxed);

            let relations = match relations {
                Some(relations) => Cow::Borrowed(relations),
                None => Cow::Owned(self.method.relations(graph, &peptides)),
            };
            relations.check_acyclic()?;
            self.progress.store(50, Ordering::Relaxed);

            let assembly = Assembly::new(registry, graph, &peptides, &relations);
            let total = relations.seeds.len().max(1);
            let done = AtomicUsize::new(0);
            let proteins = relations
                .seeds
                .par_iter()
                .map(|&id| {
                    let protein = self.build_protein(id, &assembly);
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    self.progress
                        .store(50 + 45 * finished / total, Ordering::Relaxed);
                    protein
                })
                .collect::<Result<Vec<_>, Error>>()?;

            let mut proteins = apply_filters(proteins, &self.filters, self.scope);
            self.sort(&mut proteins);
            self.progress.store(100, Ordering::Relaxed);
            info!(
                "-  assembled {} proteins ({} built) in {:?}ms",
                proteins.len(),
                assembly.built(),
                time.elapsed().as_millis()
            );
            Ok(proteins)
        })
    }

    /// Best score first, unscored proteins last, ties by id
    fn sort(&self, proteins: &mut [Arc<ReportProtein>]) {
        let higher_is_better = self
            .scoring
            .as_ref()
            .map_or(true, |scoring| scoring.higher_is_better());
        proteins.sort_by(|a, b| {
            let by_score = match (a.score(), b.score()) {
                (Some(x), Some(y)) if higher_is_better => y.total_cmp(&x),
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            };
            by_score.then_with(|| a.id().cmp(&b.id()))
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connectivity::ConnectionMap;
    use crate::group::Group;
    use crate::psm::{Psm, ReportPsm};
    use crate::registry::{AccessionId, FileId, PeptideId};
    use crate::scoring::{build_scoring, PsmForScoring, ScoringMethod, ScoringSettings};

    /// Registry, groups and canonical PSM sets for a small data set
    struct Fixture {
        registry: Registry,
        connections: ConnectionMap,
        canonical: FnvHashMap<String, ReportPsmSet>,
        groups: Vec<Group>,
        /// FDR score given to the PSMs and sets of the next peptides
        fdr_score: Option<f64>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = Registry::new();
            registry.register_input_file("run.mzid", "/data/run.mzid");
            Self {
                registry,
                connections: ConnectionMap::default(),
                canonical: FnvHashMap::default(),
                groups: Vec::new(),
                fdr_score: None,
            }
        }

        /// Register a peptide observed by one PSM per score, linked to `accessions`
        fn peptide(&mut self, sequence: &str, accessions: &[&str], scores: &[f64]) -> PeptideId {
            let pep = self.registry.register_peptide(sequence).id;
            for acc in accessions {
                let acc = self.registry.register_accession(acc, "").id;
                self.connections.link(&self.registry, acc, pep).unwrap();
            }
            for &score in scores {
                let id = self.registry.next_psm_id();
                let psm = Psm {
                    id,
                    charge: 2,
                    mz: 500.0 + id.0 as f64,
                    sequence: sequence.into(),
                    source_id: format!("index={}", id.0),
                    file: FileId(1),
                    scores: [("hyperscore".to_string(), score)].into_iter().collect(),
                    ..Default::default()
                };
                self.registry.commit_psm(psm.clone()).unwrap();
                let mut report = ReportPsm::new(psm);
                report.accessions = accessions.iter().map(|s| s.to_string()).collect();
                report.fdr_score = self.fdr_score;
                report.q_value = self.fdr_score;
                let report = Arc::new(report);
                let key = report.identification_key(&PsmSetSettings::default());
                let set = self
                    .canonical
                    .entry(key.clone())
                    .or_insert_with(|| ReportPsmSet::new(key, report.clone()));
                set.add(report);
                if self.fdr_score.is_some() {
                    set.fdr_score = self.fdr_score;
                    set.q_value = self.fdr_score;
                    set.rank = Some(1);
                }
            }
            pep
        }

        fn group(&mut self, id: u64, peptides: &[PeptideId], accessions: &[&str], children: &[u64]) {
            let accessions = accessions
                .iter()
                .map(|a| self.registry.accession_by_name(a).unwrap().id)
                .collect::<Vec<AccessionId>>();
            self.groups.push(Group {
                id: GroupId(id),
                peptides: peptides.to_vec(),
                accessions,
                children: children.iter().map(|&c| GroupId(c)).collect(),
                ..Default::default()
            });
        }

        fn graph(&self) -> GroupGraph {
            GroupGraph::new(self.groups.clone())
        }
    }

    fn accession_names(protein: &ReportProtein) -> Vec<&str> {
        let mut names = protein.accession_names();
        names.sort_unstable();
        names
    }

    fn sequences(protein: &ReportProtein) -> Vec<&str> {
        let mut seqs = protein
            .peptides()
            .iter()
            .map(|p| p.sequence())
            .collect::<Vec<_>>();
        seqs.sort_unstable();
        seqs
    }

    #[test]
    fn shared_peptide_group() {
        let mut fx = Fixture::new();
        let pep = fx.peptide("PEPTIDEA", &["P1", "P2"], &[10.0]);
        fx.group(1, &[pep], &["P1", "P2"], &[]);
        let graph = fx.graph();

        let proteins = ProteinInference::new(InferenceMethod::ReportAll)
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(proteins.len(), 1);
        assert_eq!(accession_names(&proteins[0]), vec!["P1", "P2"]);
        assert_eq!(sequences(&proteins[0]), vec!["PEPTIDEA"]);
    }

    #[test]
    fn subset_proteins_are_linked_not_merged() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1", "P2"], &[10.0]);
        let b = fx.peptide("PEPTIDEB", &["P1"], &[20.0]);
        // G2 explains A only, G1 adds B on top of its child G2
        fx.group(2, &[a], &["P2"], &[]);
        fx.group(1, &[b], &["P1"], &[2]);
        let graph = fx.graph();

        let inference = ProteinInference::new(InferenceMethod::ReportAll);
        let proteins = inference
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(proteins.len(), 1);
        let g1 = &proteins[0];
        assert_eq!(g1.id(), GroupId(1));
        assert_eq!(sequences(g1), vec!["PEPTIDEA", "PEPTIDEB"]);
        assert_eq!(accession_names(g1), vec!["P1"]);
        assert_eq!(g1.subsets().len(), 1);
        let g2 = &g1.subsets()[0];
        assert_eq!(g2.id(), GroupId(2));
        assert_eq!(sequences(g2), vec!["PEPTIDEA"]);
        assert_eq!(accession_names(g2), vec!["P2"]);
        assert_eq!(inference.progress(), 100);
    }

    #[test]
    fn proteins_are_built_once() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1", "P2"], &[10.0]);
        fx.group(1, &[a], &["P1"], &[]);
        fx.group(2, &[], &["P2"], &[1]);
        let graph = fx.graph();
        let inference = ProteinInference::default();
        let peptides = inference
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        let relations = GroupRelations {
            seeds: vec![GroupId(1), GroupId(2)],
            same_sets: FnvHashMap::default(),
            subsets: [(GroupId(2), vec![GroupId(1)])].into_iter().collect(),
        };
        let assembly = Assembly::new(&fx.registry, &graph, &peptides, &relations);

        let first = inference.build_protein(GroupId(1), &assembly).unwrap();
        let again = inference.build_protein(GroupId(1), &assembly).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        let parent = inference.build_protein(GroupId(2), &assembly).unwrap();
        assert!(Arc::ptr_eq(&parent.subsets()[0], &first));
        assert_eq!(assembly.built(), 2);
    }

    #[test]
    fn subset_cycles_are_fatal() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1", "P2"], &[10.0]);
        fx.group(1, &[a], &["P1"], &[]);
        fx.group(2, &[a], &["P2"], &[]);
        let graph = fx.graph();
        let relations = GroupRelations {
            seeds: vec![GroupId(1)],
            same_sets: FnvHashMap::default(),
            subsets: [(GroupId(1), vec![GroupId(2)]), (GroupId(2), vec![GroupId(1)])]
                .into_iter()
                .collect(),
        };
        assert!(matches!(
            relations.check_acyclic(),
            Err(Error::MalformedGroupGraph(ref cycle)) if cycle == &[GroupId(1), GroupId(2), GroupId(1)]
        ));

        let inference = ProteinInference::default();
        let result =
            inference.assemble_with_relations(&fx.registry, &graph, &fx.canonical, &relations);
        assert!(matches!(result, Err(Error::MalformedGroupGraph(_))));

        // the recursion guard catches the cycle without the upfront check
        let peptides = inference
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        let assembly = Assembly::new(&fx.registry, &graph, &peptides, &relations);
        assert!(matches!(
            inference.build_protein(GroupId(1), &assembly),
            Err(Error::MalformedGroupGraph(_))
        ));
    }

    #[test]
    fn same_sets_are_merged_and_symmetric() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1", "P2", "P3"], &[10.0]);
        let b = fx.peptide("PEPTIDEB", &["P1", "P2", "P3"], &[12.0]);
        // groups 2 and 3 both carry evidence {A, B} through their shared child
        fx.group(1, &[a], &["P1"], &[]);
        fx.group(2, &[b], &["P2"], &[1]);
        fx.group(3, &[b], &["P3"], &[1]);
        let graph = fx.graph();

        let inference = ProteinInference::new(InferenceMethod::ReportAll);
        let peptides = inference
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        let relations = inference.method().relations(&graph, &peptides);

        for (group, others) in &relations.same_sets {
            for other in others {
                assert!(relations.same_sets[other].contains(group));
            }
        }
        assert_eq!(relations.same_sets[&GroupId(2)], vec![GroupId(3)]);
        assert_eq!(relations.seeds, vec![GroupId(2)]);
        assert_eq!(relations.subsets[&GroupId(2)], vec![GroupId(1)]);

        let proteins = inference
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(proteins.len(), 1);
        assert_eq!(accession_names(&proteins[0]), vec!["P2", "P3"]);
    }

    #[test]
    fn parsimony_drops_redundant_groups() {
        let mut fx = Fixture::new();
        // P1 = {A, B}, P2 = {B, C}, P3 = {A, C}, P4 = {C, D}: P4 owns D and
        // P1 is needed for the rest; P2 and P3 add nothing
        let a = fx.peptide("PEPTIDEA", &["P1", "P3"], &[1.0]);
        let b = fx.peptide("PEPTIDEB", &["P1", "P2"], &[1.0]);
        let c = fx.peptide("PEPTIDEC", &["P2", "P3", "P4"], &[1.0]);
        let d = fx.peptide("PEPTIDED", &["P4"], &[1.0]);
        fx.group(1, &[a, b], &["P1"], &[]);
        fx.group(2, &[b, c], &["P2"], &[]);
        fx.group(3, &[a, c], &["P3"], &[]);
        fx.group(4, &[c, d], &["P4"], &[]);
        let graph = fx.graph();

        let all = ProteinInference::new(InferenceMethod::ReportAll)
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(all.len(), 4);

        let minimal = ProteinInference::new(InferenceMethod::Parsimony)
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        let mut ids = minimal.iter().map(|p| p.id()).collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, vec![GroupId(1), GroupId(4)]);
    }

    #[test]
    fn filters_at_every_level() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1"], &[5.0, 50.0]);
        let b = fx.peptide("PEPTIDEB", &["P1"], &[3.0]);
        let c = fx.peptide("PEPTIDEC", &["DECOY_P2"], &[40.0]);
        fx.group(1, &[a, b], &["P1"], &[]);
        fx.group(2, &[c], &["DECOY_P2"], &[]);
        let graph = fx.graph();

        let mut inference = ProteinInference::new(InferenceMethod::ReportAll);
        inference
            .add_filters_from_strings(&[
                "psmscore_hyperscore >= 4",
                "nr_psms_per_peptide_filter >= 1",
                "protein_accessions_filter !regex ^DECOY_",
            ])
            .unwrap();
        let proteins = inference
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(proteins.len(), 1);
        assert_eq!(sequences(&proteins[0]), vec!["PEPTIDEA"]);
        assert_eq!(proteins[0].nr_psms(FileScope::All), 2);

        let err = inference
            .add_filters_from_strings(&["charge_filter", "nr_psms_per_peptide_filter >= 2"])
            .unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert_eq!(inference.filters().len(), 4);
        assert!(inference.remove_filter(3).is_some());
        assert!(inference.remove_filter(3).is_none());
    }

    #[test]
    fn missing_psm_sets_are_skipped() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1"], &[5.0, 6.0]);
        fx.group(1, &[a], &["P1"], &[]);
        let graph = fx.graph();
        let key = fx.registry.psms_of(a).next().unwrap().identification_key(&PsmSetSettings::default());
        fx.canonical.remove(&key);

        let inference = ProteinInference::new(InferenceMethod::ReportAll);
        let peptides = inference
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(peptides.missing_sets, 1);
        assert_eq!(peptides.get(GroupId(1))[0].nr_psms(FileScope::All), 1);
    }

    #[test]
    fn psms_missing_from_their_set_are_skipped() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1"], &[5.0, 6.0]);
        fx.group(1, &[a], &["P1"], &[]);
        let graph = fx.graph();

        // the canonical set of the first PSM only knows an unrelated PSM
        let psm = fx.registry.psms_of(a).next().unwrap().clone();
        let key = psm.identification_key(&PsmSetSettings::default());
        let stranger = ReportPsm::new(Psm {
            id: crate::psm::PsmId(999),
            ..psm
        });
        fx.canonical
            .insert(key.clone(), ReportPsmSet::new(key, Arc::new(stranger)));

        let inference = ProteinInference::new(InferenceMethod::ReportAll);
        let peptides = inference
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(peptides.missing_psms, 1);
        assert_eq!(peptides.missing_sets, 0);
        let surviving = peptides.get(GroupId(1));
        assert_eq!(surviving.len(), 1);
        assert_eq!(surviving[0].nr_psms(FileScope::All), 1);

        let proteins = inference
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert_eq!(proteins.len(), 1);
        assert_eq!(proteins[0].nr_psms(FileScope::All), 1);
    }

    #[test]
    fn identical_peptides_collapse_onto_one_instance() {
        let peptide = |psm_ids: &[u64]| {
            let mut pep = ReportPeptide::new(
                "PEPTIDEA".into(),
                crate::registry::Peptide {
                    id: PeptideId(1),
                    sequence: "PEPTIDEA".into(),
                },
            );
            for &id in psm_ids {
                let psm = ReportPsm::new(Psm {
                    id: crate::psm::PsmId(id),
                    sequence: "PEPTIDEA".into(),
                    file: FileId(1),
                    ..Default::default()
                });
                pep.add_psm(format!("index={}", id), Arc::new(psm));
            }
            pep
        };

        let mut pool = PeptidePool::default();
        let first = pool.intern(peptide(&[1, 2]));
        let second = pool.intern(peptide(&[1]));
        let third = pool.intern(peptide(&[1]));
        let again = pool.intern(peptide(&[1, 2]));

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &third));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn canonical_fdr_is_adopted_before_filtering() {
        let mut fx = Fixture::new();
        fx.fdr_score = Some(0.001);
        let a = fx.peptide("PEPTIDEA", &["P1"], &[5.0]);
        fx.fdr_score = Some(0.2);
        let b = fx.peptide("PEPTIDEB", &["P1"], &[5.0]);
        fx.group(1, &[a, b], &["P1"], &[]);
        let graph = fx.graph();

        let mut inference = ProteinInference::new(InferenceMethod::ReportAll);
        inference.add_filters_from_strings(&["psm_q_value_filter <= 0.01"]).unwrap();
        let peptides = inference
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        let surviving = peptides.get(GroupId(1));
        assert_eq!(surviving.len(), 1);
        assert_eq!(surviving[0].sequence(), "PEPTIDEA");
        let set = surviving[0].psm_sets().next().unwrap();
        assert_eq!(set.fdr_score, Some(0.001));
        // rank only exists on the canonical set
        assert_eq!(set.rank, Some(1));
    }

    #[test]
    fn peptides_are_shared_across_groups() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1", "P2"], &[5.0]);
        fx.group(1, &[a], &["P1"], &[]);
        fx.group(2, &[a], &["P2"], &[]);
        let graph = fx.graph();
        let peptides = ProteinInference::default()
            .build_filtered_peptides(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        assert!(Arc::ptr_eq(
            &peptides.get(GroupId(1))[0],
            &peptides.get(GroupId(2))[0]
        ));
        assert_eq!(peptides.len(), 1);
        assert!(group_has_direct_peptides(GroupId(1), &peptides));
        assert!(!group_has_direct_peptides(GroupId(3), &peptides));
    }

    #[test]
    fn scored_proteins_are_ranked() {
        let mut fx = Fixture::new();
        let a = fx.peptide("PEPTIDEA", &["P1"], &[5.0]);
        let b = fx.peptide("PEPTIDEB", &["P2"], &[50.0]);
        let c = fx.peptide("PEPTIDEC", &["P3"], &[50.0]);
        fx.group(1, &[a], &["P1"], &[]);
        fx.group(2, &[b], &["P2"], &[]);
        fx.group(3, &[c], &["P3"], &[]);
        let graph = fx.graph();

        let scoring = build_scoring(&ScoringSettings {
            method: ScoringMethod::Additive,
            score: "hyperscore".into(),
            psms: PsmForScoring::Best,
        });
        let proteins = ProteinInference::new(InferenceMethod::ReportAll)
            .with_scoring(scoring)
            .with_threads(2)
            .assemble(&fx.registry, &graph, &fx.canonical)
            .unwrap();
        let order = proteins.iter().map(|p| p.id().0).collect::<Vec<_>>();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(proteins[0].score(), Some(50.0));
    }
}
