//! Identity registry for accessions, peptides, input files and PSMs.
//!
//! Every entity kind receives dense, monotonically increasing ids starting at
//! 1. Accessions and peptides are deduplicated on their natural key (accession
//! string, peptide sequence); PSMs are committed exactly once.
//!
//! The registry is mutated only while evidence is loaded. Report assembly
//! borrows it immutably.

use crate::connectivity::ConnectionMap;
use crate::psm::{Psm, PsmId};
use crate::Error;
use fnv::FnvHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AccessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PeptideId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FileId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accession {
    pub id: AccessionId,
    pub accession: String,
    /// Protein sequence from the search database, may be empty
    #[serde(default)]
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peptide {
    pub id: PeptideId,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputFile {
    pub id: FileId,
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Default)]
pub struct Registry {
    files: FnvHashMap<FileId, InputFile>,
    file_ids: FnvHashMap<String, FileId>,
    accessions: FnvHashMap<AccessionId, Accession>,
    accession_ids: FnvHashMap<String, AccessionId>,
    peptides: FnvHashMap<PeptideId, Peptide>,
    peptide_ids: FnvHashMap<String, PeptideId>,
    psms: FnvHashMap<PsmId, Psm>,
    peptide_psms: FnvHashMap<PeptideId, Vec<PsmId>>,
    next_file: u64,
    next_accession: u64,
    next_peptide: u64,
    next_psm: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an input file, or return the existing one with the same
    /// name. The path of an existing file is not updated.
    pub fn register_input_file<S: Into<String>>(&mut self, name: S, path: S) -> &InputFile {
        let name = name.into();
        let id = match self.file_ids.get(&name) {
            Some(&id) => id,
            None => {
                self.next_file += 1;
                let id = FileId(self.next_file);
                self.file_ids.insert(name.clone(), id);
                self.files.insert(
                    id,
                    InputFile {
                        id,
                        name,
                        path: path.into(),
                    },
                );
                id
            }
        };
        &self.files[&id]
    }

    pub fn file_by_name(&self, name: &str) -> Option<&InputFile> {
        self.file_ids.get(name).and_then(|id| self.files.get(id))
    }

    pub fn file(&self, id: FileId) -> Option<&InputFile> {
        self.files.get(&id)
    }

    pub fn files(&self) -> impl Iterator<Item = &InputFile> + '_ {
        self.files.values().sorted_by_key(|f| f.id)
    }

    /// Register an accession, or return the existing one with the same
    /// accession string. The sequence of an existing accession is not updated.
    pub fn register_accession(&mut self, accession: &str, sequence: &str) -> &Accession {
        let id = match self.accession_ids.get(accession) {
            Some(&id) => id,
            None => {
                self.next_accession += 1;
                let id = AccessionId(self.next_accession);
                log::trace!("{:?} accession {}", id, accession);
                self.accession_ids.insert(accession.to_string(), id);
                self.accessions.insert(
                    id,
                    Accession {
                        id,
                        accession: accession.to_string(),
                        sequence: sequence.to_string(),
                    },
                );
                id
            }
        };
        &self.accessions[&id]
    }

    pub fn accession(&self, id: AccessionId) -> Option<&Accession> {
        self.accessions.get(&id)
    }

    pub fn accession_by_name(&self, accession: &str) -> Option<&Accession> {
        self.accession_ids
            .get(accession)
            .and_then(|id| self.accessions.get(id))
    }

    pub fn accession_count(&self) -> usize {
        self.accessions.len()
    }

    pub fn accession_ids(&self) -> Vec<AccessionId> {
        self.accessions.keys().copied().sorted().collect()
    }

    /// Register a peptide sequence, or return the existing peptide. In a
    /// fresh registry the n-th distinct sequence receives id n; after a
    /// restore, numbering continues above the highest restored id.
    pub fn register_peptide(&mut self, sequence: &str) -> &Peptide {
        let id = match self.peptide_ids.get(sequence) {
            Some(&id) => id,
            None => {
                self.next_peptide += 1;
                let id = PeptideId(self.next_peptide);
                self.peptide_ids.insert(sequence.to_string(), id);
                self.peptides.insert(
                    id,
                    Peptide {
                        id,
                        sequence: sequence.to_string(),
                    },
                );
                id
            }
        };
        &self.peptides[&id]
    }

    pub fn peptide(&self, id: PeptideId) -> Option<&Peptide> {
        self.peptides.get(&id)
    }

    pub fn peptide_by_sequence(&self, sequence: &str) -> Option<&Peptide> {
        self.peptide_ids
            .get(sequence)
            .and_then(|id| self.peptides.get(id))
    }

    pub fn peptide_count(&self) -> usize {
        self.peptides.len()
    }

    pub fn peptide_ids(&self) -> Vec<PeptideId> {
        self.peptides.keys().copied().sorted().collect()
    }

    /// Hand out a fresh PSM id. Ids are reserved on creation, so several PSMs
    /// may be built before any of them is committed.
    pub fn next_psm_id(&mut self) -> PsmId {
        self.next_psm += 1;
        PsmId(self.next_psm)
    }

    /// Commit a completely built PSM. The PSM must reference a registered
    /// peptide sequence and input file, and its id must not have been
    /// committed before. On failure the registry is left unchanged.
    pub fn commit_psm(&mut self, psm: Psm) -> Result<PsmId, Error> {
        if psm.id.0 == 0 {
            return Err(Error::UnknownEntity(format!(
                "PSM id 0 was never handed out ({})",
                psm.sequence
            )));
        }
        if self.psms.contains_key(&psm.id) {
            return Err(Error::DuplicateIdentity(format!(
                "PSM {} was already committed ({})",
                psm.id.0, psm.sequence
            )));
        }
        let peptide = self
            .peptide_ids
            .get(&psm.sequence)
            .copied()
            .ok_or_else(|| {
                Error::UnknownEntity(format!("peptide `{}` is not registered", psm.sequence))
            })?;
        if !self.files.contains_key(&psm.file) {
            return Err(Error::UnknownEntity(format!(
                "input file {} is not registered",
                psm.file.0
            )));
        }

        let id = psm.id;
        self.next_psm = self.next_psm.max(id.0);
        self.peptide_psms.entry(peptide).or_default().push(id);
        self.psms.insert(id, psm);
        Ok(id)
    }

    pub fn psm(&self, id: PsmId) -> Option<&Psm> {
        self.psms.get(&id)
    }

    pub fn psm_count(&self) -> usize {
        self.psms.len()
    }

    pub fn psm_ids(&self) -> Vec<PsmId> {
        self.psms.keys().copied().sorted().collect()
    }

    /// Committed PSMs of a peptide, in commit order
    pub fn psms_of(&self, peptide: PeptideId) -> impl Iterator<Item = &Psm> + '_ {
        self.peptide_psms
            .get(&peptide)
            .into_iter()
            .flatten()
            .filter_map(|id| self.psms.get(id))
    }

    /// Persistable view of the registry and its connectivity
    pub fn snapshot(&self, connections: &ConnectionMap) -> RegistrySnapshot {
        RegistrySnapshot {
            files: self.files().cloned().collect(),
            accessions: self
                .accessions
                .values()
                .sorted_by_key(|a| a.id)
                .cloned()
                .collect(),
            peptides: self
                .peptides
                .values()
                .sorted_by_key(|p| p.id)
                .cloned()
                .collect(),
            psms: self
                .psms
                .values()
                .sorted_by_key(|p| p.id)
                .cloned()
                .collect(),
            edges: connections.edges().sorted().collect(),
        }
    }
}

/// Storage-agnostic persisted state of the registry: accessions, peptides,
/// PSMs, input files and accession-peptide edges
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub accessions: Vec<Accession>,
    #[serde(default)]
    pub peptides: Vec<Peptide>,
    #[serde(default)]
    pub psms: Vec<Psm>,
    #[serde(default)]
    pub edges: Vec<(AccessionId, PeptideId)>,
}

impl RegistrySnapshot {
    /// Rebuild a registry and its connectivity, enforcing uniqueness of ids,
    /// file names, accession strings and peptide sequences. Ids start at 1;
    /// counters resume above the highest restored id of each kind.
    pub fn restore(self) -> Result<(Registry, ConnectionMap), Error> {
        let mut registry = Registry::default();

        for file in self.files {
            if file.id.0 == 0 {
                return Err(Error::UnknownEntity(format!("input file {} has id 0", file.name)));
            }
            if registry.files.contains_key(&file.id) || registry.file_ids.contains_key(&file.name) {
                return Err(Error::DuplicateIdentity(format!(
                    "input file {} ({})",
                    file.id.0, file.name
                )));
            }
            registry.next_file = registry.next_file.max(file.id.0);
            registry.file_ids.insert(file.name.clone(), file.id);
            registry.files.insert(file.id, file);
        }

        for accession in self.accessions {
            if accession.id.0 == 0 {
                return Err(Error::UnknownEntity(format!(
                    "accession {} has id 0",
                    accession.accession
                )));
            }
            if registry.accessions.contains_key(&accession.id)
                || registry.accession_ids.contains_key(&accession.accession)
            {
                return Err(Error::DuplicateIdentity(format!(
                    "accession {} ({})",
                    accession.id.0, accession.accession
                )));
            }
            registry.next_accession = registry.next_accession.max(accession.id.0);
            registry
                .accession_ids
                .insert(accession.accession.clone(), accession.id);
            registry.accessions.insert(accession.id, accession);
        }

        for peptide in self.peptides {
            if peptide.id.0 == 0 {
                return Err(Error::UnknownEntity(format!(
                    "peptide {} has id 0",
                    peptide.sequence
                )));
            }
            if registry.peptides.contains_key(&peptide.id)
                || registry.peptide_ids.contains_key(&peptide.sequence)
            {
                return Err(Error::DuplicateIdentity(format!(
                    "peptide {} ({})",
                    peptide.id.0, peptide.sequence
                )));
            }
            registry.next_peptide = registry.next_peptide.max(peptide.id.0);
            registry
                .peptide_ids
                .insert(peptide.sequence.clone(), peptide.id);
            registry.peptides.insert(peptide.id, peptide);
        }

        for psm in self.psms {
            registry.commit_psm(psm)?;
        }

        let mut connections = ConnectionMap::default();
        for (accession, peptide) in self.edges {
            connections.link(&registry, accession, peptide)?;
        }

        Ok((registry, connections))
    }
}
