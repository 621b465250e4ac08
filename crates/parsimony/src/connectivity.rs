//! Bipartite accession <-> peptide connectivity, used to seed the clustering
//! of accessions into groups.

use crate::registry::{Accession, AccessionId, Peptide, PeptideId, Registry};
use crate::Error;
use fnv::{FnvHashMap, FnvHashSet};

#[derive(Debug, Default, Clone)]
pub struct ConnectionMap {
    accession_peptides: FnvHashMap<AccessionId, FnvHashSet<PeptideId>>,
    peptide_accessions: FnvHashMap<PeptideId, FnvHashSet<AccessionId>>,
}

impl ConnectionMap {
    /// Connect an accession with a peptide. Both must already be registered;
    /// otherwise neither direction of the map is touched.
    pub fn link(
        &mut self,
        registry: &Registry,
        accession: AccessionId,
        peptide: PeptideId,
    ) -> Result<(), Error> {
        if registry.accession(accession).is_none() {
            return Err(Error::UnknownEntity(format!(
                "accession {} is not registered",
                accession.0
            )));
        }
        if registry.peptide(peptide).is_none() {
            return Err(Error::UnknownEntity(format!(
                "peptide {} is not registered",
                peptide.0
            )));
        }
        self.accession_peptides
            .entry(accession)
            .or_default()
            .insert(peptide);
        self.peptide_accessions
            .entry(peptide)
            .or_default()
            .insert(accession);
        Ok(())
    }

    pub fn peptides_of(&self, accession: AccessionId) -> Option<&FnvHashSet<PeptideId>> {
        self.accession_peptides.get(&accession)
    }

    pub fn accessions_of(&self, peptide: PeptideId) -> Option<&FnvHashSet<AccessionId>> {
        self.peptide_accessions.get(&peptide)
    }

    /// Peptides connected to an accession, looked up by accession string
    pub fn peptides_of_accession<'r>(
        &self,
        registry: &'r Registry,
        accession: &str,
    ) -> Option<Vec<&'r Peptide>> {
        let id = registry.accession_by_name(accession)?.id;
        self.peptides_of(id)
            .map(|peps| peps.iter().filter_map(|&p| registry.peptide(p)).collect())
    }

    /// Accessions connected to a peptide, looked up by sequence
    pub fn accessions_of_sequence<'r>(
        &self,
        registry: &'r Registry,
        sequence: &str,
    ) -> Option<Vec<&'r Accession>> {
        let id = registry.peptide_by_sequence(sequence)?.id;
        self.accessions_of(id)
            .map(|accs| accs.iter().filter_map(|&a| registry.accession(a)).collect())
    }

    /// All edges, in no particular order
    pub fn edges(&self) -> impl Iterator<Item = (AccessionId, PeptideId)> + '_ {
        self.accession_peptides
            .iter()
            .flat_map(|(&acc, peps)| peps.iter().map(move |&pep| (acc, pep)))
    }

    pub fn len(&self) -> usize {
        self.accession_peptides.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.accession_peptides.is_empty()
    }

    /// Drop all edges, e.g. between two clustering passes over the same registry
    pub fn clear(&mut self) {
        self.accession_peptides.clear();
        self.peptide_accessions.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_ids_are_rejected() {
        let mut registry = Registry::new();
        let acc = registry.register_accession("P1", "").id;
        let pep = registry.register_peptide("PEPTIDEA").id;
        let mut map = ConnectionMap::default();

        assert!(matches!(
            map.link(&registry, acc, PeptideId(42)),
            Err(Error::UnknownEntity(_))
        ));
        assert!(matches!(
            map.link(&registry, AccessionId(42), pep),
            Err(Error::UnknownEntity(_))
        ));
        // neither direction was touched
        assert!(map.peptides_of(acc).is_none());
        assert!(map.accessions_of(pep).is_none());
        assert!(map.accessions_of(PeptideId(42)).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn links_are_symmetric() {
        let mut registry = Registry::new();
        let p1 = registry.register_accession("P1", "").id;
        let p2 = registry.register_accession("P2", "").id;
        let pep = registry.register_peptide("PEPTIDEA").id;
        let mut map = ConnectionMap::default();
        map.link(&registry, p1, pep).unwrap();
        map.link(&registry, p2, pep).unwrap();
        map.link(&registry, p2, pep).unwrap();

        assert_eq!(map.len(), 2);
        assert!(map.peptides_of(p1).unwrap().contains(&pep));
        assert_eq!(map.accessions_of(pep).unwrap().len(), 2);

        let mut names = map
            .accessions_of_sequence(&registry, "PEPTIDEA")
            .unwrap()
            .into_iter()
            .map(|a| a.accession.as_str())
            .collect::<Vec<_>>();
        names.sort_unstable();
        assert_eq!(names, vec!["P1", "P2"]);

        map.clear();
        assert!(map.peptides_of(p1).is_none());
        assert!(map.accessions_of(pep).is_none());
    }
}
