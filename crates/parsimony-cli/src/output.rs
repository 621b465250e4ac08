use crate::runner::Runner;
use anyhow::Context;
use parsimony_core::filter::FileScope;
use parsimony_core::protein::ReportProtein;
use rayon::prelude::*;
use std::sync::Arc;

impl Runner {
    pub fn serialize_protein(&self, rank: usize, protein: &ReportProtein) -> csv::ByteRecord {
        let mut record = csv::ByteRecord::new();
        record.push_field(itoa::Buffer::new().format(rank).as_bytes());
        record.push_field(itoa::Buffer::new().format(protein.id().0).as_bytes());
        record.push_field(protein.accession_names().join(";").as_bytes());
        record.push_field(if protein.is_decoy() { b"1" } else { b"0" });
        match protein.score() {
            Some(score) => record.push_field(ryu::Buffer::new().format(score).as_bytes()),
            None => record.push_field(b""),
        }
        record.push_field(
            itoa::Buffer::new()
                .format(protein.nr_peptides(FileScope::All))
                .as_bytes(),
        );
        record.push_field(
            itoa::Buffer::new()
                .format(protein.nr_unique_peptides(FileScope::All))
                .as_bytes(),
        );
        record.push_field(
            itoa::Buffer::new()
                .format(protein.nr_psms(FileScope::All))
                .as_bytes(),
        );
        record.push_field(
            itoa::Buffer::new()
                .format(protein.nr_spectra(FileScope::All))
                .as_bytes(),
        );
        let peptides = protein
            .peptides()
            .iter()
            .map(|p| p.string_id())
            .collect::<Vec<_>>();
        record.push_field(peptides.join(";").as_bytes());
        let subsets = protein
            .subsets()
            .iter()
            .map(|s| s.accession_names().join(","))
            .collect::<Vec<_>>();
        record.push_field(subsets.join(";").as_bytes());
        record
    }

    pub fn write_proteins(&self, proteins: &[Arc<ReportProtein>]) -> anyhow::Result<String> {
        let path = self.make_path("proteins.tsv");

        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(vec![]);

        let headers = csv::ByteRecord::from(vec![
            "rank",
            "protein_id",
            "accessions",
            "decoy",
            "score",
            "nr_peptides",
            "nr_unique_peptides",
            "nr_psms",
            "nr_spectra",
            "peptides",
            "subsets",
        ]);

        wtr.write_byte_record(&headers)?;
        for record in proteins
            .par_iter()
            .enumerate()
            .map(|(ix, protein)| self.serialize_protein(ix + 1, protein))
            .collect::<Vec<_>>()
        {
            wtr.write_byte_record(&record)?;
        }

        wtr.flush()?;
        let bytes = wtr.into_inner()?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;
        Ok(path.display().to_string())
    }
}
