use parsimony_cli::input::{Evidence, Input};
use parsimony_cli::runner::Runner;
use parsimony_core::inference::InferenceMethod;

#[test]
fn integration() -> anyhow::Result<()> {
    let mut settings = Input::load("../../tests/parameters.json")?.build()?;
    assert_eq!(settings.inference, InferenceMethod::Parsimony);
    assert_eq!(settings.filters.len(), 3);

    let output_directory = std::env::temp_dir().join("parsimony-cli-integration");
    std::fs::create_dir_all(&output_directory)?;
    settings.evidence = "../../tests/evidence.json".into();
    settings.output_directory = output_directory.clone();

    let runner = Runner::new(settings)?;
    assert_eq!(runner.registry.psm_count(), 4);
    assert_eq!(runner.canonical.len(), 4);
    let set = &runner.canonical["index=2:CLVLTGFGGYDK"];
    assert_eq!(set.q_value, Some(0.002));
    assert!(set.fdr_good);

    let settings = runner.run()?;
    assert_eq!(settings.output_paths.len(), 2);

    let tsv = std::fs::read_to_string(output_directory.join("proteins.tsv"))?;
    let lines = tsv.lines().collect::<Vec<_>>();
    assert_eq!(
        lines[0],
        "rank\tprotein_id\taccessions\tdecoy\tscore\tnr_peptides\tnr_unique_peptides\tnr_psms\tnr_spectra\tpeptides\tsubsets"
    );
    // VAT1L is explained by VAT1 and the decoy fails the q-value filter
    assert_eq!(lines.len(), 2);
    let fields = lines[1].split('\t').collect::<Vec<_>>();
    assert_eq!(fields[0], "1");
    assert_eq!(fields[1], "2");
    assert_eq!(fields[2], "sp|Q99536|VAT1_HUMAN");
    assert_eq!(fields[3], "0");
    assert_eq!(fields[4], "70.0");
    assert_eq!(fields[5], "2");
    assert_eq!(fields[6], "1");
    assert_eq!(fields[7], "3");
    assert_eq!(fields[9], "LQSRPAAPPAPGPGQLTLR;CLVLTGFGGYDK");
    assert_eq!(fields[10], "sp|Q9BZL4|VAT1L_HUMAN");

    let results: serde_json::Value =
        serde_json::from_slice(&std::fs::read(output_directory.join("results.json"))?)?;
    assert_eq!(results["inference"], "parsimony");
    assert_eq!(results["scoring"]["score"], "hyperscore");
    Ok(())
}

#[test]
fn accessions_from_connectivity() -> anyhow::Result<()> {
    let evidence = Evidence::load("../../tests/evidence.json")?;
    assert_eq!(evidence.groups.len(), 3);
    assert!(evidence.report_psms.iter().all(|e| e.accessions.is_none()));

    let mut settings = Input::load("../../tests/parameters.json")?.build()?;
    settings.evidence = "../../tests/evidence.json".into();
    let runner = Runner::new(settings)?;

    let shared = runner
        .canonical
        .values()
        .flat_map(|set| set.psms())
        .find(|psm| psm.sequence() == "CLVLTGFGGYDK")
        .expect("shared peptide PSM");
    assert_eq!(
        shared.accessions,
        vec!["sp|Q99536|VAT1_HUMAN", "sp|Q9BZL4|VAT1L_HUMAN"]
    );
    assert!(!shared.is_unique());

    let decoy = runner
        .canonical
        .values()
        .flat_map(|set| set.psms())
        .find(|psm| psm.decoy)
        .expect("decoy PSM");
    assert_eq!(decoy.accessions, vec!["DECOY_sp|Q99536|VAT1_HUMAN"]);
    Ok(())
}
