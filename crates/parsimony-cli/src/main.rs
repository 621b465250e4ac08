use clap::{value_parser, Arg, Command, ValueHint};
use parsimony_cli::input::Input;
use parsimony_cli::runner::Runner;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("PARSIMONY_LOG", "error,parsimony=info"))
        .init();

    let matches = Command::new("parsimony")
        .version(clap::crate_version!())
        .about("Protein inference from clustered peptide evidence")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("evidence")
                .short('e')
                .long("evidence")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to the evidence file (registry snapshot, groups and PSM annotations). \
                     Overrides the file specified in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where the protein report will be written. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .help("Worker threads for assembly, zero or less uses every core")
                .value_hint(ValueHint::Other),
        )
        .arg(
            Arg::new("filter")
                .long("filter")
                .action(clap::ArgAction::Append)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Filter expression such as \"psm_q_value_filter <= 0.01\". \
                     May be given several times; added to the configured filters.",
                )
                .value_hint(ValueHint::Other),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let input = Input::from_arguments(matches)?;

    let runner = input.build().and_then(Runner::new)?;
    runner.run()?;

    Ok(())
}
