pub mod connectivity;
pub mod filter;
pub mod group;
pub mod inference;
pub mod peptide;
pub mod protein;
pub mod psm;
pub mod registry;
pub mod scoring;

use group::GroupId;
use std::io::Read;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("no PSM set found for identification key `{0}`")]
    MissingPsmSet(String),
    #[error("no report PSM found for PSM {psm} in set `{key}`")]
    MissingReportPsm { psm: u64, key: String },
    #[error("malformed group graph: subset cycle through groups {}", format_cycle(.0))]
    MalformedGroupGraph(Vec<GroupId>),
    #[error(transparent)]
    Filter(#[from] filter::FilterErrors),
    #[error("could not build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_cycle(ids: &[GroupId]) -> String {
    ids.iter()
        .map(|id| id.0.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub fn read_json<P, T>(path: P) -> Result<T, Error>
where
    P: AsRef<std::path::Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let mut contents = String::new();
    std::fs::File::open(path)?.read_to_string(&mut contents)?;
    Ok(serde_json::from_str(&contents)?)
}
