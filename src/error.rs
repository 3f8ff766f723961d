use std::{io, result};
use thiserror::Error;

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("region {0} not found")]
    NotFound(i64),

    #[error("region id {0} already exists")]
    Conflict(i64),

    #[error("region {0} has children and cannot be deleted")]
    HasChildren(i64),

    #[error("operation requires a single outer ring, region {0} has {1}")]
    NotSinglePolygon(i64, usize),

    #[error("split of region {0} produced {1} piece(s)")]
    NoSplit(i64, usize),

    #[error("feature vector for region {0} is outside predictor bounds")]
    Unestimable(i64),

    #[error("store is read-only, mutation refused")]
    Forbidden,

    #[error("malformed OSM XML: {0}")]
    MalformedXML(String),

    #[error("way fragment could not be joined into a closed ring: {0}")]
    UnconnectedWay(String),

    #[error("ring has fewer than 3 nodes")]
    DegenerateRing,

    #[error("reference to missing element: {0}")]
    MissingReference(String),

    #[error("snapshot requested again within the same minute")]
    Retry,

    #[error("spatial store error: {0}")]
    SpatialStoreError(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error("invalid model asset: {0}")]
    InvalidModel(String),
}
