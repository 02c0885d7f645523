// ========================================================================================
//                                  Chromosomes
// ========================================================================================

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::partition::PartitionError;
use crate::types::IndexRange;

const CHR_X: &str = "X";
const CHR_Y: &str = "Y";
const CHR_M: &str = "MT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromosomeKind {
    Autosome,
    Heterosome,
    Mitochondrial,
}

pub fn classify(name: &str) -> ChromosomeKind {
    let upper = name.to_ascii_uppercase();
    if upper == CHR_X || upper == CHR_Y {
        ChromosomeKind::Heterosome
    } else if upper == CHR_M {
        ChromosomeKind::Mitochondrial
    } else {
        ChromosomeKind::Autosome
    }
}

#[derive(Debug, Error)]
pub enum ChromosomeError {
    #[error("Failed to read chromosome bounds '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse chromosome bounds '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Chromosome {chromosome}: {source}")]
    Range {
        chromosome: String,
        #[source]
        source: PartitionError,
    },
}

#[derive(Debug, Deserialize)]
struct RawBounds {
    chromosome: String,
    start: u64,
    end: u64,
}

/// The SNP index span a chromosome occupies in the manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChromosomeBounds {
    pub chromosome: String,
    pub snps: IndexRange,
}

impl ChromosomeBounds {
    pub fn kind(&self) -> ChromosomeKind {
        classify(&self.chromosome)
    }
}

/// Reads a JSON array of `{"chromosome", "start", "end"}` records with
/// half-open SNP bounds, keeping file order.
pub fn read_bounds(path: &Path) -> Result<Vec<ChromosomeBounds>, ChromosomeError> {
    let text = fs::read_to_string(path).map_err(|source| ChromosomeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: Vec<RawBounds> =
        serde_json::from_str(&text).map_err(|source| ChromosomeError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    raw.into_iter()
        .map(|r| {
            IndexRange::new(r.start, r.end)
                .map(|snps| ChromosomeBounds {
                    chromosome: r.chromosome.clone(),
                    snps,
                })
                .map_err(|source| ChromosomeError::Range {
                    chromosome: r.chromosome,
                    source,
                })
        })
        .collect()
}
