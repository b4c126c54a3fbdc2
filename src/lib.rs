//! # cytometree-rust Crate
//!
//! This library contains the core statistical logic for the
//! `cytometree-rust` package: recursive binary gating of cytometry events
//! by per-marker Gaussian mixture model comparison, followed by phenotype
//! annotation and merging. The binaries `gate` and `query` call functions
//! from this library.

// Re-export key modules
pub mod annotation;
pub mod io;
pub mod mixture;
pub mod scoring;
pub mod tree;

#[cfg(test)]
pub(crate) mod testutil;

use std::str::FromStr;

use crate::annotation::AnnotationTable;
use crate::tree::{GatingParams, GatingTree};

/// The finished gating result produced by the `gate` binary.
/// This struct is serialized to disk (using bincode) and read by
/// the `query` binary, so lookups never re-touch the raw event matrix.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub struct GatingArtifact {
    /// Marker (column) names, in matrix order
    pub markers: Vec<String>,
    /// Parameters the tree was built with
    pub params: GatingParams,
    /// The fitted gating tree, including per-event leaf labels
    pub tree: GatingTree,
    /// The merged phenotype table and post-merge labels
    pub table: AnnotationTable,
}

/// Expression level of one marker for one subpopulation.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerCode {
    /// Leaf descends from the low-mean mixture component
    Absent,
    /// Leaf descends from the high-mean mixture component
    Present,
    /// Marker was never used to split on this leaf's path
    Undetermined,
}

impl std::fmt::Display for MarkerCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerCode::Absent => write!(f, "-"),
            MarkerCode::Present => write!(f, "+"),
            MarkerCode::Undetermined => write!(f, "."),
        }
    }
}

/// One marker/level requirement in a phenotype lookup, e.g. `CD4+` or `CD8-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub marker: String,
    pub level: MarkerCode,
}

impl FromStr for Constraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, level) = match s.char_indices().last() {
            Some((i, '+')) => (&s[..i], MarkerCode::Present),
            Some((i, '-')) => (&s[..i], MarkerCode::Absent),
            _ => {
                return Err(format!(
                    "invalid constraint '{s}': expected MARKER+ or MARKER-"
                ))
            }
        };
        if name.is_empty() {
            return Err(format!("invalid constraint '{s}': empty marker name"));
        }
        Ok(Constraint {
            marker: name.to_string(),
            level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_parses_present_and_absent() {
        let c: Constraint = "CD4+".parse().unwrap();
        assert_eq!(c.marker, "CD4");
        assert_eq!(c.level, MarkerCode::Present);

        let c: Constraint = "CD8-".parse().unwrap();
        assert_eq!(c.marker, "CD8");
        assert_eq!(c.level, MarkerCode::Absent);
    }

    #[test]
    fn constraint_rejects_missing_level_and_empty_name() {
        assert!("CD4".parse::<Constraint>().is_err());
        assert!("+".parse::<Constraint>().is_err());
        assert!("".parse::<Constraint>().is_err());
    }
}
