//! Module for annotating the finished tree: per-leaf marker expression
//! codes derived from the root-to-leaf split records, merging of
//! duplicate phenotypes, and phenotype lookup.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tree::GatingTree;
use crate::{Constraint, MarkerCode};

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("marker '{0}' is not part of the annotation table")]
    UnknownMarker(String),
}

/// One subpopulation of the final (merged) partition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Phenotype {
    pub label: u32,
    /// One code per marker, in table marker order.
    pub codes: Vec<MarkerCode>,
    /// Number of events carrying this phenotype.
    pub count: usize,
    /// The pre-merge leaf labels this row covers; a single entry for rows
    /// that absorbed nothing.
    pub merged_from: Vec<u32>,
}

/// The complete phenotype table plus the post-merge per-event labels.
/// Derived once from a finished tree; read-only afterwards. No two rows
/// share a code vector.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnnotationTable {
    pub markers: Vec<String>,
    pub rows: Vec<Phenotype>,
    /// Final label per event.
    pub labels: Vec<u32>,
}

/// Derives the phenotype table from a finished tree.
///
/// Each leaf's code vector comes entirely from the split records on its
/// root-to-leaf path: Present under a high child, Absent under a low
/// child (high/low as fixed at fit time), Undetermined for markers never
/// split on along the path. Leaves with identical code vectors are merged.
pub fn annotate(tree: &GatingTree) -> AnnotationTable {
    let n_markers = tree.markers.len();

    // Leaves in label order so row order is the pre-order leaf numbering.
    let mut leaves: Vec<(u32, usize, usize)> = tree
        .nodes
        .iter()
        .filter_map(|n| n.label.map(|l| (l, n.id, n.members.len())))
        .collect();
    leaves.sort_unstable_by_key(|&(label, _, _)| label);

    let mut rows = Vec::with_capacity(leaves.len());
    for &(label, leaf_id, count) in &leaves {
        let mut codes = vec![MarkerCode::Undetermined; n_markers];
        let mut child = leaf_id;
        let mut ancestor = tree.nodes[leaf_id].parent;
        while let Some(id) = ancestor {
            if let Some(split) = &tree.nodes[id].split {
                codes[split.marker] = if split.high_child == child {
                    MarkerCode::Present
                } else {
                    MarkerCode::Absent
                };
            }
            child = id;
            ancestor = tree.nodes[id].parent;
        }
        rows.push(Phenotype {
            label,
            codes,
            count,
            merged_from: vec![label],
        });
    }

    let rows = merge_phenotypes(rows);
    if rows.len() < leaves.len() {
        log::info!(
            "merged {} leaves into {} phenotypes",
            leaves.len(),
            rows.len()
        );
    }

    // Remap per-event labels through the merged rows.
    let mut leaf_to_final = std::collections::HashMap::new();
    for row in &rows {
        for &leaf_label in &row.merged_from {
            leaf_to_final.insert(leaf_label, row.label);
        }
    }
    let labels = tree
        .labels
        .iter()
        .map(|l| leaf_to_final.get(l).copied().unwrap_or(*l))
        .collect();

    AnnotationTable {
        markers: tree.markers.clone(),
        rows,
        labels,
    }
}

/// Merges rows with identical code vectors: counts sum, source labels
/// union, and each merged group receives a fresh label greater than every
/// input label. Rows that absorb nothing pass through untouched, so the
/// operation is idempotent. Row order is first-encounter order.
pub fn merge_phenotypes(rows: Vec<Phenotype>) -> Vec<Phenotype> {
    let mut next_label = rows.iter().map(|r| r.label).max().unwrap_or(0) + 1;
    let mut merged: Vec<Phenotype> = Vec::with_capacity(rows.len());
    for row in rows {
        match merged.iter_mut().find(|m| m.codes == row.codes) {
            Some(existing) => {
                if existing.merged_from.len() == 1 {
                    // First absorption turns this row into a merged group.
                    existing.label = next_label;
                    next_label += 1;
                }
                existing.count += row.count;
                existing.merged_from.extend(row.merged_from);
            }
            None => merged.push(row),
        }
    }
    merged
}

/// Returns the labels of all phenotype rows satisfying every constraint.
///
/// A constraint on a marker whose row code is Undetermined does not match
/// unless `allow_undetermined` is set, in which case Undetermined acts as
/// a wildcard. An unknown constraint marker fails fast.
pub fn lookup(
    table: &AnnotationTable,
    constraints: &[Constraint],
    allow_undetermined: bool,
) -> Result<Vec<u32>, AnnotationError> {
    let mut resolved = Vec::with_capacity(constraints.len());
    for c in constraints {
        let idx = table
            .markers
            .iter()
            .position(|m| *m == c.marker)
            .ok_or_else(|| AnnotationError::UnknownMarker(c.marker.clone()))?;
        resolved.push((idx, c.level));
    }

    Ok(table
        .rows
        .iter()
        .filter(|row| {
            resolved.iter().all(|&(idx, level)| {
                row.codes[idx] == level
                    || (allow_undetermined && row.codes[idx] == MarkerCode::Undetermined)
            })
        })
        .map(|row| row.label)
        .collect())
}

/// Compact phenotype name, e.g. `CD4+CD8-`. Undetermined markers are
/// omitted.
pub fn phenotype_string(markers: &[String], codes: &[MarkerCode]) -> String {
    markers
        .iter()
        .zip(codes)
        .filter(|(_, c)| **c != MarkerCode::Undetermined)
        .map(|(m, c)| format!("{m}{c}"))
        .collect()
}
