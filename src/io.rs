//! Module for handling I/O: loading and validating the event matrix,
//! writing result tables, and persisting the gating artifact between the
//! `gate` and `query` binaries.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::Array2;
use thiserror::Error;

use crate::annotation::AnnotationTable;
use crate::GatingArtifact;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("artifact serialization error: {0}")]
    Artifact(#[from] bincode::Error),
    #[error("event matrix is empty")]
    Empty,
    #[error("non-numeric value '{value}' at row {row}, column '{column}'")]
    NonNumeric {
        row: usize,
        column: String,
        value: String,
    },
    #[error("non-finite value at row {row}, column '{column}'")]
    NonFinite { row: usize, column: String },
    #[error("matrix shape error: {0}")]
    Shape(String),
}

/// A validated event matrix: n rows (events) by p named columns (markers).
pub struct EventMatrix {
    pub markers: Vec<String>,
    pub data: Array2<f64>,
}

/// Loads a headered CSV of marker intensities. Every cell must parse as a
/// finite f64; the header row supplies marker names. Rejects empty input
/// and ragged rows.
pub fn load_event_matrix(path: &Path) -> Result<EventMatrix, IoError> {
    log::info!("loading event matrix from {:?}", path);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let markers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    if markers.is_empty() {
        return Err(IoError::Empty);
    }

    let mut values = Vec::new();
    let mut n_rows = 0usize;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (col, field) in record.iter().enumerate() {
            let value: f64 = field.trim().parse().map_err(|_| IoError::NonNumeric {
                row,
                column: markers.get(col).cloned().unwrap_or_default(),
                value: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(IoError::NonFinite {
                    row,
                    column: markers.get(col).cloned().unwrap_or_default(),
                });
            }
            values.push(value);
        }
        n_rows += 1;
    }
    if n_rows == 0 {
        return Err(IoError::Empty);
    }

    let data = Array2::from_shape_vec((n_rows, markers.len()), values)
        .map_err(|e| IoError::Shape(e.to_string()))?;
    log::info!("loaded {} events x {} markers", n_rows, markers.len());

    Ok(EventMatrix { markers, data })
}

/// Writes the per-event label assignment: raw leaf label and final
/// (post-merge) phenotype label.
pub fn write_labels_csv(
    path: &Path,
    leaf_labels: &[u32],
    final_labels: &[u32],
) -> Result<(), IoError> {
    #[derive(serde::Serialize)]
    struct LabelRecord {
        event: usize,
        leaf_label: u32,
        phenotype_label: u32,
    }

    let mut writer = csv::Writer::from_path(path)?;
    for (event, (&leaf, &fin)) in leaf_labels.iter().zip(final_labels).enumerate() {
        writer.serialize(LabelRecord {
            event,
            leaf_label: leaf,
            phenotype_label: fin,
        })?;
    }
    writer.flush()?;
    log::info!("wrote {} label rows to {:?}", leaf_labels.len(), path);
    Ok(())
}

/// Writes the phenotype table: one row per final label, one +/-/. column
/// per marker, event count, and the absorbed leaf labels.
pub fn write_phenotypes_csv(path: &Path, table: &AnnotationTable) -> Result<(), IoError> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["label".to_string(), "count".to_string()];
    header.extend(table.markers.iter().cloned());
    header.push("merged_from".to_string());
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![row.label.to_string(), row.count.to_string()];
        record.extend(row.codes.iter().map(|c| c.to_string()));
        record.push(
            row.merged_from
                .iter()
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(";"),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    log::info!("wrote {} phenotype rows to {:?}", table.rows.len(), path);
    Ok(())
}

/// Saves the gating artifact to a binary file for later querying.
pub fn save_artifact(path: &Path, artifact: &GatingArtifact) -> Result<(), IoError> {
    log::info!("saving gating artifact to {:?}", path);
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, artifact)?;
    writer.flush()?;
    Ok(())
}

/// Loads a gating artifact written by [`save_artifact`].
pub fn load_artifact(path: &Path) -> Result<GatingArtifact, IoError> {
    log::info!("loading gating artifact from {:?}", path);
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let artifact: GatingArtifact = bincode::deserialize_from(reader)?;
    log::info!(
        "artifact loaded: {} markers, {} leaves, {} phenotypes",
        artifact.markers.len(),
        artifact.tree.n_leaves,
        artifact.table.rows.len()
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::annotate;
    use crate::tree::{build, GatingParams};

    fn write_temp_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_a_valid_matrix() {
        let file = write_temp_csv("CD4,CD8\n1.0,2.0\n3.5,-0.5\n0.0,4.25\n");
        let matrix = load_event_matrix(file.path()).unwrap();
        assert_eq!(matrix.markers, vec!["CD4", "CD8"]);
        assert_eq!(matrix.data.nrows(), 3);
        assert_eq!(matrix.data[[1, 0]], 3.5);
        assert_eq!(matrix.data[[2, 1]], 4.25);
    }

    #[test]
    fn rejects_non_numeric_values() {
        let file = write_temp_csv("CD4,CD8\n1.0,abc\n");
        let err = load_event_matrix(file.path());
        assert!(matches!(err, Err(IoError::NonNumeric { .. })));
    }

    #[test]
    fn rejects_non_finite_values() {
        let file = write_temp_csv("CD4,CD8\n1.0,NaN\n");
        assert!(matches!(
            load_event_matrix(file.path()),
            Err(IoError::NonFinite { .. })
        ));
        let file = write_temp_csv("CD4,CD8\ninf,2.0\n");
        assert!(matches!(
            load_event_matrix(file.path()),
            Err(IoError::NonFinite { .. })
        ));
    }

    #[test]
    fn rejects_empty_input() {
        let file = write_temp_csv("CD4,CD8\n");
        assert!(matches!(load_event_matrix(file.path()), Err(IoError::Empty)));
    }

    #[test]
    fn rejects_ragged_rows() {
        let file = write_temp_csv("CD4,CD8\n1.0,2.0\n3.0\n");
        assert!(matches!(load_event_matrix(file.path()), Err(IoError::Csv(_))));
    }

    #[test]
    fn artifact_round_trips() {
        use crate::testutil::{gaussian_sample, interleaved_noise, matrix_from_columns};

        let mut a = gaussian_sample(-3.0, 1.0, 50);
        a.extend(gaussian_sample(3.0, 1.0, 50));
        let b = interleaved_noise(0.0, 1.0, 100);
        let matrix = matrix_from_columns(&[a, b]);
        let markers = vec!["A".to_string(), "B".to_string()];
        let params = GatingParams::default();
        let tree = build(&matrix, &markers, &params).unwrap();
        let table = annotate(&tree);
        let artifact = GatingArtifact {
            markers,
            params,
            tree,
            table,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.gating.bin");
        save_artifact(&path, &artifact).unwrap();
        let loaded = load_artifact(&path).unwrap();

        assert_eq!(loaded.markers, artifact.markers);
        assert_eq!(loaded.tree.labels, artifact.tree.labels);
        assert_eq!(loaded.table, artifact.table);
    }

    #[test]
    fn label_csv_contains_every_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        write_labels_csv(&path, &[1, 1, 2], &[1, 1, 2]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4); // header + 3 events
        assert_eq!(lines[0], "event,leaf_label,phenotype_label");
        assert_eq!(lines[3], "2,2,2");
    }
}
