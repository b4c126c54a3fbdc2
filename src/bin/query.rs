//! Query: look up subpopulations by phenotype
//!
//! This binary is the Rust equivalent of the original package's
//! `RetrievePops` utility. It loads the `GatingArtifact` written by
//! `gate` and prints the phenotype-table rows matching a set of
//! marker/level constraints, without touching the raw event matrix.

use clap::Parser;
use cytometree_rust::{
    annotation::{lookup, phenotype_string},
    io::load_artifact,
    Constraint,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "query",
    version,
    about = "Queries a gating artifact for phenotype combinations (Rust port)"
)]
struct Cli {
    /// Path to the .gating.bin artifact written by `gate`
    #[arg(long, required = true)]
    artifact: PathBuf,

    /// Treat Undetermined marker codes as wildcards that satisfy any
    /// constraint on that marker
    #[arg(long)]
    allow_undetermined: bool,

    /// Phenotype constraints, e.g. 'CD4+' 'CD8-'
    #[arg(required = true)]
    constraints: Vec<Constraint>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let artifact = load_artifact(&cli.artifact)?;

    let labels = lookup(&artifact.table, &cli.constraints, cli.allow_undetermined)?;
    if labels.is_empty() {
        log::warn!("no phenotype matches the given constraints");
    }

    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(["label", "count", "phenotype"])?;
    for label in labels {
        if let Some(row) = artifact.table.rows.iter().find(|r| r.label == label) {
            writer.write_record([
                row.label.to_string(),
                row.count.to_string(),
                phenotype_string(&artifact.table.markers, &row.codes),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}
