//! Gate: build the gating tree and phenotype table
//!
//! This binary is the Rust equivalent of the `CytomeTree` + `Annotation`
//! entry points of the original R package. It reads an event matrix,
//! recursively partitions it into subpopulations, annotates and merges
//! the result, and writes the label and phenotype tables alongside a
//! serialized `GatingArtifact` that the `query` binary consumes.

use clap::Parser;
use cytometree_rust::{
    annotation::annotate,
    io::{load_event_matrix, save_artifact, write_labels_csv, write_phenotypes_csv},
    tree::{build, GatingParams, DEFAULT_MAX_EM_ITER},
    GatingArtifact,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "gate",
    version,
    about = "Partitions cytometry events into annotated subpopulations (Rust port)"
)]
struct Cli {
    /// Path to the event matrix CSV: header row of marker names, one row
    /// per event, every cell a finite number
    #[arg(long, required = true)]
    input: PathBuf,

    /// Prefix for output files (.labels.csv, .phenotypes.csv, .gating.bin)
    #[arg(long, default_value = "cytometree")]
    output_prefix: String,

    /// Minimum number of events per leaf
    #[arg(long, default_value_t = 1)]
    min_leaf: usize,

    /// Significance threshold on the per-marker separation statistic D
    #[arg(long, default_value_t = 0.1)]
    threshold: f64,

    /// Marker forced as the split variable at the corresponding tree level
    /// (repeat the flag to force several levels, in order)
    #[arg(long = "force-marker")]
    force_marker: Vec<String>,

    /// Cap on EM iterations per mixture fit
    #[arg(long, default_value_t = DEFAULT_MAX_EM_ITER)]
    max_em_iter: usize,

    /// Number of threads to use
    #[arg(long, default_value_t = 1)]
    n_threads: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Starting gating run for {:?}", cli.input);
    log::info!("Using {} threads", cli.n_threads);

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()?;

    // ===================================================================
    // 1. Load and validate the event matrix
    // ===================================================================
    let matrix = load_event_matrix(&cli.input)?;

    // ===================================================================
    // 2. Build the gating tree
    // ===================================================================
    let params = GatingParams {
        min_leaf: cli.min_leaf,
        threshold: cli.threshold,
        forced_markers: cli.force_marker.clone(),
        max_em_iter: cli.max_em_iter,
    };
    let tree = build(&matrix.data, &matrix.markers, &params)?;
    log::info!(
        "Tree built: {} leaves, depth {}",
        tree.n_leaves,
        tree.depth()
    );

    // ===================================================================
    // 3. Annotate leaves and merge duplicate phenotypes
    // ===================================================================
    let table = annotate(&tree);
    log::info!("{} phenotypes after merging", table.rows.len());

    // ===================================================================
    // 4. Write outputs
    // ===================================================================
    let labels_path = PathBuf::from(format!("{}.labels.csv", cli.output_prefix));
    let phenotypes_path = PathBuf::from(format!("{}.phenotypes.csv", cli.output_prefix));
    let artifact_path = PathBuf::from(format!("{}.gating.bin", cli.output_prefix));

    write_labels_csv(&labels_path, &tree.labels, &table.labels)?;
    write_phenotypes_csv(&phenotypes_path, &table)?;

    let artifact = GatingArtifact {
        markers: matrix.markers,
        params,
        tree,
        table,
    };
    save_artifact(&artifact_path, &artifact)?;

    log::info!("Gating run complete");
    Ok(())
}
