//! Module for building the gating tree: recursive binary partitioning of
//! events, choosing at each node the marker whose bimodal mixture best
//! improves on a unimodal fit.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mixture::{fit_marker, GaussianComponent, MarkerFit, MixtureFit};
use crate::scoring::{candidate_from_fit, select_split, separation_statistic, SplitCandidate};

/// Default cap on EM iterations per mixture fit.
pub const DEFAULT_MAX_EM_ITER: usize = 500;

#[derive(Error, Debug)]
pub enum GatingError {
    #[error("event matrix is empty")]
    EmptyMatrix,
    #[error("min_leaf must be positive")]
    ZeroMinLeaf,
    #[error("min_leaf ({min_leaf}) must be smaller than the number of events ({n_events})")]
    MinLeafTooLarge { min_leaf: usize, n_events: usize },
    #[error("more markers ({n_markers}) than events ({n_events})")]
    MoreMarkersThanEvents { n_markers: usize, n_events: usize },
    #[error("threshold must be non-negative, got {0}")]
    NegativeThreshold(f64),
    #[error("forced marker '{0}' is not a column of the event matrix")]
    UnknownForcedMarker(String),
    #[error("forced marker '{0}' appears more than once")]
    DuplicateForcedMarker(String),
}

/// Runtime parameters for tree construction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GatingParams {
    /// Minimum number of events a leaf may hold.
    pub min_leaf: usize,
    /// Significance threshold `t` on the separation statistic D.
    pub threshold: f64,
    /// Marker names forced as split variables for the first tree levels,
    /// in order: `forced_markers[d]` is attempted at every node of depth d.
    pub forced_markers: Vec<String>,
    /// Cap on EM iterations per mixture fit.
    pub max_em_iter: usize,
}

impl Default for GatingParams {
    fn default() -> Self {
        GatingParams {
            min_leaf: 1,
            threshold: 0.1,
            forced_markers: Vec::new(),
            max_em_iter: DEFAULT_MAX_EM_ITER,
        }
    }
}

/// Split record of an internal node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Split {
    /// Column index of the splitting marker.
    pub marker: usize,
    /// Fitted low-mean component; its events went to `low_child`.
    pub low: GaussianComponent,
    /// Fitted high-mean component; its events went to `high_child`.
    pub high: GaussianComponent,
    /// Separation statistic D the split was accepted with.
    pub statistic: f64,
    pub low_child: usize,
    pub high_child: usize,
}

/// One arena slot of the tree. Written once: a node is finalized as either
/// split (two children) or leaf (label) and never transitions back.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Node {
    pub id: usize,
    pub parent: Option<usize>,
    pub depth: usize,
    /// Event indices belonging to this node. Siblings partition the
    /// parent's members exactly.
    pub members: Vec<usize>,
    pub split: Option<Split>,
    /// 1-based leaf label in pre-order; `None` on internal nodes.
    pub label: Option<u32>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.split.is_none()
    }
}

/// The finished tree: node arena (root at index 0), per-event leaf labels,
/// and the marker names the column indices refer to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GatingTree {
    pub markers: Vec<String>,
    pub nodes: Vec<Node>,
    /// Leaf label per event, 1-based, assigned by pre-order traversal
    /// (low child before high child).
    pub labels: Vec<u32>,
    pub n_leaves: u32,
}

impl GatingTree {
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }
}

/// Builds the gating tree for an n x p event matrix.
///
/// Fails fast on structural parameter problems; numerical trouble inside
/// the per-marker fits is handled locally and only ever results in a
/// marker contributing no split candidate.
pub fn build(
    matrix: &Array2<f64>,
    markers: &[String],
    params: &GatingParams,
) -> Result<GatingTree, GatingError> {
    let n_events = matrix.nrows();
    let n_markers = matrix.ncols();
    if n_events == 0 || n_markers == 0 {
        return Err(GatingError::EmptyMatrix);
    }
    if params.min_leaf == 0 {
        return Err(GatingError::ZeroMinLeaf);
    }
    if params.min_leaf >= n_events {
        return Err(GatingError::MinLeafTooLarge {
            min_leaf: params.min_leaf,
            n_events,
        });
    }
    if n_markers > n_events {
        return Err(GatingError::MoreMarkersThanEvents {
            n_markers,
            n_events,
        });
    }
    if params.threshold < 0.0 {
        return Err(GatingError::NegativeThreshold(params.threshold));
    }

    let mut forced = Vec::with_capacity(params.forced_markers.len());
    for name in &params.forced_markers {
        let idx = markers
            .iter()
            .position(|m| m == name)
            .ok_or_else(|| GatingError::UnknownForcedMarker(name.clone()))?;
        if forced.contains(&idx) {
            return Err(GatingError::DuplicateForcedMarker(name.clone()));
        }
        forced.push(idx);
    }

    log::info!(
        "building gating tree: {} events x {} markers, min_leaf={}, threshold={}",
        n_events,
        n_markers,
        params.min_leaf,
        params.threshold
    );

    let mut builder = Builder {
        matrix,
        markers,
        params,
        forced,
        nodes: Vec::new(),
    };
    builder.nodes.push(Node {
        id: 0,
        parent: None,
        depth: 0,
        members: (0..n_events).collect(),
        split: None,
        label: None,
    });
    let mut used = vec![false; n_markers];
    builder.grow(0, &mut used);

    let mut nodes = builder.nodes;
    let (labels, n_leaves) = assign_labels(&mut nodes, n_events);
    log::info!("gating tree finished: {} nodes, {} leaves", nodes.len(), n_leaves);

    Ok(GatingTree {
        markers: markers.to_vec(),
        nodes,
        labels,
        n_leaves,
    })
}

struct Builder<'a> {
    matrix: &'a Array2<f64>,
    markers: &'a [String],
    params: &'a GatingParams,
    /// Forced marker column indices, one per tree level.
    forced: Vec<usize>,
    nodes: Vec<Node>,
}

impl Builder<'_> {
    /// Decides the fate of one node and recurses into any children.
    /// `used` tracks markers consumed on the root-to-node path and is
    /// restored on return.
    fn grow(&mut self, id: usize, used: &mut Vec<bool>) {
        let size = self.nodes[id].members.len();
        let depth = self.nodes[id].depth;
        let n_markers = self.matrix.ncols();

        // Structural leaf: too small to yield two valid children, or too
        // few events for identifiable fits.
        if size < 2 * self.params.min_leaf || size < n_markers {
            log::debug!("node {id} (n={size}): leaf (below structural minimum)");
            return;
        }

        // Forced-marker override for the first tree levels.
        if depth < self.forced.len() {
            let marker = self.forced[depth];
            if !used[marker] && self.try_forced_split(id, marker, used) {
                return;
            }
            log::debug!(
                "node {id}: forced marker '{}' unusable here, falling back to scoring",
                self.nodes_marker_name(marker)
            );
        }

        let available: Vec<usize> = (0..n_markers).filter(|&m| !used[m]).collect();
        if available.is_empty() {
            log::debug!("node {id} (n={size}): leaf (all markers consumed on path)");
            return;
        }

        // Fit every available marker; collected in marker order, so the
        // outcome is independent of rayon scheduling.
        let members = self.nodes[id].members.clone();
        let max_em_iter = self.params.max_em_iter;
        let matrix = self.matrix;
        let fits: Vec<(usize, MarkerFit)> = available
            .par_iter()
            .map(|&m| {
                let values: Vec<f64> = members.iter().map(|&ev| matrix[[ev, m]]).collect();
                (m, fit_marker(&values, max_em_iter))
            })
            .collect();

        let candidates: Vec<SplitCandidate> = fits
            .iter()
            .filter_map(|(m, fit)| candidate_from_fit(*m, fit))
            .collect();

        match select_split(&candidates, self.params.threshold, self.params.min_leaf) {
            Some(best) => {
                let marker = best.marker;
                let statistic = best.statistic;
                let mixture = fits.into_iter().find_map(|(m, fit)| match fit {
                    MarkerFit::Bimodal { mixture, .. } if m == marker => Some(mixture),
                    _ => None,
                });
                match mixture {
                    Some(mixture) => {
                        log::debug!(
                            "node {id} (n={size}): split on '{}' (D={statistic:.4})",
                            self.nodes_marker_name(marker)
                        );
                        self.split_node(id, marker, statistic, &mixture, used);
                    }
                    // A selected candidate always originates from a
                    // Bimodal fit; stay total regardless.
                    None => log::warn!("node {id}: selected split lost its fit, keeping leaf"),
                }
            }
            None => {
                log::debug!("node {id} (n={size}): leaf (no marker above threshold)");
            }
        }
    }

    /// Attempts a split on a forced marker: the threshold is bypassed but
    /// degenerate fits and min_leaf child sizes still veto it.
    fn try_forced_split(&mut self, id: usize, marker: usize, used: &mut Vec<bool>) -> bool {
        let members = self.nodes[id].members.clone();
        let values: Vec<f64> = members.iter().map(|&ev| self.matrix[[ev, marker]]).collect();
        match fit_marker(&values, self.params.max_em_iter) {
            MarkerFit::Bimodal { unimodal, mixture } => {
                let n_high = mixture.assignments.iter().filter(|&&a| a).count();
                let n_low = values.len() - n_high;
                if n_low < self.params.min_leaf || n_high < self.params.min_leaf {
                    return false;
                }
                let statistic = separation_statistic(&unimodal, &mixture, values.len());
                log::debug!(
                    "node {id}: forced split on '{}' (D={statistic:.4})",
                    self.nodes_marker_name(marker)
                );
                self.split_node(id, marker, statistic, &mixture, used);
                true
            }
            _ => false,
        }
    }

    /// Creates the two children, records the split, and recurses. The low
    /// child is created first so pre-order labeling is low-before-high.
    fn split_node(
        &mut self,
        id: usize,
        marker: usize,
        statistic: f64,
        mixture: &MixtureFit,
        used: &mut Vec<bool>,
    ) {
        let members = std::mem::take(&mut self.nodes[id].members);
        let mut low_members = Vec::new();
        let mut high_members = Vec::new();
        for (i, &ev) in members.iter().enumerate() {
            if mixture.assignments[i] {
                high_members.push(ev);
            } else {
                low_members.push(ev);
            }
        }
        let depth = self.nodes[id].depth;
        self.nodes[id].members = members;

        let low_child = self.nodes.len();
        self.nodes.push(Node {
            id: low_child,
            parent: Some(id),
            depth: depth + 1,
            members: low_members,
            split: None,
            label: None,
        });
        let high_child = self.nodes.len();
        self.nodes.push(Node {
            id: high_child,
            parent: Some(id),
            depth: depth + 1,
            members: high_members,
            split: None,
            label: None,
        });

        self.nodes[id].split = Some(Split {
            marker,
            low: mixture.low,
            high: mixture.high,
            statistic,
            low_child,
            high_child,
        });

        used[marker] = true;
        self.grow(low_child, used);
        self.grow(high_child, used);
        used[marker] = false;
    }

    fn nodes_marker_name(&self, marker: usize) -> &str {
        &self.markers[marker]
    }
}

/// Numbers leaves 1..=K by explicit pre-order traversal (low child before
/// high child) and fills the per-event label vector. Deterministic for a
/// given tree regardless of how subtrees were computed.
fn assign_labels(nodes: &mut [Node], n_events: usize) -> (Vec<u32>, u32) {
    let mut labels = vec![0u32; n_events];
    let mut next = 0u32;
    let mut stack = vec![0usize];
    while let Some(id) = stack.pop() {
        let children = nodes[id].split.as_ref().map(|s| (s.low_child, s.high_child));
        match children {
            Some((low, high)) => {
                // Pushed high first so low pops first.
                stack.push(high);
                stack.push(low);
            }
            None => {
                next += 1;
                nodes[id].label = Some(next);
                for &ev in &nodes[id].members {
                    labels[ev] = next;
                }
            }
        }
    }
    (labels, next)
}
