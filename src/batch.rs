//! Batch orchestration.
//!
//! Runs normalize → project → match → resolve for every track of a batch,
//! either one track at a time or on a fixed-size worker pool, and merges
//! the per-track results. Per-track problems never abort the batch: every
//! track ends in a [`TrackOutcome`], and only batch-fatal conditions
//! (no tracks, empty network, CRS mismatch, bad configuration) are errors.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{NetMatchError, Result};
use crate::matching::{match_edges, ProjectedTrack};
use crate::network::RouteNetwork;
use crate::nodes::resolve_nodes;
use crate::normalize::{normalize_track, Normalized};
use crate::progress::ProgressState;
use crate::projection::Projection;
use crate::{MatchConfig, MatchedEdge, MatchedNode, RawTrack};

const SEQUENTIAL_LABEL: &str = "Processing tracks (sequential)";
const PARALLEL_LABEL: &str = "Processing tracks (parallel)";

// ============================================================================
// Configuration
// ============================================================================

/// Options for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub match_config: MatchConfig,

    /// Minimum batch size before the worker pool is considered; smaller
    /// batches do not repay the pool start-up cost.
    /// Default: 20
    pub parallel_min_files: usize,

    /// Minimum number of execution units for the worker pool.
    /// Default: 2
    pub parallel_min_workers: usize,

    /// Always run sequentially (e.g. memory-constrained hosting).
    /// Default: false
    pub force_sequential: bool,

    /// Execution units to assume instead of detecting them. Also the pool size.
    /// Default: None (detect)
    pub available_units: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            match_config: MatchConfig::default(),
            parallel_min_files: 20,
            parallel_min_workers: 2,
            force_sequential: false,
            available_units: None,
        }
    }
}

impl BatchOptions {
    /// Defaults, adjusted from the process environment.
    ///
    /// - `RENDER=true` or `NETMATCH_FORCE_SEQUENTIAL=1` force sequential runs
    /// - `NETMATCH_PARALLEL_MIN_FILES`, `NETMATCH_WORKERS` override the
    ///   batch-size threshold and the execution unit count
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`BatchOptions::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| {
            lookup(name).is_some_and(|v| {
                matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
            })
        };
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<usize>().ok());

        let mut options = Self::default();
        options.force_sequential = flag("RENDER") || flag("NETMATCH_FORCE_SEQUENTIAL");
        if let Some(n) = number("NETMATCH_PARALLEL_MIN_FILES") {
            options.parallel_min_files = n;
        }
        if let Some(n) = number("NETMATCH_WORKERS") {
            options.available_units = Some(n);
        }
        options
    }

    pub fn validate(&self) -> Result<()> {
        self.match_config.validate()?;
        if self.available_units == Some(0) {
            return Err(NetMatchError::ConfigError {
                message: "available_units must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Execution units used for the mode decision and pool size.
    pub fn execution_units(&self) -> usize {
        self.available_units
            .unwrap_or_else(available_execution_units)
    }
}

/// Logical CPUs available to this process (at least 1).
pub fn available_execution_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Execution Mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Sequential,
    Parallel { workers: usize },
}

/// Decide how to run a batch.
///
/// Parallel only when not forced sequential, at least
/// `parallel_min_workers` units are available and the batch holds at least
/// `parallel_min_files` tracks.
pub fn select_execution_mode(
    track_count: usize,
    available_units: usize,
    options: &BatchOptions,
) -> ExecutionMode {
    let use_parallel = !options.force_sequential
        && available_units >= options.parallel_min_workers.max(2)
        && track_count >= options.parallel_min_files;

    if use_parallel {
        ExecutionMode::Parallel {
            workers: available_units.min(track_count),
        }
    } else {
        ExecutionMode::Sequential
    }
}

// ============================================================================
// Per-track Outcomes
// ============================================================================

/// Why a track was left out of matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// No segment with at least two points
    NoGeometry,
    /// No point carries a timestamp; not a recorded activity
    NoTimestamp,
    /// The first timestamp could not be read
    UnparsableTimestamp,
    /// The batch was cancelled before this track started
    Cancelled,
}

/// How one track ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackOutcome {
    Matched { edges: usize, nodes: usize },
    NoMatch,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackReport {
    pub name: String,
    pub outcome: TrackOutcome,
}

/// Result of a single unit of work.
struct UnitResult {
    report: TrackReport,
    edges: Vec<MatchedEdge>,
    nodes: Vec<MatchedNode>,
}

impl UnitResult {
    fn without_matches(name: &str, outcome: TrackOutcome) -> Self {
        Self {
            report: TrackReport {
                name: name.to_string(),
                outcome,
            },
            edges: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

/// Everything a batch produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub matched_edges: Vec<MatchedEdge>,
    pub matched_nodes: Vec<MatchedNode>,
    /// One report per input track, in input order
    pub reports: Vec<TrackReport>,
    pub mode: ExecutionMode,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl BatchResult {
    pub fn matched_track_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, TrackOutcome::Matched { .. }))
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &TrackReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, TrackOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &TrackReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, TrackOutcome::Failed(_)))
    }
}

// ============================================================================
// Batch Matcher
// ============================================================================

/// Matches batches of tracks against one network.
///
/// The network is shared read-only with every worker.
pub struct BatchMatcher<'a> {
    network: &'a RouteNetwork,
    projection: &'a dyn Projection,
    options: BatchOptions,
}

impl<'a> BatchMatcher<'a> {
    pub fn new(
        network: &'a RouteNetwork,
        projection: &'a dyn Projection,
        options: BatchOptions,
    ) -> Self {
        Self {
            network,
            projection,
            options,
        }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Check everything that would make the whole batch meaningless.
    fn check_preconditions(&self, track_count: usize) -> Result<()> {
        self.options.validate()?;
        if track_count == 0 {
            return Err(NetMatchError::EmptyBatch);
        }
        if self.network.edge_count() == 0 {
            return Err(NetMatchError::EmptyNetwork);
        }
        if self.network.epsg() != self.projection.epsg() {
            return Err(NetMatchError::ProjectionMismatch {
                expected: self.projection.epsg(),
                found: self.network.epsg(),
            });
        }
        Ok(())
    }

    /// Match every track, publishing progress to `progress`.
    pub fn run(&self, tracks: &[RawTrack], progress: &ProgressState) -> Result<BatchResult> {
        if let Err(e) = self.check_preconditions(tracks.len()) {
            // A rejected batch consumes the cancel request meant for it
            progress.clear_cancel();
            return Err(e);
        }

        let mode = effective_mode(select_execution_mode(
            tracks.len(),
            self.options.execution_units(),
            &self.options,
        ));
        info!(
            "[Batch] Matching {} tracks against {} edges ({:?})",
            tracks.len(),
            self.network.edge_count(),
            mode
        );

        let start = Instant::now();
        progress.begin(
            u32::try_from(tracks.len()).unwrap_or(u32::MAX),
            "Processing tracks",
        );

        let units = match mode {
            ExecutionMode::Sequential => Ok(self.run_sequential(tracks, progress)),
            ExecutionMode::Parallel { workers } => self.run_parallel(tracks, workers, progress),
        };
        let units = match units {
            Ok(units) => units,
            Err(e) => {
                progress.finish("Failed", "Failed");
                return Err(e);
            }
        };

        let mut result = BatchResult {
            matched_edges: Vec::new(),
            matched_nodes: Vec::new(),
            reports: Vec::with_capacity(units.len()),
            mode,
            elapsed: Duration::ZERO,
            cancelled: false,
        };
        for unit in units {
            result.matched_edges.extend(unit.edges);
            result.matched_nodes.extend(unit.nodes);
            result.reports.push(unit.report);
        }
        result.elapsed = start.elapsed();
        result.cancelled = progress.finish("Done", "Cancelled");

        info!(
            "[Batch] {} of {} tracks matched ({} edge, {} node matches), {} skipped, {} failed in {:?}",
            result.matched_track_count(),
            tracks.len(),
            result.matched_edges.len(),
            result.matched_nodes.len(),
            result.skipped().count(),
            result.failed().count(),
            result.elapsed
        );

        Ok(result)
    }

    fn run_sequential(&self, tracks: &[RawTrack], progress: &ProgressState) -> Vec<UnitResult> {
        tracks
            .iter()
            .map(|raw| {
                let unit = self.run_unit(raw, progress);
                progress.complete_one(SEQUENTIAL_LABEL);
                unit
            })
            .collect()
    }

    /// Fixed-size pool; progress is recorded in completion order.
    #[cfg(feature = "parallel")]
    fn run_parallel(
        &self,
        tracks: &[RawTrack],
        workers: usize,
        progress: &ProgressState,
    ) -> Result<Vec<UnitResult>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("netmatch-worker-{}", i))
            .build()
            .map_err(|e| NetMatchError::WorkerPool {
                message: e.to_string(),
            })?;

        Ok(pool.install(|| {
            tracks
                .par_iter()
                .map(|raw| {
                    let unit = self.run_unit(raw, progress);
                    progress.complete_one(PARALLEL_LABEL);
                    unit
                })
                .collect()
        }))
    }

    #[cfg(not(feature = "parallel"))]
    fn run_parallel(
        &self,
        tracks: &[RawTrack],
        _workers: usize,
        progress: &ProgressState,
    ) -> Result<Vec<UnitResult>> {
        Ok(self.run_sequential(tracks, progress))
    }

    /// One unit of work, isolated so a panic only fails this track.
    fn run_unit(&self, raw: &RawTrack, progress: &ProgressState) -> UnitResult {
        if progress.is_cancelled() {
            return UnitResult::without_matches(
                &raw.name,
                TrackOutcome::Skipped(SkipReason::Cancelled),
            );
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.process_track(raw))) {
            Ok(unit) => unit,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("[Batch] {}: processing panicked: {}", raw.name, message);
                UnitResult::without_matches(&raw.name, TrackOutcome::Failed(message))
            }
        }
    }

    fn process_track(&self, raw: &RawTrack) -> UnitResult {
        let config = &self.options.match_config;

        let track = match normalize_track(raw) {
            Ok(Normalized::Usable(track)) => track,
            Ok(Normalized::Unusable(reason)) => {
                return UnitResult::without_matches(&raw.name, TrackOutcome::Skipped(reason));
            }
            Err(e) => {
                warn!("[Batch] {}: {}", raw.name, e);
                return UnitResult::without_matches(&raw.name, TrackOutcome::Failed(e.to_string()));
            }
        };

        let projected = match ProjectedTrack::new(&track, self.projection, config.buffer_distance) {
            Ok(Some(projected)) => projected,
            Ok(None) => return UnitResult::without_matches(&raw.name, TrackOutcome::NoMatch),
            Err(e) => {
                warn!("[Batch] {}: {}", raw.name, e);
                return UnitResult::without_matches(&raw.name, TrackOutcome::Failed(e.to_string()));
            }
        };

        let edges = match_edges(&projected, self.network, config);
        if edges.is_empty() {
            return UnitResult::without_matches(&raw.name, TrackOutcome::NoMatch);
        }
        let nodes = resolve_nodes(&projected, &edges, self.network);

        UnitResult {
            report: TrackReport {
                name: raw.name.clone(),
                outcome: TrackOutcome::Matched {
                    edges: edges.len(),
                    nodes: nodes.len(),
                },
            },
            edges,
            nodes,
        }
    }
}

/// Match a batch of raw tracks against `network`.
///
/// Synchronous for the caller; `progress` can be polled from another
/// thread while this runs.
pub fn match_batch(
    tracks: &[RawTrack],
    network: &RouteNetwork,
    projection: &dyn Projection,
    options: &BatchOptions,
    progress: &ProgressState,
) -> Result<BatchResult> {
    BatchMatcher::new(network, projection, options.clone()).run(tracks, progress)
}

#[cfg(feature = "parallel")]
fn effective_mode(mode: ExecutionMode) -> ExecutionMode {
    mode
}

#[cfg(not(feature = "parallel"))]
fn effective_mode(mode: ExecutionMode) -> ExecutionMode {
    if let ExecutionMode::Parallel { workers } = mode {
        info!(
            "[Batch] {} workers available, but built without the parallel feature; running sequentially",
            workers
        );
    }
    ExecutionMode::Sequential
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
