//! Job scheduling: sources → normaliser → octree → exporter.
//!
//! Jobs run on a dedicated rayon pool. Inside a job the same pool is reused
//! for concurrent loading, parallel reprojection, sibling subtree builds and
//! payload writes.

use crate::cancel::CancellationToken;
use crate::error::{Result, TilerError};
use crate::events::{EventKind, EventSink, TilerEvent};
use crate::export::{ExportSummary, TileExporter};
use crate::geom::{Baseline, RawPoint};
use crate::normalize::Normalizer;
use crate::octree::{BuildParams, Octree};
use crate::options::{validate_srid, TilerOptions};
use crate::reproject::{Reprojector, Wgs84Reprojector};
use crate::source::SourceProvider;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation is polled this often while streaming points.
pub const CANCEL_CHECK_INTERVAL: usize = 65_536;

/// Upper bound on the up-front allocation trusted from a header's point count.
const MAX_PREALLOC_POINTS: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    ReadingHeader,
    LoadingPoints,
    Building,
    Exporting,
    Done,
    Error,
}

impl JobState {
    /// `(started, completed, error)` events of a working state.
    fn events(self) -> Option<(EventKind, EventKind, EventKind)> {
        use EventKind::*;
        match self {
            JobState::ReadingHeader => Some((ReadLasHeaderStarted, ReadLasHeaderCompleted, ReadLasHeaderError)),
            JobState::LoadingPoints => Some((PointLoadingStarted, PointLoadingCompleted, PointLoadingError)),
            JobState::Building => Some((BuildStarted, BuildCompleted, BuildError)),
            JobState::Exporting => Some((ExportStarted, ExportCompleted, ExportError)),
            JobState::Done | JobState::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::ReadingHeader => "reading header",
            JobState::LoadingPoints => "loading points",
            JobState::Building => "building",
            JobState::Exporting => "exporting",
            JobState::Done => "done",
            JobState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One tiling unit: every input is merged into a single tree in `out_dir`.
#[derive(Debug, Clone)]
pub struct TilingJob {
    pub name: String,
    pub inputs: Vec<Arc<dyn SourceProvider>>,
    pub out_dir: PathBuf,
    pub srid: u32,
}

impl TilingJob {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<Arc<dyn SourceProvider>>,
        out_dir: impl Into<PathBuf>,
        srid: u32,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            out_dir: out_dir.into(),
            srid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobStats {
    pub points: usize,
    pub nodes: usize,
    pub depth: u32,
    pub baseline: Baseline,
    pub export: ExportSummary,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct JobReport {
    pub name: String,
    pub out_dir: PathBuf,
    /// `Done` or `Error`.
    pub state: JobState,
    /// The working state the job was in when it stopped, for failed jobs.
    pub failed_in: Option<JobState>,
    pub outcome: Result<JobStats>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.succeeded()
    }

    /// Stats of every job, or the first error. A cancelled run reports
    /// `Cancelled` ahead of any other failure.
    pub fn into_result(self) -> Result<Vec<JobStats>> {
        if self
            .jobs
            .iter()
            .any(|j| matches!(&j.outcome, Err(e) if e.is_cancelled()))
        {
            return Err(TilerError::Cancelled);
        }
        self.jobs.into_iter().map(|j| j.outcome).collect()
    }
}

/// Declared header data of one input.
struct HeaderInfo {
    name: String,
    count: u64,
    srid: Option<u32>,
}

fn emit(sink: &dyn EventSink, kind: EventKind, subject: &str, started: Instant, message: String) {
    sink.on_event(&TilerEvent {
        kind,
        subject: subject.to_owned(),
        elapsed: started.elapsed(),
        message,
    });
}

/// The tiling engine. Holds validated options and the reprojection backend.
pub struct Tiler {
    options: TilerOptions,
    reprojector: Arc<dyn Reprojector>,
}

impl Tiler {
    pub fn new(options: TilerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            reprojector: Arc::new(Wgs84Reprojector::default()),
        })
    }

    pub fn with_reprojector(mut self, reprojector: Arc<dyn Reprojector>) -> Self {
        self.reprojector = reprojector;
        self
    }

    pub fn options(&self) -> &TilerOptions {
        &self.options
    }

    /// Join mode: every input feeds one tree written directly into `out_dir`.
    pub fn process_files(
        &self,
        inputs: Vec<Arc<dyn SourceProvider>>,
        out_dir: &Path,
        srid: u32,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<RunReport> {
        let name = match inputs.as_slice() {
            [] => "empty".to_owned(),
            [single] => single.name(),
            [first, rest @ ..] => format!("{} +{}", first.name(), rest.len()),
        };
        self.run(vec![TilingJob::new(name, inputs, out_dir, srid)], cancel, sink)
    }

    /// Independent mode: one job per input, each in `out_dir/<stem>`.
    pub fn process_each(
        &self,
        inputs: Vec<Arc<dyn SourceProvider>>,
        out_dir: &Path,
        srid: u32,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<RunReport> {
        let jobs = inputs
            .into_iter()
            .map(|input| {
                let name = input.name();
                let dir = out_dir.join(input.stem());
                TilingJob::new(name, vec![input], dir, srid)
            })
            .collect();
        self.run(jobs, cancel, sink)
    }

    /// Run `jobs` with at most `num_workers` threads. Per-job failures end up
    /// in the report; only setup problems fail the call itself.
    ///
    /// Two jobs may not share an output directory.
    pub fn run(
        &self,
        jobs: Vec<TilingJob>,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<RunReport> {
        let mut claimed: HashMap<&Path, &str> = HashMap::with_capacity(jobs.len());
        for job in &jobs {
            validate_srid(job.srid)?;
            if let Some(other) = claimed.insert(&job.out_dir, &job.name) {
                return Err(TilerError::InvalidOptions(format!(
                    "'{}' and '{}' would both write to '{}'",
                    other,
                    job.name,
                    job.out_dir.display()
                )));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.num_workers)
            .thread_name(|i| format!("tiler-worker-{i}"))
            .build()
            .map_err(|e| TilerError::WorkerPool(e.to_string()))?;

        log::info!(
            "running {} job(s) on {} worker(s)",
            jobs.len(),
            self.options.num_workers
        );

        let reports = pool.install(|| {
            jobs.par_iter()
                .map(|job| self.run_job(job, cancel, sink))
                .collect::<Vec<_>>()
        });

        Ok(RunReport { jobs: reports })
    }

    fn run_job(&self, job: &TilingJob, cancel: &CancellationToken, sink: &dyn EventSink) -> JobReport {
        let started = Instant::now();
        let mut state = JobState::ReadingHeader;
        let outcome = self.execute(job, cancel, sink, &mut state).map(|mut stats| {
            stats.elapsed = started.elapsed();
            stats
        });

        let failed_in = match &outcome {
            Ok(stats) => {
                log::info!(
                    "[{}] done: {} points in {} nodes ({:.2}s)",
                    job.name,
                    stats.points,
                    stats.nodes,
                    stats.elapsed.as_secs_f64()
                );
                None
            }
            Err(e) if e.is_cancelled() => {
                log::warn!("[{}] cancelled while {state}", job.name);
                Some(state)
            }
            Err(e) => {
                log::error!("[{}] failed while {state}: {e}", job.name);
                Some(state)
            }
        };

        JobReport {
            name: job.name.clone(),
            out_dir: job.out_dir.clone(),
            state: if outcome.is_ok() { JobState::Done } else { JobState::Error },
            failed_in,
            outcome,
        }
    }

    /// Run `f` as the `state` stage of `job`, bracketing it with events.
    fn stage<T>(
        &self,
        job: &TilingJob,
        sink: &dyn EventSink,
        state: JobState,
        f: impl FnOnce() -> Result<(T, String)>,
    ) -> Result<T> {
        let events = state.events();
        let started = Instant::now();
        if let Some((kind, _, _)) = events {
            emit(sink, kind, &job.name, started, format!("{state} started"));
        }

        match f() {
            Ok((value, message)) => {
                if let Some((_, kind, _)) = events {
                    emit(sink, kind, &job.name, started, message);
                }
                Ok(value)
            }
            Err(e) => {
                if let Some((_, _, kind)) = events {
                    emit(sink, kind, &job.name, started, e.to_string());
                }
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        job: &TilingJob,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
        state: &mut JobState,
    ) -> Result<JobStats> {
        cancel.check()?;

        *state = JobState::ReadingHeader;
        let headers = self.stage(job, sink, *state, || {
            let headers = read_headers(job)?;
            let declared: u64 = headers.iter().map(|h| h.count).sum();
            let message = format!("{} input(s), {declared} points declared", headers.len());
            Ok((headers, message))
        })?;

        cancel.check()?;
        *state = JobState::LoadingPoints;
        let cloud = self.stage(job, sink, *state, || {
            let raw = load_points(job, &headers, cancel)?;
            let cloud = Normalizer::new(self.reprojector.as_ref(), &self.options)
                .normalize(&raw, job.srid, cancel)?;
            let b = cloud.baseline.0;
            let message = format!(
                "loaded {} points, baseline ({:.3}, {:.3}, {:.3})",
                cloud.points.len(),
                b.x,
                b.y,
                b.z
            );
            Ok((cloud, message))
        })?;

        let baseline = cloud.baseline;
        let points = cloud.points.len();

        *state = JobState::Building;
        let tree = self.stage(job, sink, *state, || {
            let tree = Octree::build(cloud.points, BuildParams::from(&self.options), cancel)?;
            let message = format!("built {} nodes, depth {}", tree.node_count(), tree.depth());
            Ok((tree, message))
        })?;

        *state = JobState::Exporting;
        let export = self.stage(job, sink, *state, || {
            let summary = TileExporter::new(&job.out_dir, baseline, cancel).export(&tree)?;
            let message = format!(
                "wrote {} payload(s), {} bytes to {}",
                summary.payloads,
                summary.bytes,
                job.out_dir.display()
            );
            Ok((summary, message))
        })?;

        *state = JobState::Done;
        Ok(JobStats {
            points,
            nodes: tree.node_count(),
            depth: tree.depth(),
            baseline,
            export,
            elapsed: Duration::ZERO,
        })
    }
}

/// Open every input once for its header; check the declared reference systems.
fn read_headers(job: &TilingJob) -> Result<Vec<HeaderInfo>> {
    let headers = job
        .inputs
        .par_iter()
        .map(|input| {
            let source = input.open()?;
            Ok(HeaderInfo {
                name: input.name(),
                count: source.count(),
                srid: source.srid(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let declared: BTreeSet<u32> = headers.iter().filter_map(|h| h.srid).collect();
    if declared.len() > 1 {
        return Err(TilerError::read(
            &job.name,
            format!("joined inputs declare different reference systems: {declared:?}"),
        ));
    }
    for header in &headers {
        match header.srid {
            Some(srid) if srid != job.srid => log::warn!(
                "{} declares EPSG:{srid}, reprojecting from EPSG:{} as configured",
                header.name,
                job.srid
            ),
            None => log::debug!("{} declares no reference system", header.name),
            _ => {}
        }
    }

    Ok(headers)
}

/// Stream every input concurrently; the result keeps input order.
fn load_points(
    job: &TilingJob,
    headers: &[HeaderInfo],
    cancel: &CancellationToken,
) -> Result<Vec<RawPoint>> {
    let per_input = job
        .inputs
        .par_iter()
        .zip(headers.par_iter())
        .map(|(input, header)| {
            cancel.check()?;
            let mut source = input.open()?;
            let mut points = Vec::with_capacity(header.count.min(MAX_PREALLOC_POINTS) as usize);
            while let Some(point) = source.next_point()? {
                points.push(point);
                if points.len() % CANCEL_CHECK_INTERVAL == 0 {
                    cancel.check()?;
                }
            }
            if points.len() as u64 != header.count {
                log::warn!(
                    "{}: header declares {} points, read {}",
                    header.name,
                    header.count,
                    points.len()
                );
            }
            Ok(points)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(per_input.concat())
}
