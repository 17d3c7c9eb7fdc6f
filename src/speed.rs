//!
//! # Tracing path timing
//!
//! Times the three tracing paths over a schedule of growing ray counts. Every
//! `(path, ray count)` pair is traced `runs` times and summarized by the mean
//! of the `keep` fastest runs, which damps the scheduling noise of a busy
//! server without averaging it in.
//!
//! The bulk paths move all rays per exchange and amortize the round trip, so
//! they are timed with the full best-of-n treatment. The per ray path pays
//! one round trip per ray and is far too slow to repeat: it runs once per ray
//! count unless asked otherwise.
//!
//! A [`SpeedTestBuilder`] can be persisted to toml and reloaded, which keeps
//! the schedule of a timing campaign alongside its results.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    BatchError, Builder, Link, LinkError, PupilGrid, RayBatch, TracePath, Transport,
};

#[derive(Debug, thiserror::Error)]
pub enum SpeedError {
    #[error("cannot average an empty set of samples")]
    NoSamples,
    #[error("the ray count schedule is empty")]
    NoSchedule,
    #[error("cannot keep {keep} of {runs} runs")]
    Keep { keep: usize, runs: usize },
    #[error("cannot drive the server")]
    Link(#[from] LinkError),
    #[error("{path} failed on ray {ray} with error {code}")]
    TraceFailed {
        path: TracePath,
        ray: usize,
        code: i32,
    },
    #[error("{path} failed")]
    Batch {
        path: TracePath,
        #[source]
        source: BatchError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SpeedTestBuilderError {
    #[error("cannot open `::zdde::SpeedTestBuilder` toml file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot create `::zdde::SpeedTestBuilder` toml file: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot read `::zdde::SpeedTestBuilder` toml file: {1}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("cannot write `::zdde::SpeedTestBuilder` toml file: {1}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("cannot deserialize `::zdde::SpeedTestBuilder` from toml")]
    Load(#[from] toml::de::Error),
    #[error("cannot serialize `::zdde::SpeedTestBuilder` into toml")]
    Save(#[from] toml::ser::Error),
}

/// Mean of the `keep` fastest samples
pub fn best_of_n_average(samples: &[Duration], keep: usize) -> Result<Duration, SpeedError> {
    if samples.is_empty() {
        return Err(SpeedError::NoSamples);
    }
    let keep = keep.clamp(1, samples.len());
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    Ok(sorted[..keep].iter().sum::<Duration>() / keep as u32)
}

/// [`SpeedTest`] builder
///
/// Default properties:
///  * ray counts   : (3 + 10k)^2 for k in 0..=10, i.e. 9 to 10609 rays
///  * runs         : 50, keeping the 20 fastest
///  * per ray runs : 1, keeping 1
///  * wavelength   : 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedTestBuilder {
    ray_counts: Vec<usize>,
    runs: usize,
    keep: usize,
    per_ray_runs: usize,
    per_ray_keep: usize,
    wave: i32,
}
impl Default for SpeedTestBuilder {
    fn default() -> Self {
        Self {
            ray_counts: (0..=10).map(|k| (3 + 10 * k as usize).pow(2)).collect(),
            runs: 50,
            keep: 20,
            per_ray_runs: 1,
            per_ray_keep: 1,
            wave: 1,
        }
    }
}
impl SpeedTestBuilder {
    /// Load the speed test builder from a toml
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, SpeedTestBuilderError> {
        let mut file = File::open(&path)
            .map_err(|e| SpeedTestBuilderError::Open(e, path.as_ref().to_path_buf()))?;
        let mut toml = String::new();
        file.read_to_string(&mut toml)
            .map_err(|e| SpeedTestBuilderError::Read(e, path.as_ref().to_path_buf()))?;
        let builder: SpeedTestBuilder = toml::from_str(&toml)?;
        Ok(builder)
    }
    /// Save the speed test builder to a toml
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), SpeedTestBuilderError> {
        let toml = toml::to_string_pretty(self)?;
        let mut file = File::create(&path)
            .map_err(|e| SpeedTestBuilderError::Create(e, path.as_ref().to_path_buf()))?;
        write!(file, "# ::zdde::SpeedTestBuilder\n\n{}", toml)
            .map_err(|e| SpeedTestBuilderError::Write(e, path.as_ref().to_path_buf()))?;
        Ok(())
    }
    /// Sets the schedule of ray counts
    pub fn ray_counts(self, ray_counts: Vec<usize>) -> Self {
        Self { ray_counts, ..self }
    }
    /// Sets the number of runs of the bulk paths per ray count
    pub fn runs(self, runs: usize) -> Self {
        Self { runs, ..self }
    }
    /// Sets how many of the fastest runs enter the average
    pub fn keep(self, keep: usize) -> Self {
        Self { keep, ..self }
    }
    /// Sets the number of runs of the per ray path
    pub fn per_ray_runs(self, per_ray_runs: usize) -> Self {
        Self {
            per_ray_runs,
            ..self
        }
    }
    pub fn per_ray_keep(self, per_ray_keep: usize) -> Self {
        Self {
            per_ray_keep,
            ..self
        }
    }
    /// Sets the wavelength number the rays are traced at
    pub fn wave(self, wave: i32) -> Self {
        Self { wave, ..self }
    }
}
impl Builder for SpeedTestBuilder {
    type Component = SpeedTest;

    fn build(self) -> crate::Result<Self::Component> {
        if self.ray_counts.is_empty() {
            return Err(SpeedError::NoSchedule.into());
        }
        for (runs, keep) in [(self.runs, self.keep), (self.per_ray_runs, self.per_ray_keep)] {
            if keep < 1 || keep > runs {
                return Err(SpeedError::Keep { keep, runs }.into());
            }
        }
        Ok(SpeedTest {
            ray_counts: self.ray_counts,
            runs: self.runs,
            keep: self.keep,
            per_ray_runs: self.per_ray_runs,
            per_ray_keep: self.per_ray_keep,
            wave: self.wave,
        })
    }
}

/// One timed entry of the speed report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedRow {
    pub path: TracePath,
    pub rays: usize,
    pub runs: usize,
    pub keep: usize,
    /// Mean wall clock time of the kept runs in milliseconds
    pub millis: f64,
}

/// Timing of the three tracing paths over the ray count schedule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedReport {
    pub rows: Vec<SpeedRow>,
}
impl SpeedReport {
    /// The time of one `(path, ray count)` entry in milliseconds
    pub fn millis(&self, path: TracePath, rays: usize) -> Option<f64> {
        self.rows
            .iter()
            .find(|row| row.path == path && row.rays == rays)
            .map(|row| row.millis)
    }
    fn ray_counts(&self) -> Vec<usize> {
        let mut counts: Vec<_> = self.rows.iter().map(|row| row.rays).collect();
        counts.sort_unstable();
        counts.dedup();
        counts
    }
}
impl fmt::Display for SpeedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>8}", "rays")?;
        for path in TracePath::ALL {
            write!(f, "{:>20}", format!("{} [ms]", path))?;
        }
        writeln!(f)?;
        for rays in self.ray_counts() {
            write!(f, "{:>8}", rays)?;
            for path in TracePath::ALL {
                match self.millis(path, rays) {
                    Some(millis) => write!(f, "{:>20.4}", millis)?,
                    None => write!(f, "{:>20}", "-")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Wall clock comparison of the tracing paths
pub struct SpeedTest {
    ray_counts: Vec<usize>,
    runs: usize,
    keep: usize,
    per_ray_runs: usize,
    per_ray_keep: usize,
    wave: i32,
}
impl SpeedTest {
    pub fn builder() -> SpeedTestBuilder {
        Default::default()
    }
    fn runs_for(&self, path: TracePath) -> (usize, usize) {
        match path {
            TracePath::PerRay => (self.per_ray_runs, self.per_ray_keep),
            TracePath::Records | TracePath::Columns => (self.runs, self.keep),
        }
    }
    /// Runs the whole schedule against a loaded and pushed lens
    pub fn run<T: Transport>(&self, link: &mut Link<T>) -> Result<SpeedReport, SpeedError> {
        let total: usize = TracePath::ALL
            .iter()
            .map(|&path| self.runs_for(path).0 * self.ray_counts.len())
            .sum();
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{msg:<24} [{eta_precise}] {bar:40.cyan/blue} {pos:>6}/{len:6}")
                .unwrap(),
        );
        let mut rows = Vec::with_capacity(TracePath::ALL.len() * self.ray_counts.len());
        for path in TracePath::ALL {
            let (runs, keep) = self.runs_for(path);
            for &count in &self.ray_counts {
                let grid = PupilGrid::with_ray_target(count);
                bar.set_message(format!("{}: {} rays", path, grid.len()));
                let mut samples = Vec::with_capacity(runs);
                for _ in 0..runs {
                    samples.push(self.sample(link, path, &grid)?);
                    bar.inc(1);
                }
                let best = best_of_n_average(&samples, keep)?;
                let millis = best.as_secs_f64() * 1e3;
                log::info!(
                    "{}: {} rays, best {} of {} runs: {:.4} ms",
                    path,
                    grid.len(),
                    keep,
                    runs,
                    millis
                );
                rows.push(SpeedRow {
                    path,
                    rays: grid.len(),
                    runs,
                    keep,
                    millis,
                });
            }
        }
        bar.finish_and_clear();
        Ok(SpeedReport { rows })
    }
    /// Times one traversal of the grid, verification excluded
    fn sample<T: Transport>(
        &self,
        link: &mut Link<T>,
        path: TracePath,
        grid: &PupilGrid,
    ) -> Result<Duration, SpeedError> {
        match path {
            TracePath::PerRay => {
                let start = Instant::now();
                for (ray, (px, py)) in grid.points().enumerate() {
                    let trace = link.trace_pupil(self.wave, px, py)?;
                    if !trace.is_traced() {
                        return Err(SpeedError::TraceFailed {
                            path,
                            ray,
                            code: trace.error,
                        });
                    }
                }
                Ok(start.elapsed())
            }
            TracePath::Records => {
                let start = Instant::now();
                let mut batch = RayBatch::from_grid(grid, self.wave);
                link.array_trace(&mut batch)?;
                let elapsed = start.elapsed();
                batch
                    .ensure_traced()
                    .map_err(|source| SpeedError::Batch { path, source })?;
                Ok(elapsed)
            }
            TracePath::Columns => {
                let start = Instant::now();
                let columns = link.get_trace_array(self.wave, grid)?;
                let elapsed = start.elapsed();
                match columns.error.iter().position(|&code| code != 0) {
                    Some(ray) => Err(SpeedError::TraceFailed {
                        path,
                        ray,
                        code: columns.error[ray],
                    }),
                    None => Ok(elapsed),
                }
            }
        }
    }
}
