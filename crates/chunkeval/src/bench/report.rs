//! Timing records and human-readable reports.

use super::runner::RunSpec;
use crate::codec::Compression;
use std::fmt;
use std::time::{Duration, Instant};

/// Bytes per megabyte in reports.
pub const MB: f64 = 1024.0 * 1024.0;

/// Phase of one configuration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Writing the input values.
    Populate,
    /// Evaluating the expression into the result.
    Compute,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Populate => "populating",
            Phase::Compute => "computing",
        })
    }
}

/// Wall time spent in one phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingRecord {
    /// The phase measured.
    pub phase: Phase,
    /// Elapsed wall time.
    pub elapsed: Duration,
}

impl TimingRecord {
    /// Runs `f` and records how long it took, whether or not it succeeded.
    pub fn measure<T>(phase: Phase, f: impl FnOnce() -> T) -> (T, Self) {
        let start = Instant::now();
        let value = f();
        (
            value,
            Self {
                phase,
                elapsed: start.elapsed(),
            },
        )
    }

    /// Elapsed seconds.
    pub fn secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Result of one configuration.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The configuration that ran.
    pub spec: RunSpec,
    /// Expression text.
    pub expr: String,
    /// Number of elements.
    pub n: usize,
    /// One record per phase, in execution order.
    pub timings: Vec<TimingRecord>,
    /// Bytes consumed by the configuration's storage after compute.
    pub size_bytes: u64,
    /// First and last result values read back after compute.
    pub endpoints: Option<(f64, f64)>,
}

impl RunReport {
    /// Timing of `phase`, if it ran.
    pub fn timing(&self, phase: Phase) -> Option<&TimingRecord> {
        self.timings.iter().find(|t| t.phase == phase)
    }

    /// Compression used by the configuration, if any.
    pub fn compression(&self) -> Option<Compression> {
        self.spec.compression
    }

    /// Size in megabytes.
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / MB
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for timing in &self.timings {
            match timing.phase {
                Phase::Populate => {
                    writeln!(f, "Populating x using {} with {} points...", self.spec, self.n)?;
                    writeln!(f, "*** Time elapsed populating: {:.3}", timing.secs())?;
                }
                Phase::Compute => {
                    writeln!(f, "Computing: '{}' using {}", self.expr, self.spec)?;
                    writeln!(
                        f,
                        "**************** Time elapsed computing: {:.3}",
                        timing.secs()
                    )?;
                }
            }
        }

        let what = if self.spec.storage.is_file_backed() {
            "file"
        } else {
            "dataset"
        };
        write!(
            f,
            "\t\tTotal {} sizes: {} -- ({:.1} MB)",
            what,
            self.size_bytes,
            self.size_mb()
        )?;
        match self.compression() {
            Some(c) if !c.is_none() => writeln!(f, " (using {} lvl{})", c.codec(), c.level()),
            _ => writeln!(f),
        }
    }
}

/// Results of a whole sweep, in run order.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Number of elements per dataset.
    pub n: usize,
    /// Completed runs.
    pub runs: Vec<RunReport>,
}

impl SweepReport {
    /// Creates an empty report for datasets of `n` elements.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            runs: Vec::new(),
        }
    }

    /// Combined size of the input and result datasets in megabytes.
    pub fn total_dataset_mb(&self) -> f64 {
        (2 * self.n * std::mem::size_of::<f64>()) as f64 / MB
    }

    /// First run that used `compression`.
    pub fn find(&self, compression: Compression) -> Option<&RunReport> {
        self.runs
            .iter()
            .find(|r| r.spec.compression == Some(compression))
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total size for datasets: {:.1} MB", self.total_dataset_mb())?;
        for run in &self.runs {
            write!(f, "{run}")?;
        }
        Ok(())
    }
}
