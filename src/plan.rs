// src/plan.rs
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plan used when no plan file exists yet: 30 log-spaced points, 10 Hz .. 1 MHz.
pub const DEFAULT_MIN_HZ: f64 = 10.0;
pub const DEFAULT_MAX_HZ: f64 = 1_000_000.0;
pub const DEFAULT_POINTS: usize = 30;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("frequency range {min} Hz .. {max} Hz is invalid (need 0 < min < max)")]
    InvalidRange { min: f64, max: f64 },
    #[error("a plan needs at least one point")]
    NoPoints,
    #[error("frequency {0} is not a positive finite number")]
    InvalidFrequency(f64),
    #[error("line {line}: {message}")]
    Csv { line: usize, message: String },
    #[error("plan file i/o: {0}")]
    Io(#[from] io::Error),
    #[error("plan file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Spacing {
    #[default]
    Logarithmic,
    Linear,
}

/// Ordered list of sweep frequencies in Hz. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrequencyPlan {
    frequencies: Vec<f64>,
}

#[derive(Deserialize)]
struct PlanFile {
    frequencies: Vec<f64>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Smallest two-decimal value not below `x`.
fn ceil2(x: f64) -> f64 {
    let n = (x * 100.0).round();
    if n / 100.0 < x {
        (n + 1.0) / 100.0
    } else {
        n / 100.0
    }
}

/// Largest two-decimal value not above `x`.
fn floor2(x: f64) -> f64 {
    let n = (x * 100.0).round();
    if n / 100.0 > x {
        (n - 1.0) / 100.0
    } else {
        n / 100.0
    }
}

impl FrequencyPlan {
    /// Spaces `count` points between `min` and `max`. The endpoints are
    /// pulled inward onto the 0.01 Hz grid, so every point lies within the
    /// requested range. Points that collapse onto their neighbour after
    /// rounding are dropped, so the result is strictly increasing.
    pub fn generate(min: f64, max: f64, count: usize, spacing: Spacing) -> Result<Self, PlanError> {
        if !(min.is_finite() && max.is_finite() && min > 0.0 && min < max) {
            return Err(PlanError::InvalidRange { min, max });
        }
        let (lo, hi) = (ceil2(min), floor2(max));
        // no grid value between the two
        if lo > hi {
            return Err(PlanError::InvalidRange { min, max });
        }
        if count == 0 {
            return Err(PlanError::NoPoints);
        }
        let point = |i: usize| -> f64 {
            if count == 1 || lo == hi {
                return lo;
            }
            let t = i as f64 / (count - 1) as f64;
            match spacing {
                Spacing::Linear => lo + (hi - lo) * t,
                Spacing::Logarithmic => {
                    let (a, b) = (lo.log10(), hi.log10());
                    10f64.powf(a + (b - a) * t)
                }
            }
        };
        let mut frequencies: Vec<f64> = Vec::with_capacity(count);
        for i in 0..count {
            let f = round2(point(i)).clamp(lo, hi);
            if frequencies.last().map_or(true, |&last| f > last) {
                frequencies.push(f);
            }
        }
        Ok(Self { frequencies })
    }

    /// Takes a list as given (e.g. imported), keeping its order.
    pub fn from_frequencies(frequencies: Vec<f64>) -> Result<Self, PlanError> {
        if let Some(&bad) = frequencies.iter().find(|f| !(f.is_finite() && **f > 0.0)) {
            return Err(PlanError::InvalidFrequency(bad));
        }
        Ok(Self { frequencies })
    }

    pub fn default_plan() -> Self {
        Self::generate(DEFAULT_MIN_HZ, DEFAULT_MAX_HZ, DEFAULT_POINTS, Spacing::Logarithmic)
            .unwrap_or(Self { frequencies: vec![DEFAULT_MIN_HZ] })
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Reads `{"frequencies": [...]}`. A missing file is replaced by the
    /// default plan, which is written back.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        if !path.exists() {
            let plan = Self::default_plan();
            info!("no plan at {}, writing the default {} points", path.display(), plan.len());
            if let Err(e) = plan.save(path) {
                warn!("could not write default plan: {e}");
            }
            return Ok(plan);
        }
        let file: PlanFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        Self::from_frequencies(file.frequencies)
    }

    pub fn save(&self, path: &Path) -> Result<(), PlanError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.flush()?;
        Ok(())
    }

    pub fn export_csv(&self, path: &Path) -> Result<(), PlanError> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "frequency")?;
        for f in &self.frequencies {
            writeln!(w, "{f}")?;
        }
        w.flush()?;
        Ok(())
    }

    /// Reads a CSV whose header has a `frequency` column.
    pub fn import_csv(path: &Path) -> Result<Self, PlanError> {
        let reader = BufReader::new(File::open(path)?);
        let mut column = None;
        let mut frequencies = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let Some(col) = column else {
                column = Some(
                    fields
                        .iter()
                        .position(|h| h.eq_ignore_ascii_case("frequency"))
                        .ok_or_else(|| PlanError::Csv {
                            line: line_no,
                            message: "header has no `frequency` column".into(),
                        })?,
                );
                continue;
            };
            let raw = fields.get(col).copied().unwrap_or_default();
            let f = raw.parse::<f64>().map_err(|_| PlanError::Csv {
                line: line_no,
                message: format!("`{raw}` is not a number"),
            })?;
            frequencies.push(f);
        }
        Self::from_frequencies(frequencies)
    }
}
