use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gain::{to_db, ChannelReadings};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result file i/o: {0}")]
    Io(#[from] io::Error),
    #[error("result file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// dB values may be -inf, which JSON can't hold; they are written as null.
mod db_field {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_some(v)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NEG_INFINITY))
    }
}

/// One measured frequency. Channel 1 is the DUT input, channel 2 its output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GainPoint {
    pub frequency: f64,
    pub ch1_pk2pk: f64,
    pub ch1_amplitude: f64,
    pub ch2_pk2pk: f64,
    pub ch2_amplitude: f64,
    pub gain_pk2pk: f64,
    pub gain_amplitude: f64,
    pub gain_real: f64,
    #[serde(with = "db_field")]
    pub gain_pk2pk_db: f64,
    #[serde(with = "db_field")]
    pub gain_amplitude_db: f64,
    #[serde(with = "db_field")]
    pub gain_real_db: f64,
    pub timestamp: DateTime<Local>,
}

impl GainPoint {
    pub fn new(frequency: f64, readings: &ChannelReadings) -> Self {
        let gains = readings.gains();
        Self {
            frequency,
            ch1_pk2pk: readings.input_pk2pk,
            ch1_amplitude: readings.input_amplitude,
            ch2_pk2pk: readings.output_pk2pk,
            ch2_amplitude: readings.output_amplitude,
            gain_pk2pk: gains.pk2pk,
            gain_amplitude: gains.amplitude,
            gain_real: gains.real,
            gain_pk2pk_db: to_db(gains.pk2pk),
            gain_amplitude_db: to_db(gains.amplitude),
            gain_real_db: to_db(gains.real),
            timestamp: Local::now(),
        }
    }
}

/// All points measured so far, at most one per frequency.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GainDataset {
    pub measurements: Vec<GainPoint>,
    pub last_modified: DateTime<Local>,
}

impl Default for GainDataset {
    fn default() -> Self {
        Self {
            measurements: Vec::new(),
            last_modified: Local::now(),
        }
    }
}

impl GainDataset {
    /// Replaces the entry for the same frequency, or appends. Returns true
    /// when an older entry was overwritten.
    pub fn upsert(&mut self, point: GainPoint) -> bool {
        match self
            .measurements
            .iter_mut()
            .find(|m| m.frequency == point.frequency)
        {
            Some(slot) => {
                *slot = point;
                true
            }
            None => {
                self.measurements.push(point);
                false
            }
        }
    }

    pub fn get(&self, frequency: f64) -> Option<&GainPoint> {
        self.measurements.iter().find(|m| m.frequency == frequency)
    }

    /// Points ordered by frequency, for tables and export.
    pub fn sorted(&self) -> Vec<&GainPoint> {
        let mut points: Vec<&GainPoint> = self.measurements.iter().collect();
        points.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
        points
    }
}

/// JSON-file-backed result set.
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<GainDataset, StoreError> {
        if !self.path.exists() {
            return Ok(GainDataset::default());
        }
        let file = File::open(&self.path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn save(&self, dataset: &mut GainDataset) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        dataset.last_modified = Local::now();
        let mut w = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(&mut w, dataset)?;
        w.flush()?;
        Ok(())
    }

    pub fn upsert(&self, point: GainPoint) -> Result<(), StoreError> {
        let mut dataset = self.load()?;
        let frequency = point.frequency;
        if dataset.upsert(point) {
            debug!("overwrote earlier result at {frequency} Hz");
        }
        self.save(&mut dataset)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.save(&mut GainDataset::default())
    }

    /// Writes the result table as CSV, ordered by frequency.
    pub fn export_csv(&self, path: &Path) -> Result<usize, StoreError> {
        let dataset = self.load()?;
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(
            w,
            "frequency,ch1_pk2pk,ch1_amplitude,ch2_pk2pk,ch2_amplitude,gain_pk2pk,gain_amplitude,gain_real,gain_pk2pk_db,gain_amplitude_db,gain_real_db,timestamp"
        )?;
        let points = dataset.sorted();
        for p in &points {
            writeln!(
                w,
                "{},{},{},{},{},{},{},{},{:.4},{:.4},{:.4},{}",
                p.frequency,
                p.ch1_pk2pk,
                p.ch1_amplitude,
                p.ch2_pk2pk,
                p.ch2_amplitude,
                p.gain_pk2pk,
                p.gain_amplitude,
                p.gain_real,
                p.gain_pk2pk_db,
                p.gain_amplitude_db,
                p.gain_real_db,
                p.timestamp.format("%Y-%m-%d %H:%M:%S"),
            )?;
        }
        w.flush()?;
        info!("exported {} points to {}", points.len(), path.display());
        Ok(points.len())
    }
}
