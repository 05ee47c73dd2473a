//! A tab-separated diagnostic report of how shared signal was divided between feature groups
use std::io::Write;

use itertools::Itertools;
use serde::Serialize;

use crate::error::QuantError;
use crate::seed::FeatureSeed;
use crate::trace::MassTrace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceType {
    /// A trace used by only one feature group
    Unique = 0,
    /// A shared trace before its signal was divided
    SharedBefore = 1,
    /// A shared trace after its signal was divided
    SharedAfter = 2,
    /// The elution model predicted for a shared trace
    TheoreticalShape = 3,
}

#[derive(Debug, Serialize)]
struct ReportRow {
    #[serde(rename = "FeatureGroupID")]
    feature_group_id: usize,
    #[serde(rename = "TraceType")]
    trace_type: u8,
    #[serde(rename = "Mass")]
    mass: f64,
    #[serde(rename = "Charge")]
    charge: i32,
    #[serde(rename = "IsotopeIndex")]
    isotope_index: i32,
    #[serde(rename = "QuantValue")]
    quant_value: f64,
    #[serde(rename = "CentroidMz")]
    centroid_mz: f64,
    #[serde(rename = "RTs")]
    rts: String,
    #[serde(rename = "MZs")]
    mzs: String,
    #[serde(rename = "Intensities")]
    intensities: String,
}

fn join(values: &[f64]) -> String {
    values.iter().join(",")
}

pub struct SharedSignalReport<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> SharedSignalReport<W> {
    pub fn new(writer: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_writer(writer);
        Self { writer }
    }

    /// Record the observed state of `seed`'s trace
    pub fn write_seed(
        &mut self,
        group_id: usize,
        trace_type: TraceType,
        mass: f64,
        seed: &FeatureSeed,
        trace: &MassTrace,
    ) -> Result<(), QuantError> {
        self.writer.serialize(ReportRow {
            feature_group_id: group_id,
            trace_type: trace_type as u8,
            mass,
            charge: seed.charge,
            isotope_index: seed.isotope_index,
            quant_value: seed.intensity,
            centroid_mz: seed.centroid_mz,
            rts: join(&trace.times()),
            mzs: join(&trace.mzs()),
            intensities: join(&trace.raw_intensities()),
        })?;
        Ok(())
    }

    /// Record the predicted profile a feature group contributed to a shared trace, with the
    /// fraction of the trace it was given
    pub fn write_shape(
        &mut self,
        group_id: usize,
        mass: f64,
        seed: &FeatureSeed,
        trace: &MassTrace,
        ratio: f64,
        component: &[f64],
    ) -> Result<(), QuantError> {
        self.writer.serialize(ReportRow {
            feature_group_id: group_id,
            trace_type: TraceType::TheoreticalShape as u8,
            mass,
            charge: seed.charge,
            isotope_index: seed.isotope_index,
            quant_value: ratio,
            centroid_mz: seed.centroid_mz,
            rts: join(&trace.times()),
            mzs: join(&trace.mzs()),
            intensities: join(component),
        })?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), QuantError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W, QuantError> {
        self.writer
            .into_inner()
            .map_err(|e| QuantError::Io(e.into_error()))
    }
}
