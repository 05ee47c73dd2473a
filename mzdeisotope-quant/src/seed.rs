use mzdeisotope::isotopic_model::PROTON;
use mzpeaks::{prelude::*, MZ};

use crate::trace::MassTrace;

/// One mass trace annotated with the charge state and isotope index assigned to it by
/// deconvolution.
///
/// A seed copies the trace attributes it needs and refers back to its trace through
/// `trace_index`, a position in the trace arena. Several seeds may share a `trace_index`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSeed {
    pub trace_index: usize,
    pub charge: i32,
    /// `-1` when no isotope has been assigned
    pub isotope_index: i32,
    pub mass: f64,
    pub centroid_mz: f64,
    pub intensity: f64,
    pub fwhm_start: f64,
    pub fwhm_end: f64,
    pub apex_time: f64,
    pub apex_intensity: f64,
}

impl FeatureSeed {
    pub fn from_trace(trace_index: usize, trace: &MassTrace) -> Self {
        let (apex_time, apex_intensity) = trace
            .apex()
            .map(|p| (p.time, p.intensity as f64))
            .unwrap_or_default();
        Self {
            trace_index,
            charge: 0,
            isotope_index: -1,
            mass: 0.0,
            centroid_mz: trace.centroid_mz(),
            intensity: trace.total_intensity(),
            fwhm_start: trace.fwhm_start(),
            fwhm_end: trace.fwhm_end(),
            apex_time,
            apex_intensity,
        }
    }

    /// A copy of this seed describing `trace`, stored at `trace_index`, keeping the
    /// deconvolution labels
    pub fn with_trace(&self, trace_index: usize, trace: &MassTrace) -> Self {
        let mut dup = Self::from_trace(trace_index, trace);
        dup.charge = self.charge;
        dup.isotope_index = self.isotope_index;
        dup.mass = self.mass;
        // An empty trace has no centroid of its own
        if trace.is_empty() {
            dup.centroid_mz = self.centroid_mz;
        }
        dup
    }

    /// The neutral mass of this trace at its assigned charge, ignoring the isotope offset
    pub fn uncharged_mass(&self) -> f64 {
        if self.charge == 0 {
            return 0.0;
        }
        (self.centroid_mz - PROTON) * self.charge as f64
    }

    /// The midpoint of the FWHM window
    pub fn fwhm_center(&self) -> f64 {
        (self.fwhm_start + self.fwhm_end) / 2.0
    }

    pub fn fwhm_range(&self) -> (f64, f64) {
        (self.fwhm_start, self.fwhm_end)
    }

    pub fn is_assigned(&self) -> bool {
        self.charge > 0 && self.isotope_index >= 0
    }
}

impl PartialOrd for FeatureSeed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self == other {
            return Some(std::cmp::Ordering::Equal);
        }
        match self.centroid_mz.total_cmp(&other.centroid_mz) {
            std::cmp::Ordering::Equal => {}
            x => return Some(x),
        };
        match self.charge.cmp(&other.charge) {
            std::cmp::Ordering::Equal => {}
            x => return Some(x),
        };
        self.intensity.partial_cmp(&other.intensity)
    }
}

impl CoordinateLike<MZ> for FeatureSeed {
    fn coordinate(&self) -> f64 {
        self.centroid_mz
    }
}

impl IntensityMeasurement for FeatureSeed {
    fn intensity(&self) -> f32 {
        self.intensity as f32
    }
}
