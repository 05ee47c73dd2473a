//! The charge deconvolution service contract, its `mzdeisotope` implementation, and the driver
//! turning its assignments into candidate [`FeatureGroup`]s
use std::collections::HashSet;

use mzdeisotope::{
    deconvolute_peaks,
    isotopic_model::{IsotopicModel, IsotopicPatternParams, PROTON},
    scorer::{MaximizingFitFilter, PenalizedMSDeconvScorer},
    solution::DeconvolvedSolutionPeak,
};
use mzpeaks::{CentroidPeak, MZPeakSetType, Tolerance};
use tracing::{debug, trace};

use crate::averagine::{PrecalculatedAveragine, ISOTOPE_MASS_DIFF};
use crate::config::{Averagine, QuantParams};
use crate::error::QuantError;
use crate::group::FeatureGroup;
use crate::seed::FeatureSeed;
use crate::window::PseudoSpectrum;

/// A peak handed to a [`SpectrumDeconvolver`]. `index` is its position in the input slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPeak {
    pub index: usize,
    pub mz: f64,
    pub intensity: f64,
}

/// A peak labeled with a charge state and isotope index. `index` refers to the
/// [`WindowPeak`] it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignedPeak {
    pub index: usize,
    pub charge: i32,
    pub isotope_index: i32,
    pub mass: f64,
}

/// A set of peaks explained by one neutral species across one or more charge states
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakGroupAssignment {
    pub monoisotopic_mass: f64,
    pub peaks: Vec<AssignedPeak>,
}

/// A charge deconvolution service.
///
/// Implementations label the peaks of a synthetic spectrum with charge states and isotope
/// indices. They must not change the peaks, and they report them by position.
pub trait SpectrumDeconvolver {
    fn deconvolve(&self, peaks: &[WindowPeak]) -> Result<Vec<PeakGroupAssignment>, QuantError>;
}

impl<T: SpectrumDeconvolver> SpectrumDeconvolver for &T {
    fn deconvolve(&self, peaks: &[WindowPeak]) -> Result<Vec<PeakGroupAssignment>, QuantError> {
        (**self).deconvolve(peaks)
    }
}

/// A [`SpectrumDeconvolver`] backed by [`mzdeisotope::deconvolute_peaks`].
///
/// `mzdeisotope` solves each charge state separately, so solutions whose neutral masses agree,
/// or differ by exactly one isotope, are merged into a single multi-charge assignment.
#[derive(Debug, Clone)]
pub struct MzDeisotopeDeconvolver {
    pub isotopic_model: Averagine,
    pub charge_range: (i32, i32),
    pub mz_tolerance_ppm: f64,
    pub score_threshold: f32,
    pub max_missed_peaks: u16,
    pub isotopic_params: IsotopicPatternParams,
}

impl MzDeisotopeDeconvolver {
    pub fn new(
        isotopic_model: Averagine,
        charge_range: (i32, i32),
        mz_tolerance_ppm: f64,
        score_threshold: f32,
    ) -> Self {
        Self {
            isotopic_model,
            charge_range,
            mz_tolerance_ppm,
            score_threshold,
            max_missed_peaks: 1,
            isotopic_params: IsotopicPatternParams::default(),
        }
    }

    pub fn from_params(params: &QuantParams) -> Self {
        Self::new(
            params.isotopic_model,
            params.charge_range(),
            params.mz_tolerance_ppm,
            params.deconvolution_score_threshold as f32,
        )
    }

    fn tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.mz_tolerance_ppm)
    }

    /// Locate the window peak nearest `mz`, if it lies within tolerance
    fn find_peak(&self, peaks: &[WindowPeak], mz: f64) -> Option<usize> {
        let i = peaks.partition_point(|p| p.mz < mz);
        let lo = i.saturating_sub(1);
        let hi = (i + 1).min(peaks.len());
        (lo..hi)
            .filter(|j| self.tolerance().test(peaks[*j].mz, mz))
            .min_by(|a, b| {
                (peaks[*a].mz - mz)
                    .abs()
                    .total_cmp(&(peaks[*b].mz - mz).abs())
            })
    }

    fn assign(&self, peaks: &[WindowPeak], solution: &DeconvolvedSolutionPeak) -> Vec<AssignedPeak> {
        solution
            .envelope
            .iter()
            .enumerate()
            .filter(|(_, pt)| pt.intensity > 1.0)
            .filter_map(|(iso, pt)| {
                self.find_peak(peaks, pt.mz).map(|index| AssignedPeak {
                    index,
                    charge: solution.charge.abs(),
                    isotope_index: iso as i32,
                    mass: solution.neutral_mass,
                })
            })
            .collect()
    }

    /// The isotope shift `k` such that `mass ≈ reference + k · ISOTOPE_MASS_DIFF`
    fn isotope_shift_between(&self, reference: f64, mass: f64) -> Option<i32> {
        (-1..=1).find(|k| {
            let expected = reference + *k as f64 * ISOTOPE_MASS_DIFF;
            self.tolerance().test(mass, expected)
        })
    }

    fn merge_solutions(
        &self,
        peaks: &[WindowPeak],
        mut solutions: Vec<DeconvolvedSolutionPeak>,
    ) -> Vec<PeakGroupAssignment> {
        solutions.sort_by(|a, b| {
            b.intensity
                .total_cmp(&a.intensity)
                .then(a.neutral_mass.total_cmp(&b.neutral_mass))
        });

        let mut assignments: Vec<PeakGroupAssignment> = Vec::new();
        for solution in solutions.iter() {
            let assigned = self.assign(peaks, solution);
            if assigned.is_empty() {
                continue;
            }
            let matched = assignments.iter_mut().find_map(|a| {
                self.isotope_shift_between(a.monoisotopic_mass, solution.neutral_mass)
                    .map(|k| (a, k))
            });
            match matched {
                Some((assignment, shift)) => {
                    for mut peak in assigned {
                        peak.isotope_index += shift;
                        if peak.isotope_index < 0 {
                            continue;
                        }
                        let claimed = assignment.peaks.iter().any(|p| {
                            p.charge == peak.charge && p.isotope_index == peak.isotope_index
                        });
                        if !claimed {
                            assignment.peaks.push(peak);
                        }
                    }
                }
                None => assignments.push(PeakGroupAssignment {
                    monoisotopic_mass: solution.neutral_mass,
                    peaks: assigned,
                }),
            }
        }
        assignments
    }
}

impl SpectrumDeconvolver for MzDeisotopeDeconvolver {
    fn deconvolve(&self, peaks: &[WindowPeak]) -> Result<Vec<PeakGroupAssignment>, QuantError> {
        if peaks.is_empty() {
            return Ok(Vec::new());
        }
        let peak_set = MZPeakSetType::new(
            peaks
                .iter()
                .map(|p| CentroidPeak::new(p.mz, p.intensity as f32, p.index as u32))
                .collect(),
        );
        let model: IsotopicModel<'static> = self.isotopic_model.into();
        let solutions = deconvolute_peaks(
            peak_set,
            model,
            self.tolerance(),
            self.charge_range,
            PenalizedMSDeconvScorer::new(0.02, 2.0),
            MaximizingFitFilter::new(self.score_threshold),
            self.max_missed_peaks,
            self.isotopic_params,
            false,
        )?;
        let solutions: Vec<DeconvolvedSolutionPeak> = solutions.iter().cloned().collect();
        trace!(
            "{} charge state solutions from {} peaks",
            solutions.len(),
            peaks.len()
        );
        Ok(self.merge_solutions(peaks, solutions))
    }
}

/// Converts a [`SpectrumDeconvolver`]'s output on a [`PseudoSpectrum`] into [`FeatureGroup`]s
#[derive(Debug)]
pub struct DeconvolutionDriver<'a, D: SpectrumDeconvolver> {
    pub deconvolver: &'a D,
    pub averagine: &'a PrecalculatedAveragine,
    pub min_traces_per_group: usize,
}

impl<'a, D: SpectrumDeconvolver> DeconvolutionDriver<'a, D> {
    pub fn new(
        deconvolver: &'a D,
        averagine: &'a PrecalculatedAveragine,
        min_traces_per_group: usize,
    ) -> Self {
        Self {
            deconvolver,
            averagine,
            min_traces_per_group,
        }
    }

    pub fn groups_from_spectrum(
        &self,
        seeds: &[FeatureSeed],
        spectrum: &PseudoSpectrum,
    ) -> Result<Vec<FeatureGroup>, QuantError> {
        let peaks: Vec<WindowPeak> = spectrum
            .members
            .iter()
            .enumerate()
            .map(|(index, i)| WindowPeak {
                index,
                mz: seeds[*i].centroid_mz,
                intensity: seeds[*i].intensity,
            })
            .collect();

        let assignments = self.deconvolver.deconvolve(&peaks)?;
        let mut groups = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            if assignment.peaks.len() < self.min_traces_per_group {
                continue;
            }
            let max_isotopes = self.averagine.max_isotope_count(assignment.monoisotopic_mass);
            let mut claimed = HashSet::new();
            let mut members = Vec::with_capacity(assignment.peaks.len());
            for peak in assignment.peaks.iter() {
                let Some(seed_index) = spectrum.members.get(peak.index) else {
                    return Err(QuantError::DataConsistency {
                        index: peak.index,
                        mz: peak.mass / peak.charge.max(1) as f64 + PROTON,
                    });
                };
                if peak.charge < 1
                    || peak.isotope_index < 0
                    || peak.isotope_index as usize >= max_isotopes
                    || !claimed.insert((peak.charge, peak.isotope_index))
                {
                    continue;
                }
                let mut seed = seeds[*seed_index];
                seed.charge = peak.charge;
                seed.isotope_index = peak.isotope_index;
                seed.mass = seed.uncharged_mass();
                members.push(seed);
            }
            if members.is_empty() {
                continue;
            }
            groups.push(FeatureGroup::with_mass(members, assignment.monoisotopic_mass));
        }
        if !groups.is_empty() {
            debug!(
                "{} feature groups from {} peaks at {:0.3}",
                groups.len(),
                peaks.len(),
                spectrum.time
            );
        }
        Ok(groups)
    }
}
