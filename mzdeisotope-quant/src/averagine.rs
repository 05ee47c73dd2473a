/*! Precalculated theoretical isotope distributions indexed by neutral mass */
use mzdeisotope::isotopic_model::{
    IsotopicModel, IsotopicPatternGenerator, NEUTRON_SHIFT, PROTON,
};
use crate::error::QuantError;
use tracing::debug;

/// The average mass difference between consecutive isotopic peaks of large biomolecules, used
/// when moving a mass along its isotope ladder.
pub const ISOTOPE_MASS_DIFF: f64 = 1.002371;

/// The default spacing between precalculated distributions, in Daltons
pub const DEFAULT_MASS_STEP: f64 = 25.0;

/// Isotopes less abundant than this fraction of the apex isotope are not counted
/// towards the usable isotope range
const MIN_RELATIVE_ABUNDANCE: f64 = 1e-3;

/// A theoretical isotope distribution whose index 0 is the monoisotopic peak.
///
/// Intensities are normalized to unit Euclidean norm so a dot product against another unit
/// vector is a cosine.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotopeDistribution {
    intensities: Vec<f64>,
    apex_index: usize,
    left_count: usize,
    right_count: usize,
    average_mass_delta: f64,
}

impl IsotopeDistribution {
    /// Build a distribution from relative isotope abundances, trimming the low-abundance tail
    pub fn from_intensities(mut intensities: Vec<f64>) -> Self {
        let (apex_index, apex) = intensities.iter().copied().enumerate().fold(
            (0, 0.0),
            |(bi, bv), (i, v)| if v > bv { (i, v) } else { (bi, bv) },
        );

        let threshold = apex * MIN_RELATIVE_ABUNDANCE;
        let right_count = intensities
            .iter()
            .skip(apex_index + 1)
            .take_while(|v| **v >= threshold)
            .count();
        let left_count = intensities[..apex_index]
            .iter()
            .rev()
            .take_while(|v| **v >= threshold)
            .count();

        intensities.truncate(apex_index + right_count + 1);

        let total: f64 = intensities.iter().sum();
        let average_mass_delta = if total > 0.0 {
            intensities
                .iter()
                .enumerate()
                .map(|(i, v)| i as f64 * ISOTOPE_MASS_DIFF * v)
                .sum::<f64>()
                / total
        } else {
            0.0
        };

        let norm = intensities.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            intensities.iter_mut().for_each(|v| *v /= norm);
        }

        Self {
            intensities,
            apex_index,
            left_count,
            right_count,
            average_mass_delta,
        }
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// The abundance at `index`, or zero outside of the distribution
    pub fn get(&self, index: isize) -> f64 {
        if index < 0 {
            0.0
        } else {
            self.intensities.get(index as usize).copied().unwrap_or_default()
        }
    }

    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    pub fn apex_index(&self) -> usize {
        self.apex_index
    }

    pub fn left_count_from_apex(&self) -> usize {
        self.left_count
    }

    pub fn right_count_from_apex(&self) -> usize {
        self.right_count
    }

    /// The first isotope index considered usable
    pub fn first_index(&self) -> usize {
        self.apex_index - self.left_count
    }

    /// The last isotope index considered usable
    pub fn last_index(&self) -> usize {
        self.apex_index + self.right_count
    }

    /// The difference between the average and the monoisotopic mass
    pub fn average_mass_delta(&self) -> f64 {
        self.average_mass_delta
    }
}

/// A table of [`IsotopeDistribution`] sampled at a regular mass step.
///
/// Lookups outside of the sampled mass range are clamped to the nearest end of the table.
#[derive(Debug, Clone)]
pub struct PrecalculatedAveragine {
    min_mass: f64,
    mass_step: f64,
    distributions: Vec<IsotopeDistribution>,
}

impl PrecalculatedAveragine {
    /// Generate distributions from `model` for every `mass_step` between `min_mass` and `max_mass`
    pub fn new(
        mut model: IsotopicModel<'_>,
        min_mass: f64,
        max_mass: f64,
        mass_step: f64,
    ) -> Self {
        let min_mass = min_mass.max(mass_step);
        let max_mass = max_mass.max(min_mass);
        let n = ((max_mass - min_mass) / mass_step).ceil() as usize + 1;
        debug!("Precalculating {n} isotopic distributions from {min_mass} to {max_mass}");
        let distributions = (0..n)
            .map(|i| theoretical_distribution(&mut model, min_mass + i as f64 * mass_step))
            .collect();
        Self {
            min_mass,
            mass_step,
            distributions,
        }
    }

    /// Build a table from already computed distributions, the first of which describes `min_mass`.
    ///
    /// The table must hold at least one distribution and be sampled at a positive step.
    pub fn from_distributions(
        min_mass: f64,
        mass_step: f64,
        distributions: Vec<IsotopeDistribution>,
    ) -> Result<Self, QuantError> {
        if distributions.is_empty() {
            return Err(QuantError::InvalidParameters(
                "an averagine table needs at least one isotope distribution".to_string(),
            ));
        }
        if !(mass_step > 0.0) {
            return Err(QuantError::InvalidParameters(format!(
                "the averagine mass step must be positive, not {mass_step}"
            )));
        }
        Ok(Self {
            min_mass,
            mass_step,
            distributions,
        })
    }

    fn index_for(&self, mass: f64) -> usize {
        let n = self.distributions.len();
        if n == 0 {
            return 0;
        }
        let i = ((mass - self.min_mass) / self.mass_step).round();
        if i.is_nan() || i < 0.0 {
            0
        } else {
            (i as usize).min(n - 1)
        }
    }

    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }

    /// The distribution nearest to `mass`
    pub fn get(&self, mass: f64) -> &IsotopeDistribution {
        &self.distributions[self.index_for(mass)]
    }

    pub fn apex_index(&self, mass: f64) -> usize {
        self.get(mass).apex_index()
    }

    pub fn left_count_from_apex(&self, mass: f64) -> usize {
        self.get(mass).left_count_from_apex()
    }

    pub fn last_index(&self, mass: f64) -> usize {
        self.get(mass).last_index()
    }

    /// The number of isotopes a deconvolution result at `mass` may claim
    pub fn max_isotope_count(&self, mass: f64) -> usize {
        self.get(mass).len()
    }

    pub fn average_mass_delta(&self, mass: f64) -> f64 {
        self.get(mass).average_mass_delta()
    }
}

fn theoretical_distribution(model: &mut IsotopicModel<'_>, mass: f64) -> IsotopeDistribution {
    let mono_mz = mass + PROTON;
    let pattern = model.isotopic_cluster(mono_mz, 1, PROTON, 0.9999, 0.0);
    let mut intensities: Vec<f64> = Vec::new();
    for peak in pattern.iter() {
        let offset = ((peak.mz() - mono_mz) / NEUTRON_SHIFT).round();
        if offset < 0.0 {
            continue;
        }
        let i = offset as usize;
        if intensities.len() <= i {
            intensities.resize(i + 1, 0.0);
        }
        intensities[i] += peak.intensity() as f64;
    }
    IsotopeDistribution::from_intensities(intensities)
}

#[cfg(test)]
mod test {
    use super::*;

    use mzdeisotope::isotopic_model::IsotopicModels;

    #[test]
    fn test_trimming() {
        let dist = IsotopeDistribution::from_intensities(vec![
            1e-5, 0.01, 0.2, 0.5, 0.25, 0.04, 1e-4, 1e-6,
        ]);
        assert_eq!(dist.apex_index(), 3);
        assert_eq!(dist.left_count_from_apex(), 2);
        assert_eq!(dist.right_count_from_apex(), 2);
        assert_eq!(dist.len(), 6);
        assert_eq!(dist.first_index(), 1);
        assert_eq!(dist.last_index(), 5);
        let norm: f64 = dist.intensities().iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        assert_eq!(dist.get(-1), 0.0);
        assert_eq!(dist.get(10), 0.0);
    }

    #[test]
    fn test_table_lookup_clamps() {
        let a = IsotopeDistribution::from_intensities(vec![1.0, 0.5]);
        let b = IsotopeDistribution::from_intensities(vec![0.5, 1.0, 0.5]);
        let table =
            PrecalculatedAveragine::from_distributions(1000.0, 100.0, vec![a.clone(), b.clone()])
                .unwrap();
        assert_eq!(table.get(0.0), &a);
        assert_eq!(table.get(1040.0), &a);
        assert_eq!(table.get(1060.0), &b);
        assert_eq!(table.get(1e6), &b);
        assert_eq!(table.apex_index(1100.0), 1);
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(matches!(
            PrecalculatedAveragine::from_distributions(1000.0, 100.0, Vec::new()),
            Err(QuantError::InvalidParameters(_))
        ));
        let a = IsotopeDistribution::from_intensities(vec![1.0, 0.5]);
        assert!(PrecalculatedAveragine::from_distributions(1000.0, 0.0, vec![a]).is_err());
    }

    #[test_log::test]
    fn test_peptide_model() {
        let model: IsotopicModel = IsotopicModels::Peptide.into();
        let table = PrecalculatedAveragine::new(model, 1000.0, 10000.0, 1000.0);
        assert_eq!(table.len(), 10);
        assert_eq!(table.apex_index(1000.0), 0);
        assert!(table.apex_index(10000.0) >= 4, "{}", table.apex_index(10000.0));
        let delta = table.average_mass_delta(10000.0);
        assert!(delta > 4.0 && delta < 8.0, "{delta}");
    }
}
