//! Feature groups, collections of [`FeatureSeed`] describing one charge-deconvolved species
use std::cmp::Ordering;
use std::collections::HashSet;

use itertools::Itertools;
use mzpeaks::{prelude::*, Mass};

use crate::averagine::ISOTOPE_MASS_DIFF;
use crate::seed::FeatureSeed;

/// A set of [`FeatureSeed`] that together represent one charge-deconvolved molecular species
/// eluting at one apex.
///
/// The derived attributes are cached and must be refreshed with [`FeatureGroup::update_members`]
/// after the seed list changes. All mutators provided here do so themselves.
#[derive(Debug, Clone, Default)]
pub struct FeatureGroup {
    seeds: Vec<FeatureSeed>,
    monoisotopic_mass: f64,
    average_mass: f64,
    intensity: f64,
    isotope_cosine: f64,
    charges: Vec<i32>,
    min_charge: i32,
    max_charge: i32,
    max_isotope_index: usize,
    fwhm_range: (f64, f64),
    rt_of_apex: f64,
    trace_indices: Vec<usize>,
    isotope_intensities: Vec<f64>,
    per_charge_intensity: Vec<f64>,
    per_charge_cosine: Vec<f64>,
}

impl FeatureGroup {
    pub fn new(seeds: Vec<FeatureSeed>) -> Self {
        let mut this = Self {
            seeds,
            ..Default::default()
        };
        this.update_members();
        this
    }

    /// A group whose monoisotopic mass is known a priori, as when built from a deconvolution
    /// result
    pub fn with_mass(seeds: Vec<FeatureSeed>, monoisotopic_mass: f64) -> Self {
        let mut this = Self::new(seeds);
        this.monoisotopic_mass = monoisotopic_mass;
        this
    }

    /// Re-sort the seeds and recompute the charge set, trace indices, intensity and the
    /// elution window
    pub fn update_members(&mut self) {
        self.sort_seeds();
        self.charges = self.seeds.iter().map(|s| s.charge).sorted().dedup().collect();
        self.min_charge = self.charges.first().copied().unwrap_or_default();
        self.max_charge = self.charges.last().copied().unwrap_or_default();
        self.trace_indices = self
            .seeds
            .iter()
            .map(|s| s.trace_index)
            .sorted()
            .dedup()
            .collect();
        self.max_isotope_index = self
            .seeds
            .iter()
            .map(|s| s.isotope_index.max(0) as usize)
            .max()
            .unwrap_or_default();
        self.intensity = self.seeds.iter().map(|s| s.intensity).sum();
        if let Some(seed) = self.most_abundant_seed() {
            self.fwhm_range = seed.fwhm_range();
        } else {
            self.fwhm_range = (0.0, 0.0);
        }
        self.rt_of_apex = self
            .seeds
            .iter()
            .max_by(|a, b| a.apex_intensity.total_cmp(&b.apex_intensity))
            .map(|s| s.apex_time)
            .unwrap_or_default();
    }

    /// Shift every isotope index down by `offset`, drop seeds that fall outside of
    /// `0..max_isotope_count`, then recompute the monoisotopic mass as the `(intensity + 1)`
    /// weighted mean of the seeds' isotope-corrected uncharged masses.
    pub fn update_masses_and_intensity(&mut self, offset: i32, max_isotope_count: usize) {
        if offset != 0 {
            for seed in self.seeds.iter_mut() {
                seed.isotope_index -= offset;
            }
        }
        let max = max_isotope_count as i32;
        self.retain_seeds_unrefreshed(|s| s.isotope_index >= 0 && s.isotope_index < max);

        let mut weighted = 0.0;
        let mut weights = 0.0;
        for seed in self.seeds.iter() {
            let w = seed.intensity + 1.0;
            weighted += w * (seed.uncharged_mass() - seed.isotope_index as f64 * ISOTOPE_MASS_DIFF);
            weights += w;
        }
        if weights > 0.0 {
            self.monoisotopic_mass = weighted / weights;
        }
        self.update_members();
    }

    /// Refresh the mass, isotope intensity vector and charge set from the current seeds
    pub fn update_for_scoring(&mut self, max_isotope_count: usize) {
        self.update_masses_and_intensity(0, max_isotope_count);
        let mut isotopes = vec![0.0; self.max_isotope_index + 1];
        for seed in self.seeds.iter() {
            isotopes[seed.isotope_index as usize] += seed.intensity;
        }
        if self.seeds.is_empty() {
            isotopes.clear();
        }
        self.isotope_intensities = isotopes;
    }

    /// Order seeds by (charge, isotope index, m/z)
    pub fn sort_seeds(&mut self) {
        self.seeds.sort_by(|a, b| {
            a.charge
                .cmp(&b.charge)
                .then(a.isotope_index.cmp(&b.isotope_index))
                .then(a.centroid_mz.total_cmp(&b.centroid_mz))
        });
    }

    fn retain_seeds_unrefreshed<F: FnMut(&FeatureSeed) -> bool>(&mut self, mut predicate: F) {
        let kept: Vec<FeatureSeed> = self.seeds.iter().filter(|s| predicate(s)).copied().collect();
        self.seeds = kept;
    }

    /// Keep only the seeds matching `predicate`
    pub fn retain_seeds<F: FnMut(&FeatureSeed) -> bool>(&mut self, predicate: F) {
        self.retain_seeds_unrefreshed(predicate);
        self.update_members();
    }

    pub fn push_seed(&mut self, seed: FeatureSeed) {
        self.seeds.push(seed);
        self.update_members();
    }

    /// Replace the seed at `index`, returning the old one
    pub fn replace_seed(&mut self, index: usize, seed: FeatureSeed) -> FeatureSeed {
        let old = std::mem::replace(&mut self.seeds[index], seed);
        self.update_members();
        old
    }

    /// Find the position of the seed reading `trace_index` at `charge`
    pub fn find_seed(&self, trace_index: usize, charge: i32) -> Option<usize> {
        self.seeds
            .iter()
            .position(|s| s.trace_index == trace_index && s.charge == charge)
    }

    pub fn seeds(&self) -> &[FeatureSeed] {
        &self.seeds
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FeatureSeed> {
        self.seeds.iter()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn most_abundant_seed(&self) -> Option<&FeatureSeed> {
        self.seeds
            .iter()
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
    }

    pub fn has_duplicate_isotope_claims(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.seeds.len());
        !self
            .seeds
            .iter()
            .all(|s| seen.insert((s.charge, s.isotope_index)))
    }

    pub fn contains_trace(&self, trace_index: usize) -> bool {
        self.trace_indices.binary_search(&trace_index).is_ok()
    }

    pub fn contains_charge(&self, charge: i32) -> bool {
        self.charges.binary_search(&charge).is_ok()
    }

    pub fn monoisotopic_mass(&self) -> f64 {
        self.monoisotopic_mass
    }

    pub fn set_monoisotopic_mass(&mut self, mass: f64) {
        self.monoisotopic_mass = mass;
    }

    pub fn average_mass(&self) -> f64 {
        self.average_mass
    }

    pub fn set_average_mass(&mut self, mass: f64) {
        self.average_mass = mass;
    }

    pub fn intensity(&self) -> f64 {
        self.intensity
    }

    pub fn isotope_cosine(&self) -> f64 {
        self.isotope_cosine
    }

    pub fn set_isotope_cosine(&mut self, cosine: f64) {
        self.isotope_cosine = cosine;
    }

    pub fn charges(&self) -> &[i32] {
        &self.charges
    }

    pub fn min_charge(&self) -> i32 {
        self.min_charge
    }

    pub fn max_charge(&self) -> i32 {
        self.max_charge
    }

    pub fn charge_range(&self) -> (i32, i32) {
        (self.min_charge, self.max_charge)
    }

    pub fn max_isotope_index(&self) -> usize {
        self.max_isotope_index
    }

    pub fn fwhm_range(&self) -> (f64, f64) {
        self.fwhm_range
    }

    pub fn rt_of_apex(&self) -> f64 {
        self.rt_of_apex
    }

    pub fn trace_indices(&self) -> &[usize] {
        &self.trace_indices
    }

    pub fn isotope_intensities(&self) -> &[f64] {
        &self.isotope_intensities
    }

    /// Summed intensity per charge state, indexed by charge
    pub fn per_charge_intensity(&self) -> &[f64] {
        &self.per_charge_intensity
    }

    /// Isotope cosine per charge state, indexed by charge
    pub fn per_charge_cosine(&self) -> &[f64] {
        &self.per_charge_cosine
    }

    pub fn set_per_charge(&mut self, intensities: Vec<f64>, cosines: Vec<f64>) {
        self.per_charge_intensity = intensities;
        self.per_charge_cosine = cosines;
    }

    /// Order by the quantitative score, intensity and then isotope cosine
    pub fn score_cmp(&self, other: &Self) -> Ordering {
        self.intensity
            .total_cmp(&other.intensity)
            .then(self.isotope_cosine.total_cmp(&other.isotope_cosine))
    }

    /// Order by monoisotopic mass and then intensity
    pub fn mass_cmp(&self, other: &Self) -> Ordering {
        self.monoisotopic_mass
            .total_cmp(&other.monoisotopic_mass)
            .then(self.intensity.total_cmp(&other.intensity))
    }
}

impl PartialEq for FeatureGroup {
    fn eq(&self, other: &Self) -> bool {
        self.monoisotopic_mass == other.monoisotopic_mass && self.seeds == other.seeds
    }
}

impl PartialOrd for FeatureGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        Some(self.mass_cmp(other))
    }
}

impl CoordinateLike<Mass> for FeatureGroup {
    fn coordinate(&self) -> f64 {
        self.monoisotopic_mass
    }
}

impl IntensityMeasurement for FeatureGroup {
    fn intensity(&self) -> f32 {
        self.intensity as f32
    }
}

impl<'a> IntoIterator for &'a FeatureGroup {
    type Item = &'a FeatureSeed;
    type IntoIter = std::slice::Iter<'a, FeatureSeed>;

    fn into_iter(self) -> Self::IntoIter {
        self.seeds.iter()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use mzdeisotope::isotopic_model::PROTON;

    /// A seed for a species of neutral monoisotopic `mass` observed at `charge` on isotope `iso`
    pub(crate) fn make_seed(
        trace_index: usize,
        mass: f64,
        charge: i32,
        iso: i32,
        intensity: f64,
        fwhm: (f64, f64),
    ) -> FeatureSeed {
        let mz = (mass + iso as f64 * ISOTOPE_MASS_DIFF) / charge as f64 + PROTON;
        FeatureSeed {
            trace_index,
            charge,
            isotope_index: iso,
            mass,
            centroid_mz: mz,
            intensity,
            fwhm_start: fwhm.0,
            fwhm_end: fwhm.1,
            apex_time: (fwhm.0 + fwhm.1) / 2.0,
            apex_intensity: intensity / 5.0,
        }
    }

    #[test_log::test]
    fn test_update_masses() {
        let seeds = vec![
            make_seed(0, 5000.0, 3, 1, 100.0, (10.0, 14.0)),
            make_seed(1, 5000.0, 2, 0, 200.0, (10.0, 14.0)),
            make_seed(2, 5000.0, 2, 1, 50.0, (11.0, 13.0)),
        ];
        let mut group = FeatureGroup::new(seeds);
        assert_eq!(group.charges(), &[2, 3]);
        assert_eq!(group.seeds()[0].charge, 2);
        assert_eq!(group.trace_indices(), &[0, 1, 2]);
        assert_eq!(group.fwhm_range(), (10.0, 14.0));

        group.update_for_scoring(10);
        assert!((group.monoisotopic_mass() - 5000.0).abs() < 1e-6);
        assert_eq!(group.isotope_intensities(), &[200.0, 150.0]);
        assert_eq!(group.intensity(), 350.0);

        // Shifting down past zero drops the monoisotopic seed
        group.update_masses_and_intensity(1, 10);
        assert_eq!(group.len(), 2);
        assert!((group.monoisotopic_mass() - (5000.0 + ISOTOPE_MASS_DIFF)).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_claims() {
        let mut group = FeatureGroup::new(vec![
            make_seed(0, 5000.0, 3, 1, 100.0, (10.0, 14.0)),
            make_seed(1, 5000.0, 3, 2, 100.0, (10.0, 14.0)),
        ]);
        assert!(!group.has_duplicate_isotope_claims());
        group.push_seed(make_seed(2, 5000.0, 3, 2, 10.0, (10.0, 14.0)));
        assert!(group.has_duplicate_isotope_claims());
        assert_eq!(group.find_seed(2, 3), Some(2));
        group.retain_seeds(|s| s.trace_index != 2);
        assert!(!group.has_duplicate_isotope_claims());
        assert!(!group.contains_trace(2));
    }

    fn lightest<T: CoordinateLike<Mass>>(items: &[T]) -> Option<&T> {
        items
            .iter()
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
    }

    #[test]
    fn test_mass_ordering() {
        let groups = vec![
            FeatureGroup::with_mass(vec![make_seed(0, 7000.0, 4, 0, 100.0, (10.0, 14.0))], 7000.0),
            FeatureGroup::with_mass(vec![make_seed(1, 5000.0, 4, 0, 100.0, (10.0, 14.0))], 5000.0),
        ];
        let light = lightest(&groups).unwrap();
        assert_eq!(light.coordinate(), 5000.0);
        assert_eq!(light.trace_indices(), &[1]);
        assert!(groups[0] > groups[1]);
        assert_eq!(groups[0], groups[0].clone());
    }
}
