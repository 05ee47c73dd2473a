//! Isotope cosine scoring, feature group filtering and result shaping
use tracing::trace;

use crate::averagine::{IsotopeDistribution, PrecalculatedAveragine};
use crate::config::QuantParams;
use crate::group::FeatureGroup;

/// The cosine similarity between `observed[start..end]` and `theoretical` shifted right by `offset`.
///
/// `theoretical` is assumed to have unit norm. Returns zero if fewer than `min_isotopes`
/// isotopes are observed or if the most intense observed isotope is isolated.
pub fn isotope_cosine(
    observed: &[f64],
    start: usize,
    end: usize,
    theoretical: &IsotopeDistribution,
    offset: i32,
    min_isotopes: usize,
) -> f64 {
    let end = end.min(observed.len());
    if end <= start || end - start < min_isotopes {
        return 0.0;
    }

    let (apex, _) = observed[start..end]
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, v)| {
            if *v > bv {
                (i, *v)
            } else {
                (bi, bv)
            }
        });
    let apex = apex + start;
    let isolated = if apex == start {
        observed[start + 1] == 0.0
    } else if apex == end - 1 {
        observed[end - 2] == 0.0
    } else {
        observed[apex - 1] == 0.0 && observed[apex + 1] == 0.0
    };
    if isolated {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm = 0.0;
    for (j, a) in observed.iter().enumerate().take(end).skip(start) {
        dot += a * theoretical.get(j as isize - offset as isize);
        norm += a * a;
    }
    if norm <= 0.0 {
        return 0.0;
    }
    dot / norm.sqrt()
}

/// Find the isotope offset that best aligns `observed` with `theoretical`, returning the best
/// cosine and the offset that produced it.
pub fn isotope_cosine_and_offset(observed: &[f64], theoretical: &IsotopeDistribution) -> (f64, i32) {
    let Some(start) = observed.iter().position(|v| *v > 0.0) else {
        return (0.0, 0);
    };
    let end = observed.len();
    if end - start < 2 {
        return (0.0, 0);
    }
    let width = (theoretical.apex_index() / 4 + 1) as i32;
    let mut best = (0.0, 0);
    for offset in -width..=width {
        let cosine = isotope_cosine(observed, start, end, theoretical, offset, 2);
        if cosine > best.0 {
            best = (cosine, offset);
        }
    }
    best
}

/// Applies the scoring gates to [`FeatureGroup`]s and shapes their final attributes
#[derive(Debug, Clone, Copy)]
pub struct Scorer<'a> {
    pub averagine: &'a PrecalculatedAveragine,
    pub params: &'a QuantParams,
}

impl<'a> Scorer<'a> {
    pub fn new(averagine: &'a PrecalculatedAveragine, params: &'a QuantParams) -> Self {
        Self { averagine, params }
    }

    pub fn max_isotope_count(&self, mass: f64) -> usize {
        self.averagine.max_isotope_count(mass)
    }

    /// Recompute `group`'s mass and isotope cosine, correcting an isotope misassignment if one
    /// is found, and test whether it passes the charge, mass and cosine gates.
    pub fn score_and_filter(&self, group: &mut FeatureGroup, min_isotope_cosine: f64) -> bool {
        let max_isotopes = self.max_isotope_count(group.monoisotopic_mass());
        group.update_for_scoring(max_isotopes);

        if group.charges().len() < self.params.min_traces_per_group {
            trace!(
                "Rejecting {:0.3} with {} charge states",
                group.monoisotopic_mass(),
                group.charges().len()
            );
            return false;
        }
        let mass = group.monoisotopic_mass();
        if mass < self.params.min_mass || mass > self.params.max_mass {
            trace!("Rejecting {mass:0.3}, out of the mass range");
            return false;
        }

        let (cosine, offset) =
            isotope_cosine_and_offset(group.isotope_intensities(), self.averagine.get(mass));
        group.set_isotope_cosine(cosine);
        if cosine < min_isotope_cosine {
            trace!("Rejecting {mass:0.3} with isotope cosine {cosine:0.3}");
            return false;
        }

        if offset != 0 {
            trace!("Shifting {mass:0.3} by {offset} isotopes");
            group.update_masses_and_intensity(offset, max_isotopes);
            group.update_for_scoring(self.max_isotope_count(group.monoisotopic_mass()));
            if group.is_empty() {
                return false;
            }
        }

        if let Some(targets) = self.params.target_masses.as_ref() {
            let mass = group.monoisotopic_mass();
            let time = group.rt_of_apex();
            if !targets.iter().any(|t| t.matches(mass, time)) {
                return false;
            }
        }
        true
    }

    /// Refresh the group's members and score it against the final isotope cosine threshold
    pub fn rescore(&self, group: &mut FeatureGroup) -> bool {
        group.update_members();
        self.score_and_filter(group, self.params.min_isotope_cosine)
    }

    /// Fill in the per-charge intensity and cosine arrays and the average mass
    pub fn shape_results(&self, group: &mut FeatureGroup) {
        let mass = group.monoisotopic_mass();
        let theoretical = self.averagine.get(mass);
        let n_charges = group.max_charge().max(0) as usize + 1;
        let n_isotopes = theoretical.len().max(group.max_isotope_index() + 1);

        let mut per_charge_intensity = vec![0.0; n_charges];
        let mut per_charge_isotopes = vec![vec![0.0; n_isotopes]; n_charges];
        for seed in group.iter() {
            if seed.isotope_index < 0 || seed.charge < 0 {
                continue;
            }
            let z = seed.charge as usize;
            per_charge_intensity[z] += seed.intensity;
            per_charge_isotopes[z][seed.isotope_index as usize] += seed.intensity;
        }

        let per_charge_cosine = per_charge_isotopes
            .iter()
            .map(|isotopes| {
                let first = isotopes.iter().position(|v| *v > 0.0);
                let last = isotopes.iter().rposition(|v| *v > 0.0);
                match (first, last) {
                    (Some(first), Some(last)) => {
                        isotope_cosine(isotopes, first, last + 1, theoretical, 0, 2)
                    }
                    _ => 0.0,
                }
            })
            .collect();

        group.set_per_charge(per_charge_intensity, per_charge_cosine);
        group.set_average_mass(mass + self.averagine.average_mass_delta(mass));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::group::test::make_seed;

    fn table() -> PrecalculatedAveragine {
        let dist = IsotopeDistribution::from_intensities(vec![0.3, 0.8, 1.0, 0.7, 0.3, 0.1]);
        PrecalculatedAveragine::from_distributions(1000.0, 1000.0, vec![dist; 10]).unwrap()
    }

    fn params() -> QuantParams {
        QuantParams {
            min_charge: 2,
            max_charge: 10,
            min_mass: 1000.0,
            max_mass: 10000.0,
            min_traces_per_group: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_cosine() {
        let averagine = table();
        let dist = averagine.get(5000.0);
        let observed: Vec<f64> = dist.intensities().iter().map(|v| v * 40.0).collect();
        let cos = isotope_cosine(&observed, 0, observed.len(), dist, 0, 2);
        assert!((cos - 1.0).abs() < 1e-9);

        let (cos, offset) = isotope_cosine_and_offset(&observed, dist);
        assert_eq!(offset, 0);
        assert!((cos - 1.0).abs() < 1e-9);

        // Isolated apex
        let observed = vec![0.0, 0.0, 10.0, 0.0, 1.0];
        assert_eq!(isotope_cosine(&observed, 2, 5, dist, 0, 2), 0.0);
        assert_eq!(isotope_cosine_and_offset(&[0.0, 3.0], dist).0, 0.0);
    }

    #[test]
    fn test_offset_detection() {
        let averagine = table();
        let dist = averagine.get(5000.0);
        let mut observed = vec![0.0];
        observed.extend(dist.intensities().iter().map(|v| v * 40.0));
        let (cos, offset) = isotope_cosine_and_offset(&observed, dist);
        assert_eq!(offset, 1);
        assert!((cos - 1.0).abs() < 1e-9);
    }

    #[test_log::test]
    fn test_score_and_filter_idempotent() {
        let averagine = table();
        let params = params();
        let scorer = Scorer::new(&averagine, &params);
        let dist = averagine.get(5000.0);
        let mut seeds = Vec::new();
        let mut ti = 0;
        for z in [3, 4] {
            for (i, v) in dist.intensities().iter().enumerate() {
                seeds.push(make_seed(ti, 5000.0, z, i as i32, v * 100.0, (10.0, 14.0)));
                ti += 1;
            }
        }
        let mut group = FeatureGroup::with_mass(seeds, 5000.0);
        assert!(scorer.rescore(&mut group));
        let first = (
            group.monoisotopic_mass(),
            group.isotope_cosine(),
            group.charges().to_vec(),
        );
        assert!(scorer.rescore(&mut group));
        assert_eq!(group.monoisotopic_mass(), first.0);
        assert_eq!(group.isotope_cosine(), first.1);
        assert_eq!(group.charges(), first.2.as_slice());

        scorer.shape_results(&mut group);
        assert_eq!(group.per_charge_intensity().len(), 5);
        assert!(group.per_charge_intensity()[3] > 0.0);
        assert!((group.per_charge_cosine()[4] - 1.0).abs() < 1e-9);
        assert!(group.average_mass() > group.monoisotopic_mass());
    }

    #[test]
    fn test_filter_gates() {
        let averagine = table();
        let mut params = params();
        let dist = averagine.get(5000.0);
        let seeds: Vec<_> = dist
            .intensities()
            .iter()
            .enumerate()
            .map(|(i, v)| make_seed(i, 5000.0, 3, i as i32, v * 100.0, (10.0, 14.0)))
            .collect();
        let mut group = FeatureGroup::with_mass(seeds.clone(), 5000.0);
        // A single charge state
        assert!(!Scorer::new(&averagine, &params).rescore(&mut group));

        params.min_traces_per_group = 1;
        params.max_mass = 4000.0;
        let mut group = FeatureGroup::with_mass(seeds.clone(), 5000.0);
        assert!(!Scorer::new(&averagine, &params).rescore(&mut group));

        params.max_mass = 10000.0;
        params.target_masses = Some(vec![crate::config::TargetMass::new(6000.0, 12.0)]);
        let mut group = FeatureGroup::with_mass(seeds, 5000.0);
        assert!(!Scorer::new(&averagine, &params).rescore(&mut group));
    }
}
