//! Merge candidate feature groups that describe the same species
use std::collections::HashSet;

use mzdeisotope::isotopic_model::PROTON;
use tracing::{debug, trace};

use crate::averagine::ISOTOPE_MASS_DIFF;
use crate::group::FeatureGroup;
use crate::scoring::Scorer;
use crate::seed::FeatureSeed;

/// Candidates further apart than this are never compared
const COARSE_MASS_WINDOW: f64 = 10.0;

/// Test whether two FWHM intervals overlap by at least half of either one's length
pub fn fwhm_ranges_overlap(a: (f64, f64), b: (f64, f64)) -> bool {
    if a.0 > b.1 || b.0 > a.1 {
        return false;
    }
    let overlap = a.1.min(b.1) - a.0.max(b.0);
    let fraction = |len: f64| if len > 0.0 { overlap / len } else { 1.0 };
    !(fraction(a.1 - a.0) < 0.5 && fraction(b.1 - b.0) < 0.5)
}

/// Test whether `a` and `b` share at least `threshold` of the smaller group's traces.
///
/// When `charge_specific` is set only seeds with a charge both groups cover are compared. Groups
/// whose charge ranges are disjoint cannot contradict each other and count as overlapping.
pub fn trace_indices_overlap(
    a: &FeatureGroup,
    b: &FeatureGroup,
    threshold: f64,
    charge_specific: bool,
) -> bool {
    let (lo, hi) = if charge_specific {
        let lo = a.min_charge().max(b.min_charge());
        let hi = a.max_charge().min(b.max_charge());
        if lo > hi {
            return true;
        }
        (lo, hi)
    } else {
        (i32::MIN, i32::MAX)
    };
    let traces_of = |g: &FeatureGroup| -> HashSet<usize> {
        g.iter()
            .filter(|s| s.charge >= lo && s.charge <= hi)
            .map(|s| s.trace_index)
            .collect()
    };
    let a_traces = traces_of(a);
    let b_traces = traces_of(b);
    if a_traces.is_empty() || b_traces.is_empty() {
        return false;
    }
    let shared = a_traces.intersection(&b_traces).count();
    shared as f64 / a_traces.len().min(b_traces.len()) as f64 >= threshold
}

/// The first candidate with the highest quantitative score
fn best_candidate(groups: &[FeatureGroup]) -> usize {
    let mut best = 0;
    for (i, g) in groups.iter().enumerate().skip(1) {
        if g.score_cmp(&groups[best]).is_gt() {
            best = i;
        }
    }
    best
}

/// Fold `seeds` into a copy of `candidate`.
///
/// A seed at a charge state the candidate lacks is always added. Otherwise its isotope index is
/// recomputed against the candidate's mass, and if that isotope is already claimed, the seed
/// whose FWHM center is closer to the candidate's apex keeps it.
fn merge_seeds(candidate: &FeatureGroup, seeds: Vec<FeatureSeed>, scorer: &Scorer) -> FeatureGroup {
    let mono = candidate.monoisotopic_mass();
    let distribution = scorer.averagine.get(mono);
    let min_iso = distribution.first_index() as i32;
    let max_iso = distribution.last_index() as i32;
    let apex_time = candidate
        .most_abundant_seed()
        .map(|s| s.fwhm_center())
        .unwrap_or_default();

    let mut merged = candidate.clone();
    for mut seed in seeds {
        let z = seed.charge as f64;
        let iso = ((seed.centroid_mz - (mono / z + PROTON)) / (ISOTOPE_MASS_DIFF / z)).round() as i32;

        if !merged.contains_charge(seed.charge) {
            if (0..=max_iso).contains(&iso) {
                seed.isotope_index = iso;
            }
            merged.push_seed(seed);
            continue;
        }
        if iso > max_iso || iso < min_iso {
            continue;
        }
        seed.isotope_index = iso;
        match merged
            .iter()
            .position(|s| s.charge == seed.charge && s.isotope_index == iso)
        {
            Some(pos) => {
                let existing = &merged.seeds()[pos];
                if (seed.fwhm_center() - apex_time).abs()
                    >= (existing.fwhm_center() - apex_time).abs()
                {
                    continue;
                }
                trace!(
                    "Replacing trace {} with {} at charge {} isotope {iso}",
                    existing.trace_index,
                    seed.trace_index,
                    seed.charge
                );
                merged.replace_seed(pos, seed);
            }
            None => merged.push_seed(seed),
        }
    }
    merged
}

/// Greedily merge candidate groups in order of decreasing quantitative score.
///
/// Groups within the mass tolerance of the candidate, or sharing traces with it, and whose FWHM
/// windows overlap, donate their seeds to it. The merged candidate is kept if it passes scoring,
/// else the unmerged candidate is kept if it passes. Every donor is consumed either way.
pub fn refine_feature_groups(
    mut groups: Vec<FeatureGroup>,
    scorer: &Scorer,
) -> Vec<FeatureGroup> {
    let params = scorer.params;
    let min_isotope_cosine = params.refinement_isotope_cosine();
    groups.sort_by(|a, b| a.mass_cmp(b));

    let (min_z, max_z) = groups.iter().fold((i32::MAX, i32::MIN), |(lo, hi), g| {
        (lo.min(g.min_charge()), hi.max(g.max_charge()))
    });
    debug!(
        "Refining {} candidate feature groups over charges {min_z} to {max_z}",
        groups.len()
    );

    let mut refined = Vec::new();
    while !groups.is_empty() {
        let best = best_candidate(&groups);
        let mass = groups[best].monoisotopic_mass();
        let lo = groups.partition_point(|g| g.monoisotopic_mass() < mass - COARSE_MASS_WINDOW);
        let hi = groups.partition_point(|g| g.monoisotopic_mass() <= mass + COARSE_MASS_WINDOW);

        if hi - lo <= 1 {
            let mut group = groups.remove(best);
            if scorer.score_and_filter(&mut group, min_isotope_cosine) {
                refined.push(group);
            }
            continue;
        }

        let candidate = &groups[best];
        let mut consumed = vec![best];
        let mut donated: Vec<FeatureSeed> = Vec::new();
        for (j, other) in groups.iter().enumerate().take(hi).skip(lo) {
            if j == best {
                continue;
            }
            if (other.monoisotopic_mass() - mass).abs() > params.mass_tolerance_da
                && !trace_indices_overlap(other, candidate, 0.5, true)
            {
                continue;
            }
            if !fwhm_ranges_overlap(other.fwhm_range(), candidate.fwhm_range()) {
                continue;
            }
            donated.extend(
                other
                    .iter()
                    .filter(|s| !candidate.contains_trace(s.trace_index))
                    .copied(),
            );
            consumed.push(j);
        }

        if consumed.len() > 1 {
            donated.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
            let mut seen = HashSet::new();
            donated.retain(|s| seen.insert(s.trace_index));

            let mut merged = merge_seeds(candidate, donated, scorer);
            if scorer.score_and_filter(&mut merged, min_isotope_cosine) {
                trace!(
                    "Merged {} groups into {:0.3}",
                    consumed.len(),
                    merged.monoisotopic_mass()
                );
                refined.push(merged);
            } else {
                let mut original = candidate.clone();
                if scorer.score_and_filter(&mut original, min_isotope_cosine) {
                    refined.push(original);
                }
            }
        } else {
            let mut original = candidate.clone();
            if scorer.score_and_filter(&mut original, min_isotope_cosine) {
                refined.push(original);
            }
        }

        consumed.sort_unstable();
        for j in consumed.into_iter().rev() {
            groups.remove(j);
        }
    }
    debug!("{} feature groups after refinement", refined.len());
    refined
}
