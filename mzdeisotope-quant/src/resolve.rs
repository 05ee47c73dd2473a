/*! Divide the signal of traces shared by several feature groups.

Within a [`GroupCluster`], groups without evidence of their own and harmonic artifacts are
removed first. The remaining shared traces are visited in order of decreasing intensity. Each
one seeds a conflict region, the set of per-charge features and shared traces transitively
connected to it. Every feature in the region fits an elution model to its unique traces, and
each shared trace is split between the competing features by non-negative least squares over
the normalized model predictions.
*/
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Write;

use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::averagine::ISOTOPE_MASS_DIFF;
use crate::elution::{ElutionModel, ElutionModelFitter, WeightedTrace};
use crate::error::QuantError;
use crate::graph::{GroupCluster, TraceSharingIndex};
use crate::group::FeatureGroup;
use crate::nnls::nnls;
use crate::refine::trace_indices_overlap;
use crate::report::{SharedSignalReport, TraceType};
use crate::scoring::Scorer;
use crate::seed::FeatureSeed;
use crate::trace::MassTrace;

const HARMONIC_TOLERANCE_PPM: f64 = 20.0;

/// One charge state of one feature group within a conflict region
#[derive(Debug)]
struct ConflictFeature<M> {
    group: usize,
    charge: i32,
    unique: Vec<FeatureSeed>,
    /// Indices of the shared traces this feature competes for
    shared: Vec<usize>,
    weights: Vec<f64>,
    model: Option<M>,
    /// The fraction of each shared trace given to this feature
    ratios: Vec<(usize, f64)>,
}

impl<M> ConflictFeature<M> {
    fn owns(&self, trace_index: usize) -> bool {
        self.shared.contains(&trace_index)
    }
}

#[derive(Debug, Default)]
struct SharedTrace {
    intensity: f64,
    features: Vec<(usize, i32)>,
}

pub struct ConflictResolver<'a, E: ElutionModelFitter> {
    pub scorer: Scorer<'a>,
    pub fitter: &'a E,
    pub use_smoothed: bool,
}

impl<'a, E: ElutionModelFitter> ConflictResolver<'a, E> {
    pub fn new(scorer: Scorer<'a>, fitter: &'a E, use_smoothed: bool) -> Self {
        Self {
            scorer,
            fitter,
            use_smoothed,
        }
    }

    fn harmonic_masses(&self, mass: f64) -> Vec<f64> {
        let params = self.scorer.params;
        let mut masses = Vec::new();
        for ratio in 2..=7 {
            let ratio = ratio as f64;
            for iso in -2..=2 {
                let shifted = mass + iso as f64 * ISOTOPE_MASS_DIFF;
                let lower = shifted / ratio;
                if lower > params.min_mass {
                    masses.push(lower);
                }
                let upper = shifted * ratio;
                if upper < params.max_mass {
                    masses.push(upper);
                }
            }
        }
        masses
    }

    /// Remove groups with no unique trace and the weaker member of every harmonic pair,
    /// detaching their links to shared traces. Returns the surviving group indices.
    fn filter_candidates(
        &self,
        cluster: &GroupCluster,
        groups: &[FeatureGroup],
        index: &mut TraceSharingIndex,
    ) -> Vec<usize> {
        let candidates = &cluster.groups;
        let mut removed = vec![false; candidates.len()];

        for (i, g) in candidates.iter().copied().enumerate() {
            if removed[i] {
                continue;
            }
            let group = &groups[g];
            if group.iter().all(|s| index.is_shared(s.trace_index)) {
                trace!("Removing {:0.3}, it has no unique traces", group.monoisotopic_mass());
                removed[i] = true;
                continue;
            }
            let harmonics = self.harmonic_masses(group.monoisotopic_mass());
            for (j, h) in candidates.iter().copied().enumerate().skip(i + 1) {
                if removed[j] {
                    continue;
                }
                let other = &groups[h];
                let other_mass = other.monoisotopic_mass();
                let tolerance = other_mass * HARMONIC_TOLERANCE_PPM * 1e-6;
                if !harmonics.iter().any(|m| (m - other_mass).abs() <= tolerance) {
                    continue;
                }
                let (weaker, weaker_pos) = if group.intensity() < other.intensity() {
                    (group, i)
                } else {
                    (other, j)
                };
                let drop = if trace_indices_overlap(group, other, 0.5, false) {
                    true
                } else {
                    let shared = weaker.iter().filter(|s| index.is_shared(s.trace_index)).count();
                    weaker.len() - shared < weaker.charges().len()
                };
                if drop {
                    trace!(
                        "Removing harmonic {:0.3} of {:0.3}",
                        weaker.monoisotopic_mass(),
                        if weaker_pos == i { other_mass } else { group.monoisotopic_mass() }
                    );
                    removed[weaker_pos] = true;
                }
            }
        }

        for (i, g) in candidates.iter().copied().enumerate() {
            if !removed[i] {
                continue;
            }
            for t in groups[g].trace_indices() {
                if index.link_count(*t) > 1 {
                    index.remove_link(*t, g);
                }
            }
        }
        candidates
            .iter()
            .zip(removed)
            .filter(|(_, r)| !r)
            .map(|(g, _)| *g)
            .collect()
    }

    fn collect_shared_traces(
        &self,
        candidates: &[usize],
        groups: &[FeatureGroup],
        index: &TraceSharingIndex,
    ) -> BTreeMap<usize, SharedTrace> {
        let mut shared: BTreeMap<usize, SharedTrace> = BTreeMap::new();
        for g in candidates.iter().copied() {
            for seed in groups[g].iter() {
                if index.link_count(seed.trace_index) < 2 {
                    continue;
                }
                let entry = shared.entry(seed.trace_index).or_insert_with(|| SharedTrace {
                    intensity: seed.intensity,
                    features: Vec::new(),
                });
                if !entry.features.contains(&(g, seed.charge)) {
                    entry.features.push((g, seed.charge));
                }
            }
        }
        shared
    }

    /// Build the per-charge feature of `group` at `charge`, borrowing the most abundant unshared
    /// trace of another charge state if it has no unique trace at this one
    fn build_feature(
        &self,
        g: usize,
        charge: i32,
        groups: &[FeatureGroup],
        index: &TraceSharingIndex,
    ) -> Option<ConflictFeature<E::Model>> {
        let group = &groups[g];
        let mut unique = Vec::new();
        let mut shared = Vec::new();
        for seed in group.iter().filter(|s| s.charge == charge) {
            if index.link_count(seed.trace_index) >= 2 {
                shared.push(seed.trace_index);
            } else {
                unique.push(*seed);
            }
        }
        if unique.is_empty() {
            let borrowed = group
                .iter()
                .filter(|s| {
                    s.charge != charge && !index.is_shared(s.trace_index) && s.intensity > 0.0
                })
                .max_by(|a, b| a.intensity.total_cmp(&b.intensity))?;
            unique.push(*borrowed);
        }
        Some(ConflictFeature {
            group: g,
            charge,
            unique,
            shared,
            weights: Vec::new(),
            model: None,
            ratios: Vec::new(),
        })
    }

    fn assign_weights(&self, features: &mut [ConflictFeature<E::Model>], groups: &[FeatureGroup]) {
        let mut minimum = 1.0f64;
        for feature in features.iter_mut() {
            let distribution = self
                .scorer
                .averagine
                .get(groups[feature.group].monoisotopic_mass());
            feature.weights = feature
                .unique
                .iter()
                .map(|seed| {
                    if seed.charge != feature.charge {
                        -1.0
                    } else if seed.isotope_index >= 0
                        && (seed.isotope_index as usize) < distribution.len()
                    {
                        let w = distribution.get(seed.isotope_index as isize);
                        minimum = minimum.min(w);
                        w
                    } else {
                        0.0
                    }
                })
                .collect();
        }
        let minimum = minimum.max(0.0);
        for feature in features.iter_mut() {
            for w in feature.weights.iter_mut() {
                if *w < 0.0 {
                    *w = minimum;
                }
            }
        }
    }

    fn fit_models(&self, features: &mut [ConflictFeature<E::Model>], traces: &[MassTrace]) {
        for feature in features.iter_mut() {
            let observations: Vec<WeightedTrace> = feature
                .unique
                .iter()
                .zip(feature.weights.iter())
                .map(|(seed, w)| {
                    let trace = &traces[seed.trace_index];
                    WeightedTrace::new(trace.times(), trace.profile(self.use_smoothed), *w)
                        .nonzero()
                })
                .collect();
            let model = self.fitter.fit(&observations);
            if model.is_valid() {
                feature.model = Some(model);
            } else {
                debug!(
                    "Elution model for group {} charge {} has no valid area",
                    feature.group, feature.charge
                );
            }
        }
    }

    /// Split `trace_index` between the features competing for it, recording each feature's
    /// ratio. The ratios never sum to more than one.
    fn apportion<W: Write>(
        &self,
        trace_index: usize,
        features: &mut [ConflictFeature<E::Model>],
        groups: &[FeatureGroup],
        traces: &[MassTrace],
        report: &mut Option<&mut SharedSignalReport<W>>,
    ) -> Result<(), QuantError> {
        let trace = &traces[trace_index];
        let times = trace.times();
        let observed = trace.profile(self.use_smoothed);

        let competing: Vec<usize> = (0..features.len())
            .filter(|i| features[*i].owns(trace_index))
            .collect();
        let mut columns: Vec<(usize, Vec<f64>)> = Vec::new();
        for i in competing.iter().copied() {
            let Some(model) = features[i].model.as_ref() else {
                continue;
            };
            let mut component = model.values_at(&times);
            let total: f64 = component.iter().sum();
            if !(total > 0.0) {
                continue;
            }
            component.iter_mut().for_each(|v| *v /= total);
            columns.push((i, component));
        }

        let mut ratios: Vec<(usize, f64)> = competing.iter().map(|i| (*i, 0.0)).collect();
        let set_ratio = |ratios: &mut Vec<(usize, f64)>, i: usize, r: f64| {
            if let Some(slot) = ratios.iter_mut().find(|(j, _)| *j == i) {
                slot.1 = r;
            }
        };

        let observed_total: f64 = observed.iter().sum();
        if columns.len() >= 2 && observed_total > 0.0 {
            let b = DVector::from_iterator(observed.len(), observed.iter().map(|v| v / observed_total));
            let a = DMatrix::from_fn(times.len(), columns.len(), |r, c| columns[c].1[r]);
            let mut x = nnls(&a, &b);
            let nonzero: Vec<usize> = (0..x.len()).filter(|k| x[*k] > 0.0).collect();
            if nonzero.len() == 1 {
                x[nonzero[0]] = 1.0;
            }
            let sum = x.sum();
            if sum > 1.0 {
                x /= sum;
            }
            for (k, (i, _)) in columns.iter().enumerate() {
                set_ratio(&mut ratios, *i, x[k]);
            }
        } else if let Some((i, _)) = columns.first() {
            set_ratio(&mut ratios, *i, 1.0);
        } else {
            debug!("No valid elution model competes for trace {trace_index}, it is dropped");
        }

        if let Some(report) = report.as_mut() {
            for (i, ratio) in ratios.iter().copied() {
                let feature = &features[i];
                let group = &groups[feature.group];
                let Some(pos) = group.find_seed(trace_index, feature.charge) else {
                    continue;
                };
                let component = columns
                    .iter()
                    .find(|(j, _)| *j == i)
                    .map(|(_, c)| c.clone())
                    .unwrap_or_else(|| vec![0.0; times.len()]);
                report.write_shape(
                    feature.group,
                    group.monoisotopic_mass(),
                    &group.seeds()[pos],
                    trace,
                    ratio,
                    &component,
                )?;
            }
        }

        for (i, ratio) in ratios {
            trace!(
                "Trace {trace_index} gives {ratio:0.3} to group {} charge {}",
                features[i].group,
                features[i].charge
            );
            features[i].ratios.push((trace_index, ratio));
        }
        Ok(())
    }

    /// Replace each apportioned seed with one reading a scaled copy of its trace, appended to
    /// the trace arena, or remove it if it was given nothing
    fn write_back(
        &self,
        features: &[ConflictFeature<E::Model>],
        groups: &mut [FeatureGroup],
        index: &mut TraceSharingIndex,
        traces: &mut Vec<MassTrace>,
    ) {
        for feature in features.iter() {
            let g = feature.group;
            for (trace_index, ratio) in feature.ratios.iter().copied() {
                if ratio == 1.0 {
                    continue;
                }
                let Some(pos) = groups[g].find_seed(trace_index, feature.charge) else {
                    continue;
                };
                if ratio == 0.0 {
                    let charge = feature.charge;
                    groups[g].retain_seeds(|s| !(s.trace_index == trace_index && s.charge == charge));
                } else {
                    let scaled = traces[trace_index].scaled(ratio, self.use_smoothed);
                    let new_index = traces.len();
                    let seed = groups[g].seeds()[pos].with_trace(new_index, &scaled);
                    traces.push(scaled);
                    groups[g].replace_seed(pos, seed);
                    index.set_links(new_index, vec![g]);
                }
                if !groups[g].contains_trace(trace_index) {
                    index.remove_link(trace_index, g);
                }
            }
        }
    }

    fn finalize<W: Write>(
        &self,
        g: usize,
        groups: &mut [FeatureGroup],
        traces: &[MassTrace],
        report: &mut Option<&mut SharedSignalReport<W>>,
    ) -> Result<Option<FeatureGroup>, QuantError> {
        let group = &mut groups[g];
        group.retain_seeds(|s| s.intensity > 0.0);
        if group.len() < self.scorer.params.min_traces_per_group {
            return Ok(None);
        }
        if !self.scorer.rescore(group) {
            return Ok(None);
        }
        self.scorer.shape_results(group);
        if let Some(report) = report.as_mut() {
            for seed in group.iter() {
                report.write_seed(
                    g,
                    TraceType::SharedAfter,
                    group.monoisotopic_mass(),
                    seed,
                    &traces[seed.trace_index],
                )?;
            }
        }
        Ok(Some(std::mem::take(group)))
    }

    /// Resolve one cluster, returning the feature groups that survive it.
    ///
    /// New scaled traces are appended to `traces`, existing traces are never modified.
    pub fn resolve_cluster<W: Write>(
        &self,
        cluster: &GroupCluster,
        groups: &mut [FeatureGroup],
        index: &mut TraceSharingIndex,
        traces: &mut Vec<MassTrace>,
        mut report: Option<&mut SharedSignalReport<W>>,
    ) -> Result<Vec<FeatureGroup>, QuantError> {
        let mut resolved = Vec::new();
        if cluster.len() == 1 {
            let g = cluster.groups[0];
            if self.scorer.rescore(&mut groups[g]) {
                self.scorer.shape_results(&mut groups[g]);
                resolved.push(std::mem::take(&mut groups[g]));
            }
            return Ok(resolved);
        }

        if let Some(report) = report.as_mut() {
            for g in cluster.groups.iter().copied() {
                let group = &groups[g];
                for seed in group.iter() {
                    let kind = if index.is_shared(seed.trace_index) {
                        TraceType::SharedBefore
                    } else {
                        TraceType::Unique
                    };
                    report.write_seed(g, kind, group.monoisotopic_mass(), seed, &traces[seed.trace_index])?;
                }
            }
        }

        let candidates = self.filter_candidates(cluster, groups, index);
        trace!(
            "{} of {} groups in the cluster survive filtering",
            candidates.len(),
            cluster.len()
        );
        if candidates.len() < 2 {
            for g in candidates {
                if let Some(group) = self.finalize(g, groups, traces, &mut report)? {
                    resolved.push(group);
                }
            }
            return Ok(resolved);
        }

        let mut shared = self.collect_shared_traces(&candidates, groups, index);
        let mut pending: Vec<usize> = shared.keys().copied().collect();
        pending.sort_by(|a, b| shared[b].intensity.total_cmp(&shared[a].intensity));

        while let Some(start) = pending.first().copied() {
            let mut region_traces: Vec<usize> = Vec::new();
            let mut features: Vec<ConflictFeature<E::Model>> = Vec::new();
            let mut not_for_resolution: Vec<(usize, i32)> = Vec::new();
            let mut seen_traces = HashSet::new();
            let mut seen_features = HashSet::new();

            let mut queue = VecDeque::from(vec![start]);
            while let Some(t) = queue.pop_front() {
                if !seen_traces.insert(t) {
                    continue;
                }
                region_traces.push(t);
                let Some(entry) = shared.get(&t) else {
                    continue;
                };
                for key in entry.features.iter().copied() {
                    if !seen_features.insert(key) {
                        continue;
                    }
                    match self.build_feature(key.0, key.1, groups, index) {
                        Some(feature) => {
                            queue.extend(feature.shared.iter().copied());
                            features.push(feature);
                        }
                        None => not_for_resolution.push(key),
                    }
                }
            }
            pending.retain(|t| !seen_traces.contains(t));

            for (g, charge) in not_for_resolution {
                trace!("Group {g} charge {charge} has only shared evidence");
                groups[g].retain_seeds(|s| s.charge != charge);
                let max_isotopes = self.scorer.max_isotope_count(groups[g].monoisotopic_mass());
                groups[g].update_for_scoring(max_isotopes);
                for t in region_traces.iter() {
                    if let Some(entry) = shared.get_mut(t) {
                        entry.features.retain(|k| *k != (g, charge));
                    }
                    if !groups[g].contains_trace(*t) {
                        index.remove_link(*t, g);
                    }
                }
            }

            let mut conflicting = Vec::new();
            for t in region_traces.iter().copied() {
                let owners = shared.get(&t).map(|e| e.features.clone()).unwrap_or_default();
                match owners.len() {
                    0 => index.set_links(t, Vec::new()),
                    1 => {
                        let (g, charge) = owners[0];
                        index.set_links(t, vec![g]);
                        if let Some(feature) = features
                            .iter_mut()
                            .find(|f| f.group == g && f.charge == charge)
                        {
                            feature.shared.retain(|s| *s != t);
                            if let Some(pos) = groups[g].find_seed(t, charge) {
                                feature.unique.push(groups[g].seeds()[pos]);
                            }
                        }
                    }
                    _ => conflicting.push(t),
                }
            }
            features.retain(|f| !f.shared.is_empty());
            if features.len() < 2 {
                continue;
            }

            self.assign_weights(&mut features, groups);
            self.fit_models(&mut features, traces);
            for t in conflicting.iter().copied() {
                self.apportion(t, &mut features, groups, traces, &mut report)?;
            }
            self.write_back(&features, groups, index, traces);
        }

        for g in candidates {
            if let Some(group) = self.finalize(g, groups, traces, &mut report)? {
                resolved.push(group);
            }
        }
        Ok(resolved)
    }
}
