//! Mass traces, the elution profiles of a single ion species over retention time.
use std::fmt::Debug;

use mzpeaks::{feature::Feature, prelude::*, Time, MZ};
use mzsignal::feature_statistics::FeatureTransform;

/// A single observation along a [`MassTrace`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracePoint {
    pub time: f64,
    pub mz: f64,
    pub intensity: f32,
}

impl TracePoint {
    pub fn new(time: f64, mz: f64, intensity: f32) -> Self {
        Self {
            time,
            mz,
            intensity,
        }
    }
}

/// An ordered series of (time, m/z, intensity) observations for one ion, with cached
/// aggregate attributes.
///
/// The trace is never mutated once built. Scaling produces a new trace via [`MassTrace::scaled`].
#[derive(Clone)]
pub struct MassTrace {
    feature: Feature<MZ, Time>,
    smoothed: Option<Vec<f32>>,
    centroid_mz: f64,
    total_intensity: f64,
    fwhm_start: f64,
    fwhm_end: f64,
}

impl Debug for MassTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MassTrace")
            .field("centroid_mz", &self.centroid_mz)
            .field("total_intensity", &self.total_intensity)
            .field("fwhm_start", &self.fwhm_start)
            .field("fwhm_end", &self.fwhm_end)
            .field("len", &self.len())
            .finish()
    }
}

impl MassTrace {
    pub fn new(feature: Feature<MZ, Time>) -> Self {
        let mut this = Self {
            feature,
            smoothed: None,
            centroid_mz: 0.0,
            total_intensity: 0.0,
            fwhm_start: 0.0,
            fwhm_end: 0.0,
        };
        this.invalidate();
        this.estimate_fwhm(false);
        this
    }

    pub fn empty() -> Self {
        Self::new(build_feature(std::iter::empty()))
    }

    pub fn from_points<I: IntoIterator<Item = TracePoint>>(points: I) -> Self {
        Self::new(build_feature(
            points.into_iter().map(|p| (p.mz, p.time, p.intensity)),
        ))
    }

    /// Attach a smoothed intensity profile and re-estimate the FWHM from it.
    ///
    /// A profile whose length differs from the trace is ignored.
    pub fn with_smoothed_intensities(mut self, smoothed: Vec<f32>) -> Self {
        if smoothed.len() != self.len() {
            tracing::debug!(
                "Ignoring smoothed profile of length {} for a trace of length {}",
                smoothed.len(),
                self.len()
            );
            return self;
        }
        self.smoothed = Some(smoothed);
        self.estimate_fwhm(true);
        self
    }

    /// Attach a moving average of the raw profile over `size * 3` points as the smoothed profile
    pub fn smoothed(self, size: usize) -> Self {
        let mut feature = self.feature.clone();
        feature.smooth(size);
        let smoothed = feature.intensity_view().to_vec();
        self.with_smoothed_intensities(smoothed)
    }

    /// Override the FWHM boundaries, e.g. with values reported by an upstream trace detector
    pub fn with_fwhm(mut self, start: f64, end: f64) -> Self {
        self.fwhm_start = start.min(end);
        self.fwhm_end = start.max(end);
        self
    }

    fn invalidate(&mut self) {
        let mut weighted_mz = 0.0;
        let mut total = 0.0;
        for (mz, _, intensity) in self.points() {
            let intensity = intensity as f64;
            weighted_mz += mz * intensity;
            total += intensity;
        }
        self.total_intensity = total;
        self.centroid_mz = if total > 0.0 {
            weighted_mz / total
        } else {
            let n = self.len();
            if n == 0 {
                0.0
            } else {
                self.points().map(|(mz, _, _)| mz).sum::<f64>() / n as f64
            }
        };
    }

    /// Estimate the full-width-at-half-maximum boundaries from either the raw or the smoothed
    /// profile, linearly interpolating the half-maximum crossing on either side of the apex.
    pub fn estimate_fwhm(&mut self, use_smoothed: bool) {
        let times = self.times();
        let values = self.profile(use_smoothed);
        let (start, end) = half_max_bounds(&times, &values).unwrap_or((0.0, 0.0));
        self.fwhm_start = start;
        self.fwhm_end = end;
    }

    fn points(&self) -> impl Iterator<Item = (f64, f64, f32)> + '_ {
        <Feature<MZ, Time> as FeatureLike<MZ, Time>>::iter(&self.feature)
    }

    pub fn len(&self) -> usize {
        <Feature<MZ, Time> as FeatureLike<MZ, Time>>::len(&self.feature)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = TracePoint> + '_ {
        self.points()
            .map(|(mz, time, intensity)| TracePoint::new(time, mz, intensity))
    }

    pub fn as_feature(&self) -> &Feature<MZ, Time> {
        &self.feature
    }

    pub fn smoothed_intensities(&self) -> Option<&[f32]> {
        self.smoothed.as_deref()
    }

    pub fn times(&self) -> Vec<f64> {
        self.points().map(|(_, time, _)| time).collect()
    }

    pub fn mzs(&self) -> Vec<f64> {
        self.points().map(|(mz, _, _)| mz).collect()
    }

    pub fn raw_intensities(&self) -> Vec<f64> {
        self.points().map(|(_, _, i)| i as f64).collect()
    }

    /// The intensity profile, smoothed if requested and available
    pub fn profile(&self, use_smoothed: bool) -> Vec<f64> {
        match (&self.smoothed, use_smoothed) {
            (Some(smoothed), true) => smoothed.iter().map(|i| *i as f64).collect(),
            _ => self.raw_intensities(),
        }
    }

    pub fn centroid_mz(&self) -> f64 {
        self.centroid_mz
    }

    /// The sum of the raw intensities of the trace
    pub fn total_intensity(&self) -> f64 {
        self.total_intensity
    }

    /// The most intense raw observation
    pub fn apex(&self) -> Option<TracePoint> {
        self.iter()
            .fold(None, |best: Option<TracePoint>, p| match best {
                Some(b) if b.intensity >= p.intensity => Some(b),
                _ => Some(p),
            })
    }

    pub fn apex_time(&self) -> f64 {
        self.apex().map(|p| p.time).unwrap_or_default()
    }

    pub fn fwhm_start(&self) -> f64 {
        self.fwhm_start
    }

    pub fn fwhm_end(&self) -> f64 {
        self.fwhm_end
    }

    pub fn fwhm(&self) -> f64 {
        self.fwhm_end - self.fwhm_start
    }

    pub fn fwhm_range(&self) -> (f64, f64) {
        (self.fwhm_start, self.fwhm_end)
    }

    /// Build a new trace whose raw and smoothed intensities are multiplied by `ratio`.
    ///
    /// A zero ratio yields an empty trace.
    pub fn scaled(&self, ratio: f64, use_smoothed: bool) -> MassTrace {
        if ratio == 0.0 {
            return MassTrace::empty();
        }
        let feature = build_feature(
            self.points()
                .map(|(mz, time, intensity)| (mz, time, (intensity as f64 * ratio) as f32)),
        );
        let smoothed = self
            .smoothed
            .as_ref()
            .map(|s| s.iter().map(|i| (*i as f64 * ratio) as f32).collect());
        let mut trace = Self {
            feature,
            smoothed,
            centroid_mz: 0.0,
            total_intensity: 0.0,
            fwhm_start: 0.0,
            fwhm_end: 0.0,
        };
        trace.invalidate();
        trace.estimate_fwhm(use_smoothed);
        trace
    }
}

impl From<Feature<MZ, Time>> for MassTrace {
    fn from(value: Feature<MZ, Time>) -> Self {
        Self::new(value)
    }
}

impl FromIterator<TracePoint> for MassTrace {
    fn from_iter<T: IntoIterator<Item = TracePoint>>(iter: T) -> Self {
        Self::from_points(iter)
    }
}

impl PartialEq for MassTrace {
    fn eq(&self, other: &Self) -> bool {
        self.feature == other.feature && self.smoothed == other.smoothed
    }
}

impl PartialOrd for MassTrace {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self == other {
            return Some(std::cmp::Ordering::Equal);
        }
        match self.centroid_mz.total_cmp(&other.centroid_mz) {
            std::cmp::Ordering::Equal => {}
            x => return Some(x),
        };
        self.feature.start_time().partial_cmp(&other.feature.start_time())
    }
}

impl CoordinateLike<MZ> for MassTrace {
    fn coordinate(&self) -> f64 {
        self.centroid_mz
    }
}

impl IntensityMeasurement for MassTrace {
    fn intensity(&self) -> f32 {
        self.total_intensity as f32
    }
}

fn build_feature<I: Iterator<Item = (f64, f64, f32)>>(points: I) -> Feature<MZ, Time> {
    let mut feature = Feature::default();
    for (mz, time, intensity) in points {
        feature.push_raw(mz, time, intensity);
    }
    feature
}

fn interpolate_crossing(t0: f64, v0: f64, t1: f64, v1: f64, target: f64) -> f64 {
    let dv = v1 - v0;
    if dv.abs() < f64::EPSILON {
        (t0 + t1) / 2.0
    } else {
        t0 + (target - v0) * (t1 - t0) / dv
    }
}

pub(crate) fn half_max_bounds(times: &[f64], values: &[f64]) -> Option<(f64, f64)> {
    if times.is_empty() || times.len() != values.len() {
        return None;
    }
    let (apex, max) = values
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });
    if max <= 0.0 {
        return Some((times[apex], times[apex]));
    }
    let half = max / 2.0;

    let mut left = apex;
    while left > 0 && values[left - 1] >= half {
        left -= 1;
    }
    let start = if left == 0 {
        times[0]
    } else {
        interpolate_crossing(
            times[left - 1],
            values[left - 1],
            times[left],
            values[left],
            half,
        )
    };

    let last = values.len() - 1;
    let mut right = apex;
    while right < last && values[right + 1] >= half {
        right += 1;
    }
    let end = if right == last {
        times[last]
    } else {
        interpolate_crossing(
            times[right],
            values[right],
            times[right + 1],
            values[right + 1],
            half,
        )
    };
    Some((start, end))
}
