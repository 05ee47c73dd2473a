/*! Elution profile models and their fitting.

Profiles are fit with `mzsignal`'s peak shape models. Several traces believed to share one
elution shape are first pooled into a single profile, the least squares estimate of that shape
given each trace's expected share of the signal, and the pooled profile is then fit as a
[`MultiPeakShapeFit`].
*/
use mzpeaks::{feature::Feature, prelude::*, Time, MZ};
use mzsignal::feature_statistics::{FitConfig, FitPeaksOn, MultiPeakShapeFit};
use tracing::trace;

/// Observations closer together than this are treated as the same time point
const TIME_MATCH_TOLERANCE: f64 = 1e-6;

/// The number of grid steps used to integrate a fitted profile
const AREA_GRID_STEPS: f64 = 1000.0;

/// A set of elution profile observations and the weight they carry in a joint fit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightedTrace {
    pub times: Vec<f64>,
    pub intensities: Vec<f64>,
    pub weight: f64,
}

impl WeightedTrace {
    pub fn new(times: Vec<f64>, intensities: Vec<f64>, weight: f64) -> Self {
        Self {
            times,
            intensities,
            weight,
        }
    }

    /// Drop zero-intensity observations
    pub fn nonzero(mut self) -> Self {
        let (times, intensities): (Vec<f64>, Vec<f64>) = self
            .times
            .iter()
            .copied()
            .zip(self.intensities.iter().copied())
            .filter(|(_, i)| *i > 0.0)
            .unzip();
        self.times = times;
        self.intensities = intensities;
        self
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    fn is_usable(&self) -> bool {
        self.weight > 0.0 && self.weight.is_finite() && !self.is_empty()
    }
}

/// A continuous elution profile
pub trait ElutionModel {
    fn area(&self) -> f64;

    fn value_at(&self, time: f64) -> f64;

    /// A model whose area is not a positive number must not be used
    fn is_valid(&self) -> bool {
        let area = self.area();
        area.is_finite() && area > 0.0
    }

    fn values_at(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|t| self.value_at(*t)).collect()
    }
}

/// Fits an [`ElutionModel`] to one or more weighted traces sharing the same shape
pub trait ElutionModelFitter {
    type Model: ElutionModel;

    fn fit(&self, traces: &[WeightedTrace]) -> Self::Model;
}

/// Pool `traces` into one profile on the union of their time points.
///
/// At each time the pooled value is `sum(w * I) / sum(w^2)` over the traces observed there, the
/// least squares estimate of a shape `h` with `I ~ w * h`.
pub fn pool_weighted_traces(traces: &[WeightedTrace]) -> Feature<MZ, Time> {
    let mut points: Vec<(f64, f64, f64)> = traces
        .iter()
        .filter(|t| t.is_usable())
        .flat_map(|t| {
            t.times
                .iter()
                .copied()
                .zip(t.intensities.iter().copied())
                .map(move |(time, intensity)| (time, intensity, t.weight))
        })
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut pooled: Feature<MZ, Time> = Feature::default();
    let mut current: Option<(f64, f64, f64)> = None;
    for (time, intensity, weight) in points {
        match current.as_mut() {
            Some((t, num, den)) if (time - *t).abs() <= TIME_MATCH_TOLERANCE => {
                *num += weight * intensity;
                *den += weight * weight;
            }
            _ => {
                if let Some((t, num, den)) = current.take() {
                    pooled.push_raw(0.0, t, (num / den) as f32);
                }
                current = Some((time, weight * intensity, weight * weight));
            }
        }
    }
    if let Some((t, num, den)) = current {
        pooled.push_raw(0.0, t, (num / den) as f32);
    }
    pooled
}

/// A fitted elution profile, the sum of one or more peak shapes
#[derive(Debug, Clone, Default)]
pub struct PeakShapeElutionModel {
    pub fit: MultiPeakShapeFit,
    pub score: f64,
    area: f64,
}

impl PeakShapeElutionModel {
    /// Wrap `fit`, integrating it over `(start, end)` widened by the span on either side
    pub fn new(fit: MultiPeakShapeFit, score: f64, start: f64, end: f64) -> Self {
        let area = if fit.fits.is_empty() || !(end >= start) {
            f64::NAN
        } else {
            let span = (end - start).max(1.0);
            let step = 3.0 * span / AREA_GRID_STEPS;
            let grid = mzsignal::gridspace(start - span, end + span + step, step);
            let values = fit.predict(&grid);
            mzsignal::trapz(&grid, &values)
        };
        Self { fit, score, area }
    }

    pub fn invalid() -> Self {
        Self {
            fit: MultiPeakShapeFit::default(),
            score: 0.0,
            area: f64::NAN,
        }
    }
}

impl ElutionModel for PeakShapeElutionModel {
    fn area(&self) -> f64 {
        self.area
    }

    fn value_at(&self, time: f64) -> f64 {
        self.fit.density(time).max(0.0)
    }
}

/// Fits a [`PeakShapeElutionModel`] with `mzsignal`'s splitting peak shape fitter
#[derive(Debug, Clone)]
pub struct PeakShapeFitter {
    pub config: FitConfig,
    /// Profiles with fewer points than this are not fit
    pub min_points: usize,
}

impl Default for PeakShapeFitter {
    fn default() -> Self {
        Self {
            config: FitConfig::default(),
            min_points: 4,
        }
    }
}

impl PeakShapeFitter {
    pub fn new(config: FitConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}

impl ElutionModelFitter for PeakShapeFitter {
    type Model = PeakShapeElutionModel;

    fn fit(&self, traces: &[WeightedTrace]) -> PeakShapeElutionModel {
        let pooled = pool_weighted_traces(traces);
        if pooled.len() < self.min_points {
            return PeakShapeElutionModel::invalid();
        }
        let (Some(start), Some(end)) = (pooled.start_time(), pooled.end_time()) else {
            return PeakShapeElutionModel::invalid();
        };
        let fitter = pooled.fit_peaks_with(self.config.clone());
        let score = fitter.score();
        trace!(
            "Fit {} peak shapes to {} points with score {score:0.3}",
            fitter.peak_fits.fits.len(),
            pooled.len()
        );
        PeakShapeElutionModel::new(fitter.peak_fits, score, start, end)
    }
}
