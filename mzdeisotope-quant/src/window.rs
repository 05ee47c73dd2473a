//! Slide a retention time window over [`FeatureSeed`]s to build synthetic spectra
use std::iter::FusedIterator;

use crate::seed::FeatureSeed;

/// A synthetic single-scan spectrum made of the seeds eluting within one window
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoSpectrum {
    /// The window boundary the spectrum was built at
    pub time: f64,
    /// Seed indices, sorted by m/z
    pub members: Vec<usize>,
}

/// An iterator over [`PseudoSpectrum`]s.
///
/// The window advances by the narrowest seed FWHM, floored at one time unit. A spectrum is
/// produced only when the advance admitted new seeds, after evicting seeds whose FWHM ended
/// before the boundary. A seed is never evicted in the step that admitted it.
#[derive(Debug)]
pub struct WindowIter<'a> {
    seeds: &'a [FeatureSeed],
    order: Vec<usize>,
    cursor: usize,
    boundary: f64,
    width: f64,
    last_end: f64,
    active: Vec<usize>,
}

impl<'a> WindowIter<'a> {
    pub fn new(seeds: &'a [FeatureSeed]) -> Self {
        let mut order: Vec<usize> = (0..seeds.len()).collect();
        order.sort_by(|a, b| {
            let a = &seeds[*a];
            let b = &seeds[*b];
            a.fwhm_start
                .total_cmp(&b.fwhm_start)
                .then(a.fwhm_end.total_cmp(&b.fwhm_end))
        });
        let width = seeds
            .iter()
            .map(|s| s.fwhm_end - s.fwhm_start)
            .fold(f64::INFINITY, f64::min)
            .max(1.0);
        let boundary = order
            .first()
            .map(|i| seeds[*i].fwhm_start)
            .unwrap_or_default();
        let last_end = seeds
            .iter()
            .map(|s| s.fwhm_end)
            .fold(f64::NEG_INFINITY, f64::max);
        Self {
            seeds,
            order,
            cursor: 0,
            boundary,
            width,
            last_end,
            active: Vec::new(),
        }
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    fn advance(&mut self) -> Option<PseudoSpectrum> {
        while self.cursor < self.order.len() && self.boundary < self.last_end {
            self.boundary += self.width;

            let admitted_from = self.active.len();
            while self.cursor < self.order.len()
                && self.seeds[self.order[self.cursor]].fwhm_start <= self.boundary
            {
                self.active.push(self.order[self.cursor]);
                self.cursor += 1;
            }
            if self.active.len() == admitted_from {
                continue;
            }

            let boundary = self.boundary;
            let seeds = self.seeds;
            let kept: Vec<usize> = self
                .active
                .iter()
                .enumerate()
                .filter(|(i, j)| *i >= admitted_from || seeds[**j].fwhm_end >= boundary)
                .map(|(_, j)| *j)
                .collect();
            self.active = kept;
            if self.active.is_empty() {
                continue;
            }

            let mut members = self.active.clone();
            members.sort_by(|a, b| seeds[*a].centroid_mz.total_cmp(&seeds[*b].centroid_mz));
            return Some(PseudoSpectrum { time: boundary, members });
        }
        None
    }
}

impl Iterator for WindowIter<'_> {
    type Item = PseudoSpectrum;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance()
    }
}

impl FusedIterator for WindowIter<'_> {}
