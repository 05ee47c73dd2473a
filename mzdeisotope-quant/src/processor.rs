use std::io::Write;

use tracing::{debug, info};

#[cfg(feature = "parallelism")]
use rayon::prelude::*;

use crate::averagine::{PrecalculatedAveragine, DEFAULT_MASS_STEP};
use crate::config::QuantParams;
use crate::deconvolution::{DeconvolutionDriver, SpectrumDeconvolver};
use crate::elution::{ElutionModelFitter, PeakShapeFitter};
use crate::error::QuantError;
use crate::graph::TraceSharingIndex;
use crate::group::FeatureGroup;
use crate::refine::refine_feature_groups;
use crate::report::SharedSignalReport;
use crate::resolve::ConflictResolver;
use crate::scoring::Scorer;
use crate::seed::FeatureSeed;
use crate::trace::MassTrace;
use crate::window::{PseudoSpectrum, WindowIter};

pub type ReportWriter = Box<dyn Write + Send>;

/// The bound a [`SpectrumDeconvolver`] must satisfy to be driven by a [`FeatureGroupProcessor`].
/// With the `parallelism` feature, windows are deconvolved on several threads so the
/// deconvolver must also be [`Sync`].
#[cfg(feature = "parallelism")]
pub trait ProcessorDeconvolver: SpectrumDeconvolver + Sync {}
#[cfg(feature = "parallelism")]
impl<T: SpectrumDeconvolver + Sync> ProcessorDeconvolver for T {}

/// The bound a [`SpectrumDeconvolver`] must satisfy to be driven by a [`FeatureGroupProcessor`].
#[cfg(not(feature = "parallelism"))]
pub trait ProcessorDeconvolver: SpectrumDeconvolver {}
#[cfg(not(feature = "parallelism"))]
impl<T: SpectrumDeconvolver> ProcessorDeconvolver for T {}

pub struct FeatureGroupProcessorBuilder<D: ProcessorDeconvolver, E: ElutionModelFitter = PeakShapeFitter> {
    pub params: QuantParams,
    pub deconvolver: Option<D>,
    pub fitter: Option<E>,
    pub averagine: Option<PrecalculatedAveragine>,
    pub report_writer: Option<ReportWriter>,
}

impl<D: ProcessorDeconvolver, E: ElutionModelFitter> Default for FeatureGroupProcessorBuilder<D, E> {
    fn default() -> Self {
        Self {
            params: Default::default(),
            deconvolver: None,
            fitter: None,
            averagine: None,
            report_writer: None,
        }
    }
}

impl<D: ProcessorDeconvolver, E: ElutionModelFitter + Default> FeatureGroupProcessorBuilder<D, E> {
    pub fn params(&mut self, params: QuantParams) -> &mut Self {
        self.params = params;
        self
    }

    pub fn deconvolver(&mut self, deconvolver: D) -> &mut Self {
        self.deconvolver = Some(deconvolver);
        self
    }

    pub fn fitter(&mut self, fitter: E) -> &mut Self {
        self.fitter = Some(fitter);
        self
    }

    /// Use a prebuilt isotope distribution table instead of generating one from
    /// [`QuantParams::isotopic_model`]
    pub fn averagine(&mut self, averagine: PrecalculatedAveragine) -> &mut Self {
        self.averagine = Some(averagine);
        self
    }

    /// Where to write the shared signal report when [`QuantParams::out_shared_details`] is set
    pub fn report_writer(&mut self, writer: ReportWriter) -> &mut Self {
        self.report_writer = Some(writer);
        self
    }

    pub fn build(&mut self) -> Result<FeatureGroupProcessor<D, E>, QuantError> {
        let params = std::mem::take(&mut self.params);
        params.validate()?;
        let deconvolver = self.deconvolver.take().ok_or_else(|| {
            QuantError::InvalidParameters("a deconvolver is required".to_string())
        })?;
        let fitter = self.fitter.take().unwrap_or_default();
        let averagine = match self.averagine.take() {
            Some(averagine) => averagine,
            None => PrecalculatedAveragine::new(
                params.isotopic_model.into(),
                params.min_mass,
                params.max_mass,
                DEFAULT_MASS_STEP,
            ),
        };
        let report = match (params.out_shared_details, self.report_writer.take()) {
            (true, Some(writer)) => Some(SharedSignalReport::new(writer)),
            (true, None) => {
                debug!("Shared signal details requested without a writer");
                None
            }
            (false, _) => None,
        };
        Ok(FeatureGroupProcessor {
            params,
            deconvolver,
            fitter,
            averagine,
            report,
        })
    }
}

/// Quantifies charge-deconvolved feature groups from a collection of [`MassTrace`]
pub struct FeatureGroupProcessor<D: ProcessorDeconvolver, E: ElutionModelFitter = PeakShapeFitter> {
    pub params: QuantParams,
    pub deconvolver: D,
    pub fitter: E,
    averagine: PrecalculatedAveragine,
    report: Option<SharedSignalReport<ReportWriter>>,
}

impl<D: ProcessorDeconvolver, E: ElutionModelFitter + Default> FeatureGroupProcessor<D, E> {
    pub fn builder() -> FeatureGroupProcessorBuilder<D, E> {
        FeatureGroupProcessorBuilder::default()
    }
}

impl<D: ProcessorDeconvolver, E: ElutionModelFitter> FeatureGroupProcessor<D, E> {
    pub fn averagine(&self) -> &PrecalculatedAveragine {
        &self.averagine
    }

    /// Wrap every trace with enough points in a [`FeatureSeed`]. Shorter traces are skipped,
    /// not removed, so seeds keep the caller's indices.
    fn seed_traces(&self, traces: &[MassTrace]) -> Vec<FeatureSeed> {
        let seeds: Vec<FeatureSeed> = traces
            .iter()
            .enumerate()
            .filter(|(_, t)| t.len() >= self.params.min_peaks_per_trace)
            .map(|(i, t)| FeatureSeed::from_trace(i, t))
            .collect();
        debug!("{} of {} traces seeded", seeds.len(), traces.len());
        seeds
    }

    #[cfg(not(feature = "parallelism"))]
    fn deconvolve_spectra(
        &self,
        seeds: &[FeatureSeed],
        spectra: &[PseudoSpectrum],
    ) -> Result<Vec<FeatureGroup>, QuantError> {
        let driver = DeconvolutionDriver::new(
            &self.deconvolver,
            &self.averagine,
            self.params.min_traces_per_group,
        );
        let mut groups = Vec::new();
        for spectrum in spectra {
            groups.extend(driver.groups_from_spectrum(seeds, spectrum)?);
        }
        Ok(groups)
    }

    #[cfg(feature = "parallelism")]
    fn deconvolve_spectra(
        &self,
        seeds: &[FeatureSeed],
        spectra: &[PseudoSpectrum],
    ) -> Result<Vec<FeatureGroup>, QuantError> {
        let driver = DeconvolutionDriver::new(
            &self.deconvolver,
            &self.averagine,
            self.params.min_traces_per_group,
        );
        let batches: Vec<Vec<FeatureGroup>> = spectra
            .par_iter()
            .map(|spectrum| driver.groups_from_spectrum(seeds, spectrum))
            .collect::<Result<_, QuantError>>()?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// Run the whole pipeline over `traces`.
    ///
    /// Traces created while dividing shared signal are appended to `traces`. Existing traces are
    /// neither removed nor reordered, so seed trace indices remain valid.
    pub fn quantify(&mut self, traces: &mut Vec<MassTrace>) -> Result<Vec<FeatureGroup>, QuantError> {
        let seeds = self.seed_traces(traces);
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let spectra: Vec<PseudoSpectrum> = WindowIter::new(&seeds).collect();
        debug!("{} pseudo-spectra", spectra.len());

        let candidates = self.deconvolve_spectra(&seeds, &spectra)?;
        debug!("{} candidate feature groups", candidates.len());

        let scorer = Scorer::new(&self.averagine, &self.params);
        let mut refined = refine_feature_groups(candidates, &scorer);

        let mut groups = Vec::with_capacity(refined.len());
        if self.params.resolving_shared_signal {
            let mut index = TraceSharingIndex::new(&refined);
            let clusters = index.clusters();
            let resolver =
                ConflictResolver::new(scorer, &self.fitter, self.params.use_smoothed_intensities);
            for cluster in clusters.iter() {
                groups.extend(resolver.resolve_cluster(
                    cluster,
                    &mut refined,
                    &mut index,
                    traces,
                    self.report.as_mut(),
                )?);
            }
        } else {
            for mut group in refined {
                if scorer.rescore(&mut group) {
                    scorer.shape_results(&mut group);
                    groups.push(group);
                }
            }
        }

        if let Some(report) = self.report.as_mut() {
            report.flush()?;
        }
        groups.sort_by(|a, b| a.mass_cmp(b));
        info!("Quantified {} feature groups", groups.len());
        Ok(groups)
    }

    /// Flush and release the shared signal report writer, if there is one
    pub fn finish_report(&mut self) -> Result<Option<ReportWriter>, QuantError> {
        match self.report.take() {
            Some(report) => Ok(Some(report.into_inner()?)),
            None => Ok(None),
        }
    }
}
