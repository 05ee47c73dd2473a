//! Charge-deconvolved quantification of LC-MS features from mass traces.
//!
//! Mass traces are re-assembled into synthetic spectra over sliding retention time windows,
//! charge deconvolved into [`FeatureGroup`]s, merged, and finally the signal of traces claimed by
//! several feature groups is divided between them using fitted elution profiles.
pub mod averagine;
pub mod config;
pub mod deconvolution;
pub mod elution;
pub mod error;
pub mod graph;
pub mod group;
pub mod nnls;
pub mod refine;
pub mod report;
pub mod resolve;
pub mod scoring;
pub mod seed;
pub mod trace;
pub mod window;

mod api;
mod processor;

pub use api::quantify_traces;
pub use averagine::{IsotopeDistribution, PrecalculatedAveragine, ISOTOPE_MASS_DIFF};
pub use config::{Averagine, QuantParams, TargetMass};
pub use deconvolution::{
    AssignedPeak, MzDeisotopeDeconvolver, PeakGroupAssignment, SpectrumDeconvolver, WindowPeak,
};
pub use elution::{
    ElutionModel, ElutionModelFitter, PeakShapeElutionModel, PeakShapeFitter, WeightedTrace,
};
pub use error::QuantError;
pub use group::FeatureGroup;
pub use processor::{
    FeatureGroupProcessor, FeatureGroupProcessorBuilder, ProcessorDeconvolver, ReportWriter,
};
pub use seed::FeatureSeed;
pub use trace::{MassTrace, TracePoint};
