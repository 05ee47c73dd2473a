//! Quantification parameters and their loading from configuration files
use std::fmt::Display;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use mzdeisotope::isotopic_model::{IsotopicModel, IsotopicModels};
use serde::{Deserialize, Serialize};

use crate::error::QuantError;

/// The isotopic model used to build theoretical distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Averagine {
    #[default]
    Peptide,
    Glycan,
    Glycopeptide,
    PermethylatedGlycan,
    Heparin,
    HeparanSulfate,
}

impl From<Averagine> for IsotopicModels {
    fn from(value: Averagine) -> Self {
        match value {
            Averagine::Peptide => IsotopicModels::Peptide,
            Averagine::Glycan => IsotopicModels::Glycan,
            Averagine::Glycopeptide => IsotopicModels::Glycopeptide,
            Averagine::PermethylatedGlycan => IsotopicModels::PermethylatedGlycan,
            Averagine::Heparin => IsotopicModels::Heparin,
            Averagine::HeparanSulfate => IsotopicModels::HeparanSulfate,
        }
    }
}

impl From<Averagine> for IsotopicModel<'static> {
    fn from(value: Averagine) -> Self {
        let m: IsotopicModels = value.into();
        m.into()
    }
}

impl Display for Averagine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A known species to restrict the output to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetMass {
    pub mass: f64,
    pub time: f64,
}

impl TargetMass {
    pub const MASS_TOLERANCE: f64 = 1.5;
    pub const TIME_TOLERANCE: f64 = 180.0;

    pub fn new(mass: f64, time: f64) -> Self {
        Self { mass, time }
    }

    pub fn matches(&self, mass: f64, time: f64) -> bool {
        (self.mass - mass).abs() <= Self::MASS_TOLERANCE
            && (self.time - time).abs() <= Self::TIME_TOLERANCE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantParams {
    pub min_charge: i32,
    pub max_charge: i32,
    pub min_mass: f64,
    pub max_mass: f64,
    /// The m/z tolerance in PPM used by deconvolution
    pub mz_tolerance_ppm: f64,
    /// The mass tolerance in Daltons used to merge feature groups
    pub mass_tolerance_da: f64,
    pub min_isotope_cosine: f64,
    pub use_smoothed_intensities: bool,
    /// Write the shared signal diagnostic report
    pub out_shared_details: bool,
    pub resolving_shared_signal: bool,
    /// The minimum number of traces, and distinct charge states, a feature group needs
    pub min_traces_per_group: usize,
    /// Traces with fewer points than this are not seeded
    pub min_peaks_per_trace: usize,
    pub isotopic_model: Averagine,
    pub deconvolution_score_threshold: f64,
    pub target_masses: Option<Vec<TargetMass>>,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            min_charge: 5,
            max_charge: 50,
            min_mass: 10000.0,
            max_mass: 70000.0,
            mz_tolerance_ppm: 10.0,
            mass_tolerance_da: 3.0,
            min_isotope_cosine: 0.85,
            use_smoothed_intensities: true,
            out_shared_details: false,
            resolving_shared_signal: true,
            min_traces_per_group: 3,
            min_peaks_per_trace: 3,
            isotopic_model: Averagine::Peptide,
            deconvolution_score_threshold: 10.0,
            target_masses: None,
        }
    }
}

impl QuantParams {
    pub fn validate(&self) -> Result<(), QuantError> {
        if self.min_charge < 1 || self.min_charge > self.max_charge {
            return Err(QuantError::InvalidParameters(format!(
                "charge range {}..{} is not valid",
                self.min_charge, self.max_charge
            )));
        }
        if self.min_mass < 0.0 || self.min_mass > self.max_mass {
            return Err(QuantError::InvalidParameters(format!(
                "mass range {}..{} is not valid",
                self.min_mass, self.max_mass
            )));
        }
        if self.mz_tolerance_ppm <= 0.0 || self.mass_tolerance_da <= 0.0 {
            return Err(QuantError::InvalidParameters(
                "tolerances must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_isotope_cosine) {
            return Err(QuantError::InvalidParameters(format!(
                "minimum isotope cosine {} is not in [0, 1]",
                self.min_isotope_cosine
            )));
        }
        Ok(())
    }

    /// Read parameters from a TOML file, overridden by `MZQUANT_` environment variables
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, QuantError> {
        let params: Self = Figment::new()
            .merge(Toml::file_exact(path.as_ref()))
            .merge(Env::prefixed("MZQUANT_"))
            .extract()?;
        params.validate()?;
        Ok(params)
    }

    /// The isotope cosine threshold used while merging candidates
    pub fn refinement_isotope_cosine(&self) -> f64 {
        if self.resolving_shared_signal {
            0.5
        } else {
            self.min_isotope_cosine
        }
    }

    pub fn charge_range(&self) -> (i32, i32) {
        (self.min_charge, self.max_charge)
    }
}
