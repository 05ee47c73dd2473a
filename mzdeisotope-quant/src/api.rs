use crate::config::QuantParams;
use crate::deconvolution::MzDeisotopeDeconvolver;
use crate::elution::PeakShapeFitter;
use crate::error::QuantError;
use crate::group::FeatureGroup;
use crate::processor::FeatureGroupProcessor;
use crate::trace::MassTrace;

/// Quantify `traces` with `mzdeisotope` deconvolution and `mzsignal` peak shape elution models.
///
/// Traces created while dividing shared signal are appended to `traces`.
pub fn quantify_traces(
    traces: &mut Vec<MassTrace>,
    params: QuantParams,
) -> Result<Vec<FeatureGroup>, QuantError> {
    let deconvolver = MzDeisotopeDeconvolver::from_params(&params);
    let mut processor = FeatureGroupProcessor::<MzDeisotopeDeconvolver, PeakShapeFitter>::builder()
        .params(params)
        .deconvolver(deconvolver)
        .build()?;
    processor.quantify(traces)
}
