use std::collections::HashSet;

use mzdeisotope::isotopic_model::PROTON;
use mzdeisotope_quant::{
    graph::TraceSharingIndex, AssignedPeak, FeatureGroup, FeatureGroupProcessor,
    IsotopeDistribution, MassTrace, PeakGroupAssignment, PrecalculatedAveragine, QuantError,
    QuantParams, SpectrumDeconvolver, TracePoint, WindowPeak, ISOTOPE_MASS_DIFF,
};

const DIST: [f64; 3] = [1.0, 0.8, 0.4];

/// Labels every window peak with the interpretations planted for its m/z
#[derive(Debug, Default)]
struct PlantedDeconvolver {
    labels: Vec<(f64, i32, i32, f64)>,
}

impl SpectrumDeconvolver for PlantedDeconvolver {
    fn deconvolve(&self, peaks: &[WindowPeak]) -> Result<Vec<PeakGroupAssignment>, QuantError> {
        let mut out: Vec<PeakGroupAssignment> = Vec::new();
        for peak in peaks {
            for (mz, charge, isotope_index, mass) in self.labels.iter().copied() {
                if (peak.mz - mz).abs() > 1e-9 {
                    continue;
                }
                let assigned = AssignedPeak {
                    index: peak.index,
                    charge,
                    isotope_index,
                    mass,
                };
                match out.iter_mut().find(|a| a.monoisotopic_mass == mass) {
                    Some(a) => a.peaks.push(assigned),
                    None => out.push(PeakGroupAssignment {
                        monoisotopic_mass: mass,
                        peaks: vec![assigned],
                    }),
                }
            }
        }
        Ok(out)
    }
}

fn gaussian(apex: f64, sigma: f64, height: f64, t: f64) -> f64 {
    height * (-(t - apex).powi(2) / (2.0 * sigma * sigma)).exp()
}

fn profile_trace(mz: f64, times: &[f64], values: &[f64]) -> MassTrace {
    times
        .iter()
        .zip(values.iter())
        .map(|(t, v)| TracePoint::new(*t, mz, *v as f32))
        .collect()
}

fn mz_of(mass: f64, charge: i32, iso: i32) -> f64 {
    (mass + iso as f64 * ISOTOPE_MASS_DIFF) / charge as f64 + PROTON
}

#[derive(Debug, Default)]
struct Scene {
    traces: Vec<MassTrace>,
    deconvolver: PlantedDeconvolver,
}

impl Scene {
    fn times(apex: f64) -> Vec<f64> {
        (0..21).map(|i| apex - 10.0 + i as f64).collect()
    }

    /// Add a trace for every isotope of `mass` at each charge, skipping `skip`
    fn add_species(
        &mut self,
        mass: f64,
        charges: &[i32],
        apex: f64,
        height: f64,
        skip: &[(i32, i32)],
    ) {
        let times = Self::times(apex);
        for z in charges.iter().copied() {
            for (i, rel) in DIST.iter().enumerate() {
                let iso = i as i32;
                if skip.contains(&(z, iso)) {
                    continue;
                }
                let mz = mz_of(mass, z, iso);
                let values: Vec<f64> = times
                    .iter()
                    .map(|t| gaussian(apex, 2.0, height * rel, *t))
                    .collect();
                self.traces.push(profile_trace(mz, &times, &values));
                self.deconvolver.labels.push((mz, z, iso, mass));
            }
        }
    }

    fn add_trace(&mut self, trace: MassTrace, labels: &[(i32, i32, f64)]) -> usize {
        let mz = trace.centroid_mz();
        for (z, iso, mass) in labels.iter().copied() {
            self.deconvolver.labels.push((mz, z, iso, mass));
        }
        self.traces.push(trace);
        self.traces.len() - 1
    }
}

fn averagine() -> PrecalculatedAveragine {
    let dist = IsotopeDistribution::from_intensities(DIST.to_vec());
    PrecalculatedAveragine::from_distributions(1000.0, 1000.0, vec![dist; 10]).unwrap()
}

fn params() -> QuantParams {
    QuantParams {
        min_charge: 1,
        max_charge: 20,
        min_mass: 1000.0,
        max_mass: 10000.0,
        mass_tolerance_da: 0.05,
        use_smoothed_intensities: false,
        ..Default::default()
    }
}

fn run(
    scene: &mut Scene,
    params: QuantParams,
) -> Result<Vec<FeatureGroup>, QuantError> {
    let deconvolver = std::mem::take(&mut scene.deconvolver);
    let mut processor = FeatureGroupProcessor::<PlantedDeconvolver>::builder()
        .params(params)
        .deconvolver(deconvolver)
        .averagine(averagine())
        .build()?;
    processor.quantify(&mut scene.traces)
}

fn assert_invariants(groups: &[FeatureGroup]) {
    for group in groups {
        assert!(
            !group.has_duplicate_isotope_claims(),
            "{:?}",
            group.seeds()
        );
    }
    let index = TraceSharingIndex::new(groups);
    for cluster in index.clusters() {
        assert_eq!(cluster.len(), 1, "{cluster:?}");
    }
}

#[test_log::test]
fn test_separate_species() {
    let mut scene = Scene::default();
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[]);
    scene.add_species(7000.0, &[4, 5, 6], 60.0, 500.0, &[]);
    // Too short to be seeded
    scene.traces.push(profile_trace(1500.0, &[1.0, 2.0], &[5.0, 5.0]));
    let n = scene.traces.len();

    let groups = run(&mut scene, params()).unwrap();
    assert_eq!(groups.len(), 2);
    assert!((groups[0].monoisotopic_mass() - 5000.0).abs() < 1e-3);
    assert!((groups[1].monoisotopic_mass() - 7000.0).abs() < 1e-3);
    assert_eq!(groups[0].charges(), &[3, 4, 5]);
    assert_eq!(groups[1].charges(), &[4, 5, 6]);
    assert_eq!(groups[0].len(), 9);
    assert!(groups[0].isotope_cosine() > 0.99);
    assert!(groups[0].average_mass() > groups[0].monoisotopic_mass());
    assert_eq!(groups[0].per_charge_intensity().len(), 6);
    assert!(groups[0].per_charge_intensity()[4] > 0.0);
    assert!((groups[1].rt_of_apex() - 60.0).abs() < 1e-6);
    assert_invariants(&groups);
    assert_eq!(scene.traces.len(), n);
}

#[test_log::test]
fn test_merge_within_tolerance() {
    let mut scene = Scene::default();
    scene.add_species(5000.00, &[2, 3], 20.0, 1000.0, &[]);
    scene.add_species(5000.02, &[3, 4], 20.5, 600.0, &[]);

    let groups = run(&mut scene, params()).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].charges(), &[2, 3, 4]);
    assert!((groups[0].monoisotopic_mass() - 5000.0).abs() < 0.05);
    assert_invariants(&groups);
}

#[test_log::test]
fn test_harmonic_suppression() {
    let mut scene = Scene::default();
    scene.add_species(5000.0, &[4, 6, 8], 20.0, 1000.0, &[]);
    let n_species = scene.traces.len();

    // Read the 5000 Da traces again as a 2500 Da species at half the charge
    let mut artifact = Vec::new();
    for i in 0..n_species {
        let (mz, z, iso, _) = scene.deconvolver.labels[i];
        if iso % 2 == 0 {
            artifact.push((mz, z / 2, iso / 2, 2500.0));
        }
    }
    scene.deconvolver.labels.extend(artifact);
    // One trace only the artifact explains
    let times = Scene::times(20.0);
    let values: Vec<f64> = times.iter().map(|t| gaussian(20.0, 2.0, 200.0, *t)).collect();
    scene.add_trace(
        profile_trace(mz_of(2500.0, 2, 2), &times, &values),
        &[(2, 2, 2500.0)],
    );
    let originals: Vec<f64> = scene.traces.iter().map(|t| t.total_intensity()).collect();
    let n = scene.traces.len();

    let groups = run(&mut scene, params()).unwrap();
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert!((group.monoisotopic_mass() - 5000.0).abs() < 1e-3);
    assert_eq!(group.charges(), &[4, 6, 8]);
    // The surviving group keeps every shared trace whole
    for seed in group.iter() {
        assert!(seed.trace_index < n_species);
        assert!((seed.intensity - originals[seed.trace_index]).abs() < 1e-6);
    }
    assert_eq!(scene.traces.len(), n);
    assert_invariants(&groups);
}

#[test_log::test]
fn test_shared_trace_is_divided() {
    let mut scene = Scene::default();
    // 5000 / 5 and 6000 / 6 put both monoisotopic peaks at the same m/z
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[(5, 0)]);
    scene.add_species(6000.0, &[4, 5, 6], 24.0, 600.0, &[(6, 0)]);

    let times: Vec<f64> = (10..=34).map(|t| t as f64).collect();
    let a: Vec<f64> = times.iter().map(|t| gaussian(20.0, 2.0, 1000.0, *t)).collect();
    let b: Vec<f64> = times.iter().map(|t| gaussian(24.0, 2.0, 600.0, *t)).collect();
    let mixed: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
    let shared = scene.add_trace(
        profile_trace(mz_of(5000.0, 5, 0), &times, &mixed),
        &[(5, 0, 5000.0), (6, 0, 6000.0)],
    );
    assert!((mz_of(5000.0, 5, 0) - mz_of(6000.0, 6, 0)).abs() < 1e-9);
    let n = scene.traces.len();

    let groups = run(&mut scene, params()).unwrap();
    assert_eq!(groups.len(), 2);
    assert_invariants(&groups);

    let mut pieces = Vec::new();
    for (group, expected) in groups.iter().zip([(5000.0, 5, &a), (6000.0, 6, &b)]) {
        assert!((group.monoisotopic_mass() - expected.0).abs() < 0.01);
        let seed = group
            .iter()
            .find(|s| s.charge == expected.1 && s.isotope_index == 0)
            .unwrap();
        assert_ne!(seed.trace_index, shared);
        assert!(seed.trace_index >= n);
        let piece = &scene.traces[seed.trace_index];
        let expected_total: f64 = expected.2.iter().sum();
        assert!(
            (piece.total_intensity() - expected_total).abs() / expected_total < 0.1,
            "{} {}",
            piece.total_intensity(),
            expected_total
        );
        pieces.push(piece);
    }

    // No time point gives away more than was observed
    let observed = scene.traces[shared].raw_intensities();
    let first = pieces[0].raw_intensities();
    let second = pieces[1].raw_intensities();
    for i in 0..observed.len() {
        assert!(first[i] + second[i] <= observed[i] * (1.0 + 1e-4) + 1e-3);
    }
}

/// Check that every piece of a divided shared trace is within `tolerance` of the signal its
/// group contributed and that no time point gives away more than was observed
fn assert_division(
    scene: &Scene,
    groups: &[FeatureGroup],
    shared: usize,
    n: usize,
    expected: &[(f64, i32, &Vec<f64>)],
    tolerance: f64,
) {
    assert_eq!(groups.len(), expected.len());
    let mut pieces = Vec::new();
    for (group, (mass, charge, contribution)) in groups.iter().zip(expected.iter()) {
        assert!((group.monoisotopic_mass() - mass).abs() < 0.01);
        let seed = group
            .iter()
            .find(|s| s.charge == *charge && s.isotope_index == 0)
            .unwrap();
        assert!(seed.trace_index >= n, "{seed:?}");
        let piece = &scene.traces[seed.trace_index];
        let expected_total: f64 = contribution.iter().sum();
        assert!(
            (piece.total_intensity() - expected_total).abs() / expected_total < tolerance,
            "{mass}: {} {}",
            piece.total_intensity(),
            expected_total
        );
        pieces.push(piece.raw_intensities());
    }
    let observed = scene.traces[shared].raw_intensities();
    for i in 0..observed.len() {
        let given: f64 = pieces.iter().map(|p| p[i]).sum();
        assert!(given <= observed[i] * (1.0 + 1e-4) + 1e-3);
    }
}

#[test_log::test]
fn test_three_way_conflict() {
    let mut scene = Scene::default();
    // 5000 / 5, 6000 / 6 and 7000 / 7 all land on one m/z
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[(5, 0)]);
    scene.add_species(6000.0, &[4, 5, 6], 24.0, 600.0, &[(6, 0)]);
    scene.add_species(7000.0, &[6, 7, 8], 28.0, 800.0, &[(7, 0)]);

    let times: Vec<f64> = (10..=38).map(|t| t as f64).collect();
    let a: Vec<f64> = times.iter().map(|t| gaussian(20.0, 2.0, 1000.0, *t)).collect();
    let b: Vec<f64> = times.iter().map(|t| gaussian(24.0, 2.0, 600.0, *t)).collect();
    let c: Vec<f64> = times.iter().map(|t| gaussian(28.0, 2.0, 800.0, *t)).collect();
    let mixed: Vec<f64> = (0..times.len()).map(|i| a[i] + b[i] + c[i]).collect();
    let shared = scene.add_trace(
        profile_trace(mz_of(5000.0, 5, 0), &times, &mixed),
        &[(5, 0, 5000.0), (6, 0, 6000.0), (7, 0, 7000.0)],
    );
    assert!((mz_of(5000.0, 5, 0) - mz_of(7000.0, 7, 0)).abs() < 1e-9);
    let n = scene.traces.len();

    let groups = run(&mut scene, params()).unwrap();
    assert_invariants(&groups);
    assert_division(
        &scene,
        &groups,
        shared,
        n,
        &[(5000.0, 5, &a), (6000.0, 6, &b), (7000.0, 7, &c)],
        0.15,
    );
}

#[test_log::test]
fn test_borrowed_unique_traces() {
    let mut scene = Scene::default();
    // Neither group has a trace of its own at the charge state the shared trace is read at
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[(5, 0), (5, 1), (5, 2)]);
    scene.add_species(6000.0, &[4, 5, 6], 24.0, 600.0, &[(6, 0), (6, 1), (6, 2)]);

    let times: Vec<f64> = (10..=34).map(|t| t as f64).collect();
    let a: Vec<f64> = times.iter().map(|t| gaussian(20.0, 2.0, 1000.0, *t)).collect();
    let b: Vec<f64> = times.iter().map(|t| gaussian(24.0, 2.0, 600.0, *t)).collect();
    let mixed: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();
    let shared = scene.add_trace(
        profile_trace(mz_of(5000.0, 5, 0), &times, &mixed),
        &[(5, 0, 5000.0), (6, 0, 6000.0)],
    );
    let n = scene.traces.len();

    let groups = run(&mut scene, params()).unwrap();
    assert_invariants(&groups);
    for group in groups.iter() {
        assert!(!group.contains_trace(shared));
    }
    assert_division(&scene, &groups, shared, n, &[(5000.0, 5, &a), (6000.0, 6, &b)], 0.1);
}

#[test_log::test]
fn test_shared_trace_kept_whole_without_resolution() {
    let mut scene = Scene::default();
    scene.add_species(6000.0, &[4, 5, 6], 24.0, 600.0, &[(6, 0)]);
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[(5, 0)]);
    let times: Vec<f64> = (10..=34).map(|t| t as f64).collect();
    let mixed: Vec<f64> = times
        .iter()
        .map(|t| gaussian(20.0, 2.0, 1000.0, *t) + gaussian(24.0, 2.0, 600.0, *t))
        .collect();
    let shared = scene.add_trace(
        profile_trace(mz_of(5000.0, 5, 0), &times, &mixed),
        &[(5, 0, 5000.0), (6, 0, 6000.0)],
    );
    let n = scene.traces.len();

    let mut params = params();
    params.resolving_shared_signal = false;
    params.min_isotope_cosine = 0.5;
    let groups = run(&mut scene, params).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(scene.traces.len(), n);
    for group in groups.iter() {
        assert!(group.contains_trace(shared));
    }
    // Groups come back lightest first whatever order their traces were found in
    assert!((groups[0].monoisotopic_mass() - 5000.0).abs() < 0.01);
    assert!((groups[1].monoisotopic_mass() - 6000.0).abs() < 0.01);
    assert!(groups[0] < groups[1]);
}

#[test_log::test]
fn test_rescoring_is_stable() {
    let mut scene = Scene::default();
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[]);
    let groups = run(&mut scene, params()).unwrap();
    let params = params();
    let averagine = averagine();
    let scorer = mzdeisotope_quant::scoring::Scorer::new(&averagine, &params);
    let mut group = groups[0].clone();
    let mass = group.monoisotopic_mass();
    let cosine = group.isotope_cosine();
    assert!(scorer.rescore(&mut group));
    assert_eq!(group.monoisotopic_mass(), mass);
    assert_eq!(group.isotope_cosine(), cosine);
    let traces: HashSet<usize> = group.trace_indices().iter().copied().collect();
    assert_eq!(traces.len(), 9);
}

#[test]
fn test_missing_deconvolver() {
    let err = FeatureGroupProcessor::<PlantedDeconvolver>::builder()
        .params(params())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, QuantError::InvalidParameters(_)));
}

#[test_log::test]
fn test_report_is_written() {
    let mut scene = Scene::default();
    scene.add_species(5000.0, &[3, 4, 5], 20.0, 1000.0, &[(5, 0)]);
    scene.add_species(6000.0, &[4, 5, 6], 24.0, 600.0, &[(6, 0)]);
    let times: Vec<f64> = (10..=34).map(|t| t as f64).collect();
    let mixed: Vec<f64> = times
        .iter()
        .map(|t| gaussian(20.0, 2.0, 1000.0, *t) + gaussian(24.0, 2.0, 600.0, *t))
        .collect();
    scene.add_trace(
        profile_trace(mz_of(5000.0, 5, 0), &times, &mixed),
        &[(5, 0, 5000.0), (6, 0, 6000.0)],
    );

    let path = std::env::temp_dir().join("mzdeisotope_quant_shared_report.tsv");
    let file = std::fs::File::create(&path).unwrap();
    let mut params = params();
    params.out_shared_details = true;
    let deconvolver = std::mem::take(&mut scene.deconvolver);
    let mut processor = FeatureGroupProcessor::<PlantedDeconvolver>::builder()
        .params(params)
        .deconvolver(deconvolver)
        .averagine(averagine())
        .report_writer(Box::new(file))
        .build()
        .unwrap();
    let groups = processor.quantify(&mut scene.traces).unwrap();
    assert_eq!(groups.len(), 2);
    drop(processor.finish_report().unwrap());

    let text = std::fs::read_to_string(&path).unwrap();
    let kinds: HashSet<&str> = text
        .lines()
        .skip(1)
        .filter_map(|line| line.split('\t').nth(1))
        .collect();
    for kind in ["0", "1", "2", "3"] {
        assert!(kinds.contains(kind), "{kinds:?}");
    }
    std::fs::remove_file(&path).ok();
}
