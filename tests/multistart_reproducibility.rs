use panelreg::lowlevel::LevelMetric;
use panelreg::{
    ChannelSet, CoarseEstimate, ExtentHint, Geometry, Image, MultiStartConfig,
    MultiStartSampler, Registrar, RegistrationConfig, Transform, TransformFamily,
};

/// Single broad blob, so the correlation landscape has one maximum.
fn blob(geom: &Geometry, cx: f64, cy: f64) -> Image {
    Image::from_fn(geom.clone(), |x, y, _| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        (0.02 + (-(dx * dx + dy * dy) / 80.0).exp()) as f32
    })
}

fn sampler(seed: u64, samples_per_parameter: usize) -> MultiStartSampler {
    MultiStartSampler::new(
        seed,
        MultiStartConfig {
            samples_per_parameter,
            explore_rotation: true,
            ..MultiStartConfig::default()
        },
    )
}

fn coarse_guess() -> CoarseEstimate {
    CoarseEstimate {
        transform: Transform::translation(&[1.0, 0.5]).unwrap(),
        confidence: 0.3,
        ..CoarseEstimate::identity(2)
    }
}

#[test]
fn more_draws_extend_the_candidate_list() {
    let geom = Geometry::unit(&[48, 48]).unwrap();
    let hint = ExtentHint::from_geometries(&geom, &geom);
    let few = sampler(7, 1).candidates(&coarse_guess(), TransformFamily::Rigid, &hint);
    let many = sampler(7, 8).candidates(&coarse_guess(), TransformFamily::Rigid, &hint);
    assert!(many.len() > few.len());
    assert_eq!(&many[..few.len()], &few[..]);
}

#[test]
fn more_draws_never_score_worse() {
    let geom = Geometry::unit(&[48, 48]).unwrap();
    let fixed = blob(&geom, 24.0, 24.0);
    let moving = blob(&geom, 28.0, 21.0);
    let metric = LevelMetric::new(&fixed, None, &moving, None, 2000, 3, 0.1).unwrap();
    let hint = ExtentHint::from_geometries(&geom, &geom);

    let mut previous = f64::NEG_INFINITY;
    for spp in [1, 2, 4, 16] {
        let s = sampler(11, spp);
        let outcome = s
            .select(s.candidates(&coarse_guess(), TransformFamily::Rigid, &hint), &metric)
            .unwrap();
        assert!(outcome.best_score >= previous, "spp {spp}");
        previous = outcome.best_score;
    }
}

#[test]
fn sample_count_does_not_change_a_unimodal_optimum() {
    let geom = Geometry::unit(&[48, 48]).unwrap();
    let fixed = ChannelSet::single(blob(&geom, 24.0, 24.0));
    let moving = ChannelSet::single(blob(&geom, 27.0, 22.0));
    let run = |spp: usize| {
        let mut cfg = RegistrationConfig {
            family: TransformFamily::Translation,
            samples_per_parameter: 600,
            ..RegistrationConfig::default()
        };
        cfg.multistart.samples_per_parameter = spp;
        Registrar::new(cfg).register(&fixed, &moving).unwrap()
    };
    let one = run(1);
    let many = run(12);
    for (a, b) in one
        .transform
        .parameters()
        .iter()
        .zip(many.transform.parameters())
    {
        assert!((a - b).abs() < 0.1, "{a} vs {b}");
    }
    assert!((one.transform.parameters()[0] - 3.0).abs() < 0.3);
}

#[test]
fn seed_fixes_the_draws() {
    let geom = Geometry::unit(&[32, 32]).unwrap();
    let hint = ExtentHint::from_geometries(&geom, &geom);
    let a = sampler(5, 4).candidates(&coarse_guess(), TransformFamily::Rigid, &hint);
    let b = sampler(5, 4).candidates(&coarse_guess(), TransformFamily::Rigid, &hint);
    let c = sampler(6, 4).candidates(&coarse_guess(), TransformFamily::Rigid, &hint);
    assert_eq!(a, b);
    assert_ne!(a, c);
}
