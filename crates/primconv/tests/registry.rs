use primconv::error::ConvError;
use primconv::library::registry::{create_library, has_library, list_libraries};
use primconv::{Blob, ConvolutionLayer, ConvolutionParams, Engine, EngineKind, Shape};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn register_all() {
    primconv_backend_ref_cpu::register_ref_cpu_library();
    primconv_backend_faer::register_faer_library();
}

#[test]
fn backend_crates_register_their_libraries() {
    register_all();

    let libraries = list_libraries();
    assert!(libraries.contains(&"ref-cpu".to_string()), "{libraries:?}");
    assert!(has_library("faer"));

    let faer = create_library("faer").expect("faer should be registered");
    assert_eq!(faer.name(), "faer");
    assert_eq!(faer.live_primitives(), 0);

    assert!(!has_library("nonexistent"));
    assert!(create_library("nonexistent").is_none());
}

#[test]
fn engine_follows_params() {
    register_all();

    let params = ConvolutionParams::new("conv1", 4, 3).with_library("ref-cpu");
    let engine = Engine::from_params(&params).expect("registered library");
    assert_eq!(engine.kind(), EngineKind::Accelerated);

    let reference = params.clone().with_engine(EngineKind::Reference);
    assert_eq!(
        Engine::from_params(&reference).expect("reference engine").kind(),
        EngineKind::Reference
    );

    let err = Engine::from_params(&params.with_library("missing")).unwrap_err();
    assert!(matches!(err, ConvError::UnknownLibrary(ref name) if name == "missing"));
}

#[test]
fn layer_built_from_json_runs_on_the_named_library() {
    register_all();

    let params = ConvolutionParams::from_json(
        r#"{
            "name": "conv2",
            "num_output": 6,
            "kernel": [3, 3],
            "pad": [1, 1],
            "group": 2,
            "library": "faer"
        }"#,
    )
    .expect("valid params");
    let shape = Shape::new([2, 4, 8, 8]);
    let mut rng = StdRng::seed_from_u64(0);
    let mut layer = ConvolutionLayer::from_params(params, &shape, &mut rng).expect("layer");
    assert_eq!(layer.executor_name(), "accelerated");

    let mut top = Blob::zeros(Shape::new([1]));
    layer.setup(&shape, &mut top).expect("setup");
    let mut bottom = Blob::randn(shape, 1.0, &mut rng);
    layer.forward(&mut bottom, &mut top).expect("forward");
    assert_eq!(top.shape().dims(), &[2, 6, 8, 8]);
}
