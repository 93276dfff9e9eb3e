use std::sync::Arc;

use primconv::error::ConvError;
use primconv::module::{num_params, param_names};
use primconv::train::{Optimizer, Sgd};
use primconv::{Blob, ConvolutionLayer, ConvolutionParams, Engine, Filler, Shape};
use primconv_backend_faer::FaerLibrary;
use primconv_backend_ref_cpu::RefCpuLibrary;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn params() -> ConvolutionParams {
    ConvolutionParams::new("conv", 6, 3)
        .with_stride(2, 2)
        .with_pad(1, 1)
        .with_group(3)
        .with_weight_filler(Filler::Gaussian { std: 0.3 })
        .with_bias_filler(Filler::Constant { value: 0.1 })
}

fn build(engine: Engine, shape: &Shape) -> (ConvolutionLayer, Blob) {
    let mut rng = StdRng::seed_from_u64(5);
    let mut layer = ConvolutionLayer::new(params(), engine, shape, &mut rng).expect("layer");
    let mut top = Blob::zeros(Shape::new([1]));
    layer.setup(shape, &mut top).expect("setup");
    (layer, top)
}

fn faer() -> Engine {
    Engine::accelerated(Arc::new(FaerLibrary::new()))
}

#[test]
fn output_shape_follows_convolution_arithmetic() {
    let shape = Shape::new([3, 3, 11, 8]);
    let (layer, top) = build(faer(), &shape);
    // (11 + 2 - 3) / 2 + 1 = 6, (8 + 2 - 3) / 2 + 1 = 4
    assert_eq!(top.shape().dims(), &[3, 6, 6, 4]);
    assert_eq!(layer.weight().shape().dims(), &[6, 1, 3, 3]);
    assert_eq!(param_names(&layer).unwrap(), vec!["weight", "bias"]);
    assert_eq!(num_params(&layer).unwrap(), 6 * 9 + 6);
}

#[test]
fn blocked_library_leaves_outputs_in_private_layout() {
    let shape = Shape::new([1, 3, 6, 6]);
    let mut bottom = Blob::randn(shape.clone(), 1.0, &mut StdRng::seed_from_u64(9));

    let (mut blocked, mut blocked_top) = build(faer(), &shape);
    blocked.forward(&mut bottom, &mut blocked_top).expect("forward");
    let private = blocked_top.private_data().expect("private top").len();
    assert!(private > blocked_top.count(), "channel padding expected");

    let canonical = Engine::accelerated(Arc::new(RefCpuLibrary::new()));
    let (mut plain, mut plain_top) = build(canonical, &shape);
    plain.forward(&mut bottom, &mut plain_top).expect("forward");
    assert!(plain_top.private_data().is_none());

    let expected = plain_top.canonical_data().unwrap().to_vec();
    let actual = blocked_top.canonical_data().unwrap();
    for (a, e) in actual.iter().zip(&expected) {
        assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "{a} vs {e}");
    }
}

/// Two optimizer steps with `iter_size = 2` land on the same weights for both engines.
#[test]
fn training_steps_agree_across_engines() {
    let shape = Shape::new([2, 3, 7, 7]);

    let mut final_weights = Vec::new();
    for engine in [faer(), Engine::Reference] {
        let (mut layer, mut top) = build(engine, &shape);
        layer.set_iter_size(2).unwrap();
        let mut sgd = Sgd::new(0.05)
            .with_momentum(0.9)
            .with_iter_size(2)
            .unwrap();

        for step in [[13, 14], [15, 16]] {
            sgd.zero_grad(&mut layer).unwrap();
            for seed in step {
                let mut bottom =
                    Blob::randn(shape.clone(), 1.0, &mut StdRng::seed_from_u64(seed));
                layer.forward(&mut bottom, &mut top).unwrap();
                let dy: Vec<f32> = top.canonical_data().unwrap().to_vec();
                top.set_diff(&dy).unwrap();
                layer.backward(&mut top, true, &mut bottom).unwrap();
            }
            sgd.step(&mut layer).unwrap();
        }
        final_weights.push(layer.weight_mut().canonical_data().unwrap().to_vec());
    }

    for (a, e) in final_weights[0].iter().zip(&final_weights[1]) {
        assert!((a - e).abs() <= 1e-3 * e.abs().max(1.0), "{a} vs {e}");
    }
}

#[test]
fn only_accelerated_layers_expose_a_forward_handle() {
    let shape = Shape::new([2, 3, 5, 5]);
    let (reference, _) = build(Engine::Reference, &shape);
    assert_eq!(reference.forward_handle(), None);

    let (mut layer, mut top) = build(faer(), &shape);
    let handle = layer.forward_handle().expect("forward primitive");
    assert!(!layer.reshape(&shape, &mut top).expect("reshape"));
    assert_eq!(layer.forward_handle(), Some(handle));
    assert!(layer.reshape(&Shape::new([4, 3, 5, 5]), &mut top).expect("reshape"));
    assert_ne!(layer.forward_handle(), Some(handle));
}

#[test]
fn gpu_entry_points_are_not_implemented() {
    let shape = Shape::new([1, 3, 5, 5]);
    let (mut layer, mut top) = build(Engine::Reference, &shape);
    let mut bottom = Blob::zeros(shape);

    let err = layer.forward_gpu(&mut bottom, &mut top).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConvError>(),
        Some(ConvError::NotImplemented { op: "forward_gpu" })
    ));
    assert!(layer.backward_gpu(&mut top, true, &mut bottom).is_err());
}

#[test]
fn invalid_configuration_is_rejected() {
    assert!(layer_err(ConvolutionParams::new("c", 6, 3).with_group(4)).is_some());
    assert!(layer_err(ConvolutionParams::new("c", 6, 9)).is_some());

    let shape = Shape::new([1, 3, 5, 5]);
    let (mut layer, _) = build(Engine::Reference, &shape);
    assert!(layer.set_iter_size(0).is_err());
    assert_eq!(layer.iter_size(), 1);
}

fn layer_err(params: ConvolutionParams) -> Option<anyhow::Error> {
    let shape = Shape::new([1, 3, 5, 5]);
    let mut rng = StdRng::seed_from_u64(1);
    let mut top = Blob::zeros(Shape::new([1]));
    match ConvolutionLayer::new(params, Engine::Reference, &shape, &mut rng) {
        Err(err) => Some(err),
        Ok(mut layer) => layer.setup(&shape, &mut top).err(),
    }
}
