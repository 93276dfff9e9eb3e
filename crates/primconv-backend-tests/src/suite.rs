use std::sync::Arc;

use primconv::error::ConvError;
use primconv::layout::Layout;
use primconv::library::{Capabilities, PrimitiveLibrary, ResourceRole, Resources};
use primconv::tensor::{Blob, Shape};
use primconv::{ConvolutionLayer, ConvolutionParams, Engine, Filler};
use rand::rngs::StdRng;
use rand::SeedableRng;

const WEIGHT_SEED: u64 = 17;
/// Relative bound for comparisons between libraries that compute the same sums.
const PARITY_TOLERANCE: f32 = 1e-4;

fn params(num_output: usize, groups: usize, bias: bool) -> ConvolutionParams {
    ConvolutionParams::new("conv", num_output, 3)
        .with_pad(1, 1)
        .with_group(groups)
        .with_bias(bias)
        .with_weight_filler(Filler::Gaussian { std: 0.5 })
        .with_bias_filler(Filler::Uniform {
            min: -0.5,
            max: 0.5,
        })
}

/// Layer set up for `bottom`; the same parameters always produce the same weights.
fn build(params: &ConvolutionParams, engine: Engine, bottom: &Shape) -> (ConvolutionLayer, Blob) {
    let mut rng = StdRng::seed_from_u64(WEIGHT_SEED);
    let mut layer = ConvolutionLayer::new(params.clone(), engine, bottom, &mut rng)
        .expect("layer construction should succeed");
    let mut top = Blob::zeros(Shape::new([1]));
    layer.setup(bottom, &mut top).expect("setup should succeed");
    (layer, top)
}

fn accelerated(library: &Arc<dyn PrimitiveLibrary>) -> Engine {
    Engine::accelerated(Arc::clone(library))
}

fn input(shape: &Shape, seed: u64) -> Blob {
    Blob::randn(shape.clone(), 1.0, &mut StdRng::seed_from_u64(seed))
}

fn values(len: usize, seed: u64) -> Vec<f32> {
    let mut blob = Blob::randn(Shape::new([len]), 1.0, &mut StdRng::seed_from_u64(seed));
    blob.canonical_data().expect("canonical data").to_vec()
}

#[track_caller]
fn assert_close(actual: &[f32], expected: &[f32], what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = PARITY_TOLERANCE * e.abs().max(1.0);
        assert!((a - e).abs() <= tol, "{what}[{i}]: {a} vs {e}");
    }
}

/// Results of one forward and backward pass, all in canonical layout.
struct Pass {
    top: Vec<f32>,
    bottom_diff: Vec<f32>,
    weight_diff: Vec<f32>,
    bias_diff: Option<Vec<f32>>,
}

fn zero_param_diffs(layer: &mut ConvolutionLayer) {
    layer.weight_mut().zero_diff();
    if let Some(bias) = layer.bias_mut() {
        bias.zero_diff();
    }
}

fn param_diffs(layer: &mut ConvolutionLayer) -> (Vec<f32>, Option<Vec<f32>>) {
    let weight = layer
        .weight_mut()
        .canonical_diff()
        .expect("weight diff")
        .to_vec();
    let bias = layer
        .bias_mut()
        .map(|bias| bias.canonical_diff().expect("bias diff").to_vec());
    (weight, bias)
}

fn run_pass(
    layer: &mut ConvolutionLayer,
    top: &mut Blob,
    bottom: &mut Blob,
    top_diff: &[f32],
) -> Pass {
    layer.forward(bottom, top).expect("forward should succeed");
    let output = top.canonical_data().expect("top data").to_vec();
    top.set_diff(top_diff).expect("top diff");
    zero_param_diffs(layer);
    layer
        .backward(top, true, bottom)
        .expect("backward should succeed");
    let bottom_diff = bottom.canonical_diff().expect("bottom diff").to_vec();
    let (weight_diff, bias_diff) = param_diffs(layer);
    Pass {
        top: output,
        bottom_diff,
        weight_diff,
        bias_diff,
    }
}

fn assert_same_pass(actual: &Pass, expected: &Pass, label: &str) {
    assert_close(&actual.top, &expected.top, &format!("{label} top"));
    assert_close(
        &actual.bottom_diff,
        &expected.bottom_diff,
        &format!("{label} bottom diff"),
    );
    assert_close(
        &actual.weight_diff,
        &expected.weight_diff,
        &format!("{label} weight diff"),
    );
    match (&actual.bias_diff, &expected.bias_diff) {
        (Some(a), Some(e)) => assert_close(a, e, &format!("{label} bias diff")),
        (None, None) => {}
        _ => panic!("{label}: bias presence differs"),
    }
}

/// Runs the same pass through `engine` and the reference engine.
fn compare_with_reference(params: &ConvolutionParams, engine: Engine, shape: &Shape, label: &str) {
    let (mut layer, mut top) = build(params, engine, shape);
    let (mut reference, mut reference_top) = build(params, Engine::Reference, shape);
    let mut bottom = input(shape, 3);
    let mut reference_bottom = input(shape, 3);

    layer.forward(&mut bottom, &mut top).expect("forward");
    let top_diff = values(top.count(), 5);

    let actual = run_pass(&mut layer, &mut top, &mut bottom, &top_diff);
    let expected = run_pass(
        &mut reference,
        &mut reference_top,
        &mut reference_bottom,
        &top_diff,
    );
    assert_same_pass(&actual, &expected, label);
}

pub fn forward_matches_reference(library: &Arc<dyn PrimitiveLibrary>) {
    for groups in [1, 2, 4] {
        for bias in [false, true] {
            for batch in [1, 8] {
                let shape = Shape::new([batch, 4, 7, 6]);
                let params = params(8, groups, bias);
                let (mut layer, mut top) = build(&params, accelerated(library), &shape);
                let (mut reference, mut reference_top) =
                    build(&params, Engine::Reference, &shape);
                let mut bottom = input(&shape, 11);
                let mut reference_bottom = input(&shape, 11);

                layer.forward(&mut bottom, &mut top).expect("forward");
                reference
                    .forward(&mut reference_bottom, &mut reference_top)
                    .expect("reference forward");
                assert_eq!(top.shape(), reference_top.shape());
                assert_close(
                    top.canonical_data().expect("top"),
                    reference_top.canonical_data().expect("reference top"),
                    &format!("groups={groups} bias={bias} batch={batch}"),
                );
            }
        }
    }
}

pub fn backward_matches_reference(library: &Arc<dyn PrimitiveLibrary>) {
    for groups in [1, 2, 4] {
        for bias in [false, true] {
            let shape = Shape::new([2, 4, 6, 5]);
            compare_with_reference(
                &params(8, groups, bias),
                accelerated(library),
                &shape,
                &format!("groups={groups} bias={bias}"),
            );
        }
    }

    let strided = ConvolutionParams::new("strided", 6, 3)
        .with_kernel(3, 2)
        .with_stride(2, 1)
        .with_pad(1, 0)
        .with_group(2)
        .with_weight_filler(Filler::Gaussian { std: 0.5 });
    compare_with_reference(
        &strided,
        accelerated(library),
        &Shape::new([3, 4, 9, 7]),
        "strided",
    );
}

fn weighted_sum(top: &mut Blob, weights: &[f32]) -> f64 {
    top.canonical_data()
        .expect("top data")
        .iter()
        .zip(weights)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum()
}

/// Checks analytic gradients of `sum(top * r)` against central differences.
pub fn gradients_match_finite_differences(library: &Arc<dyn PrimitiveLibrary>) {
    const EPS: f32 = 0.05;
    let shape = Shape::new([2, 4, 5, 5]);
    let (mut layer, mut top) = build(&params(4, 2, true), accelerated(library), &shape);
    let mut bottom = input(&shape, 23);

    layer.forward(&mut bottom, &mut top).expect("forward");
    let r = values(top.count(), 29);
    let pass = run_pass(&mut layer, &mut top, &mut bottom, &r);
    let bias_diff = pass.bias_diff.clone().expect("bias diff");

    let check = |numeric: f64, analytic: f32, what: &str| {
        let analytic = f64::from(analytic);
        assert!(
            (numeric - analytic).abs() <= 1e-2 * analytic.abs().max(1.0),
            "{what}: numeric {numeric} vs analytic {analytic}"
        );
    };

    for index in [0, 7, 35, 71] {
        let mut probe = |delta: f32| {
            layer.weight_mut().mutable_canonical_data().expect("weight")[index] += delta;
            layer.forward(&mut bottom, &mut top).expect("forward");
            weighted_sum(&mut top, &r)
        };
        let plus = probe(EPS);
        let minus = probe(-2.0 * EPS);
        probe(EPS);
        check((plus - minus) / f64::from(2.0 * EPS), pass.weight_diff[index], "weight");
    }

    for index in [0, 12, 99, 199] {
        let mut probe = |delta: f32| {
            bottom.mutable_canonical_data().expect("bottom")[index] += delta;
            layer.forward(&mut bottom, &mut top).expect("forward");
            weighted_sum(&mut top, &r)
        };
        let plus = probe(EPS);
        let minus = probe(-2.0 * EPS);
        probe(EPS);
        check((plus - minus) / f64::from(2.0 * EPS), pass.bottom_diff[index], "bottom");
    }

    for index in 0..bias_diff.len() {
        let mut probe = |delta: f32| {
            layer
                .bias_mut()
                .expect("bias")
                .mutable_canonical_data()
                .expect("bias data")[index] += delta;
            layer.forward(&mut bottom, &mut top).expect("forward");
            weighted_sum(&mut top, &r)
        };
        let plus = probe(EPS);
        let minus = probe(-2.0 * EPS);
        probe(EPS);
        check((plus - minus) / f64::from(2.0 * EPS), bias_diff[index], "bias");
    }
}

pub fn reshape_with_same_shape_keeps_primitives(library: &Arc<dyn PrimitiveLibrary>) {
    let shape = Shape::new([2, 4, 6, 6]);
    let (mut layer, mut top) = build(&params(8, 2, true), accelerated(library), &shape);
    let mut bottom = input(&shape, 19);
    layer.forward(&mut bottom, &mut top).expect("forward");
    let before = top.canonical_data().expect("top").to_vec();

    let generation = layer.primitive_generation();
    let handle = layer.forward_handle().expect("forward primitive");
    let live = library.live_primitives();

    for _ in 0..2 {
        let rebuilt = layer.reshape(&shape, &mut top).expect("reshape");
        assert!(!rebuilt, "identical shape must not rebuild");
    }
    assert_eq!(layer.primitive_generation(), generation);
    assert_eq!(layer.forward_handle(), Some(handle));
    assert_eq!(library.live_primitives(), live);

    layer.forward(&mut bottom, &mut top).expect("forward");
    assert_eq!(top.canonical_data().expect("top"), before.as_slice());
}

/// Runs one pass through a layer built for `first` and then reshaped to `second`.
/// Returns the pass and the number of primitives it held once everything ran.
fn pass_after_rebuild(
    library: &Arc<dyn PrimitiveLibrary>,
    params: &ConvolutionParams,
    first: &Shape,
    second: &Shape,
    top_diff: &[f32],
) -> (Pass, usize) {
    let baseline = library.live_primitives();
    let (mut layer, mut top) = build(params, accelerated(library), first);
    {
        let mut bottom = input(first, 31);
        layer.forward(&mut bottom, &mut top).expect("forward");
    }
    let generation = layer.primitive_generation();
    let handle = layer.forward_handle();

    let rebuilt = layer.reshape(second, &mut top).expect("reshape");
    assert_eq!(rebuilt, first != second);
    if rebuilt {
        assert!(layer.primitive_generation() > generation);
        assert_ne!(layer.forward_handle(), handle);
    }

    let mut bottom = input(second, 37);
    let pass = run_pass(&mut layer, &mut top, &mut bottom, top_diff);
    (pass, library.live_primitives() - baseline)
}

pub fn batch_change_rebuilds_like_fresh_layer(library: &Arc<dyn PrimitiveLibrary>) {
    let params = params(8, 2, true);
    let small = Shape::new([2, 4, 6, 5]);
    let large = Shape::new([5, 4, 6, 5]);
    let top_diff = values(5 * 8 * 6 * 5, 41);
    let baseline = library.live_primitives();

    let (rebuilt, rebuilt_live) = pass_after_rebuild(library, &params, &small, &large, &top_diff);
    assert_eq!(library.live_primitives(), baseline);
    assert_eq!(rebuilt.top.len(), top_diff.len());

    let (fresh, fresh_live) = pass_after_rebuild(library, &params, &large, &large, &top_diff);
    assert_eq!(library.live_primitives(), baseline);

    assert_same_pass(&rebuilt, &fresh, "after rebuild");
    assert_eq!(rebuilt_live, fresh_live, "rebuild must not keep stale primitives");
}

pub fn iter_size_accumulates_parameter_diffs(library: &Arc<dyn PrimitiveLibrary>) {
    const ITER_SIZE: usize = 3;
    let params = params(8, 2, true);
    let shape = Shape::new([2, 4, 5, 5]);

    let (mut single, mut single_top) = build(&params, accelerated(library), &shape);
    let mut single_bottom = input(&shape, 43);
    single.forward(&mut single_bottom, &mut single_top).expect("forward");
    let top_diff = values(single_top.count(), 47);
    let once = run_pass(&mut single, &mut single_top, &mut single_bottom, &top_diff);

    let (mut layer, mut top) = build(&params, accelerated(library), &shape);
    layer.set_iter_size(ITER_SIZE).expect("iter_size");
    let mut bottom = input(&shape, 43);
    layer.forward(&mut bottom, &mut top).expect("forward");
    top.set_diff(&top_diff).expect("top diff");
    zero_param_diffs(&mut layer);
    for _ in 0..ITER_SIZE {
        layer.backward(&mut top, true, &mut bottom).expect("backward");
    }

    let (weight_diff, bias_diff) = param_diffs(&mut layer);
    let scale = |v: &[f32]| v.iter().map(|x| x * ITER_SIZE as f32).collect::<Vec<_>>();
    assert_close(&weight_diff, &scale(&once.weight_diff), "weight diff");
    assert_close(
        &bias_diff.expect("bias diff"),
        &scale(&once.bias_diff.expect("bias diff")),
        "bias diff",
    );
    // The bottom diff is overwritten, never accumulated.
    assert_close(
        bottom.canonical_diff().expect("bottom diff"),
        &once.bottom_diff,
        "bottom diff",
    );
}

pub fn parameter_updates_invalidate_converted_copies(library: &Arc<dyn PrimitiveLibrary>) {
    let shape = Shape::new([2, 4, 5, 5]);
    let (mut layer, mut top) = build(&params(8, 1, false), accelerated(library), &shape);
    let mut bottom = input(&shape, 53);

    layer.forward(&mut bottom, &mut top).expect("forward");
    let first = top.canonical_data().expect("top").to_vec();
    layer.forward(&mut bottom, &mut top).expect("forward");
    assert_close(top.canonical_data().expect("top"), &first, "repeated forward");

    for w in layer.weight_mut().mutable_canonical_data().expect("weight") {
        *w *= 2.0;
    }
    layer.forward(&mut bottom, &mut top).expect("forward");
    let doubled: Vec<f32> = first.iter().map(|v| v * 2.0).collect();
    assert_close(top.canonical_data().expect("top"), &doubled, "after weight update");

    for x in bottom.mutable_canonical_data().expect("bottom") {
        *x = -*x;
    }
    layer.forward(&mut bottom, &mut top).expect("forward");
    let negated: Vec<f32> = doubled.iter().map(|v| -v).collect();
    assert_close(top.canonical_data().expect("top"), &negated, "after input update");
}

pub fn conversions_round_trip(library: &Arc<dyn PrimitiveLibrary>) {
    let sizes = [5, 3, 6, 2];
    let canonical = Layout::packed(&sizes);
    let blocked = Layout::blocked(&sizes, 2, 4);
    let baseline = library.live_primitives();

    let to_blocked = library
        .create_conversion(&canonical, &blocked)
        .expect("canonical to blocked");
    let to_canonical = library
        .create_conversion(&blocked, &canonical)
        .expect("blocked to canonical");

    let source = values(canonical.memory_size(), 59);
    let mut packed = vec![f32::NAN; blocked.memory_size()];
    let mut restored = vec![0.0; canonical.memory_size()];

    let mut resources = Resources::new();
    resources
        .bind_input(ResourceRole::From, &source)
        .bind_output(ResourceRole::To, &mut packed);
    library.execute(to_blocked, &mut resources).expect("execute");

    let mut resources = Resources::new();
    resources
        .bind_input(ResourceRole::From, &packed)
        .bind_output(ResourceRole::To, &mut restored);
    library.execute(to_canonical, &mut resources).expect("execute");
    assert_eq!(restored, source);
    assert!(packed.iter().all(|v| v.is_finite()), "padding must be written");

    assert!(library
        .create_conversion(&Layout::packed(&[2, 3]), &Layout::packed(&[3, 2]))
        .is_err());

    library.release(to_blocked).expect("release");
    library.release(to_canonical).expect("release");
    assert_eq!(library.live_primitives(), baseline);
}

pub fn primitives_are_released_on_drop(library: &Arc<dyn PrimitiveLibrary>) {
    let baseline = library.live_primitives();
    let shape = Shape::new([2, 4, 6, 6]);
    let larger = Shape::new([3, 4, 6, 6]);
    {
        let (mut layer, mut top) = build(&params(8, 4, true), accelerated(library), &shape);
        let mut bottom = input(&shape, 61);
        layer.forward(&mut bottom, &mut top).expect("forward");
        let top_diff = values(top.count(), 67);
        run_pass(&mut layer, &mut top, &mut bottom, &top_diff);
        let live = library.live_primitives();
        assert!(live > baseline);

        // Conversions still bound to blobs outlive the rebuild until rebound.
        layer.reshape(&larger, &mut top).expect("reshape");
        assert!(library.live_primitives() <= live);

        let mut bottom = input(&larger, 71);
        let top_diff = values(top.count(), 73);
        run_pass(&mut layer, &mut top, &mut bottom, &top_diff);
        assert!(library.live_primitives() > baseline);
    }
    assert_eq!(library.live_primitives(), baseline);
}

pub fn shape_mismatch_is_rejected(library: &Arc<dyn PrimitiveLibrary>) {
    let shape = Shape::new([2, 4, 5, 5]);
    let params = params(8, 2, true);

    let mut rng = StdRng::seed_from_u64(WEIGHT_SEED);
    let mut idle = ConvolutionLayer::new(params.clone(), accelerated(library), &shape, &mut rng)
        .expect("layer");
    let mut top = Blob::zeros(Shape::new([2, 8, 5, 5]));
    let err = idle
        .forward(&mut input(&shape, 1), &mut top)
        .expect_err("forward before setup must fail");
    assert!(matches!(
        err.downcast_ref::<ConvError>(),
        Some(ConvError::NotInitialized)
    ));

    let (mut layer, mut top) = build(&params, accelerated(library), &shape);
    let mut wrong = input(&Shape::new([2, 4, 6, 5]), 2);
    let err = layer
        .forward(&mut wrong, &mut top)
        .expect_err("mismatched bottom must fail");
    match err.downcast_ref::<ConvError>() {
        Some(ConvError::ShapeMismatch { tensor, .. }) => assert_eq!(*tensor, "bottom"),
        other => panic!("expected a shape mismatch, got {other:?}"),
    }

    let mut bottom = input(&shape, 3);
    let mut wrong_top = Blob::zeros(Shape::new([2, 8, 5, 4]));
    let err = layer
        .backward(&mut wrong_top, true, &mut bottom)
        .expect_err("mismatched top must fail");
    assert!(matches!(
        err.downcast_ref::<ConvError>(),
        Some(ConvError::ShapeMismatch { tensor: "top", .. })
    ));
}

pub fn legacy_capabilities_match_reference(library: &Arc<dyn PrimitiveLibrary>) {
    let engine = Engine::accelerated_with(Arc::clone(library), Capabilities::legacy());
    compare_with_reference(
        &params(8, 2, true),
        engine,
        &Shape::new([2, 4, 6, 5]),
        "legacy",
    );
}

pub fn frozen_parameters_keep_their_diffs(library: &Arc<dyn PrimitiveLibrary>) {
    let shape = Shape::new([2, 4, 5, 5]);
    let (mut layer, mut top) = build(&params(8, 2, true), accelerated(library), &shape);
    let mut bottom = input(&shape, 71);
    layer.forward(&mut bottom, &mut top).expect("forward");
    let top_diff = values(top.count(), 73);
    top.set_diff(&top_diff).expect("top diff");

    let marker = vec![0.25; layer.weight().count()];
    layer.weight_mut().set_diff(&marker).expect("weight diff");
    let bottom_marker = vec![-1.0; bottom.count()];
    bottom.set_diff(&bottom_marker).expect("bottom diff");
    layer.base_mut().set_param_propagate_down(0, false);

    layer
        .backward(&mut top, false, &mut bottom)
        .expect("backward");
    let (weight_diff, bias_diff) = param_diffs(&mut layer);
    assert_eq!(weight_diff, marker);
    assert_eq!(bottom.canonical_diff().expect("bottom diff"), bottom_marker.as_slice());
    assert!(bias_diff
        .expect("bias diff")
        .iter()
        .any(|v| *v != 0.0));
}
