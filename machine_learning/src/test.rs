#![cfg(test)]

use comms::specs::machine_learning::{InitSpec, LayerSpec, ModuleSpec};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::{RandomExt, rand_distr::Uniform};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{
    MlErr,
    arch::{ModuleBuilder, Sequential},
};

const EPS: f32 = 1e-2;

fn module(layers: Vec<LayerSpec>, input_shape: Vec<usize>) -> Sequential {
    let spec = ModuleSpec::Sequential {
        name: "test".into(),
        layers,
        input_shape,
        init: InitSpec::Default,
        seed: Some(42),
    };

    ModuleBuilder::new().build(&spec).unwrap()
}

fn uniform(shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(-1., 1.).unwrap(), rng)
}

/// `sum(y * r)`, so the gradient with respect to `y` is exactly `r`.
fn weighted_sum(y: &ArrayD<f32>, r: &ArrayD<f32>) -> f64 {
    y.iter().zip(r).map(|(&y, &r)| y as f64 * r as f64).sum()
}

fn assert_close(numeric: f64, analytic: f32, what: &str) {
    let analytic = analytic as f64;
    let tolerance = 1e-2 * analytic.abs().max(1.0);
    assert!(
        (numeric - analytic).abs() <= tolerance,
        "{what}: numeric {numeric} vs analytic {analytic}"
    );
}

/// Parallel reductions may add up in a different order between runs.
fn assert_all_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= 1e-5 * x.abs().max(1.0), "{i}: {x} vs {y}");
    }
}

/// Compares the backward pass against central finite differences.
fn check_gradients(module: &mut Sequential, x: ArrayD<f32>, rng: &mut StdRng) {
    let (y, cache) = module.forward(x.clone()).unwrap();
    let r = uniform(y.shape(), rng);

    let mut grad = vec![0.0; module.size()];
    let dx = module.backward(cache, r.clone(), &mut grad, true).unwrap().unwrap();
    assert_eq!(dx.shape(), x.shape());

    let loss_at = |module: &mut Sequential, x: &ArrayD<f32>| {
        let (y, _) = module.forward(x.clone()).unwrap();
        weighted_sum(&y, &r)
    };

    for i in (0..module.size()).step_by(7) {
        let original = module.params()[i];

        module.params_mut()[i] = original + EPS;
        let plus = loss_at(module, &x);
        module.params_mut()[i] = original - EPS;
        let minus = loss_at(module, &x);
        module.params_mut()[i] = original;

        let numeric = (plus - minus) / (2.0 * EPS as f64);
        assert_close(numeric, grad[i], &format!("param {i}"));
    }

    for i in (0..x.len()).step_by(5) {
        let mut shifted = x.clone();

        shifted.as_slice_mut().unwrap()[i] += EPS;
        let plus = loss_at(module, &shifted);
        shifted.as_slice_mut().unwrap()[i] -= 2.0 * EPS;
        let minus = loss_at(module, &shifted);

        let numeric = (plus - minus) / (2.0 * EPS as f64);
        assert_close(numeric, dx.as_slice().unwrap()[i], &format!("input {i}"));
    }
}

#[test]
fn conv_and_linear_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut module = module(
        vec![
            LayerSpec::conv(2, 3, 3, 2, 1),
            LayerSpec::Flatten,
            LayerSpec::linear(27, 4),
        ],
        vec![2, 5, 5],
    );

    assert_eq!(module.output_shape().unwrap(), [4]);
    let x = uniform(&[3, 2, 5, 5], &mut rng);
    check_gradients(&mut module, x, &mut rng);
}

#[test]
fn rectangular_conv_gradients_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut module = module(
        vec![LayerSpec::Conv2d {
            in_channels: 1,
            out_channels: 2,
            kernel: (2, 3),
            stride: (1, 2),
            padding: (0, 1),
        }],
        vec![1, 4, 6],
    );

    assert_eq!(module.output_shape().unwrap(), [2, 3, 3]);
    let x = uniform(&[2, 1, 4, 6], &mut rng);
    check_gradients(&mut module, x, &mut rng);
}

#[test]
fn max_pool_routes_gradients_to_the_window_maximum() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut module = module(vec![LayerSpec::max_pool(3, 2)], vec![2, 7, 7]);
    assert_eq!(module.output_shape().unwrap(), [2, 3, 3]);

    // Distinct values far apart from each other so a perturbation never changes a winner.
    let mut values: Vec<f32> = (0..2 * 2 * 7 * 7).map(|i| i as f32 * 0.1).collect();
    values.shuffle(&mut rng);
    let x = ArrayD::from_shape_vec(IxDyn(&[2, 2, 7, 7]), values).unwrap();

    check_gradients(&mut module, x, &mut rng);
}

#[test]
fn relu_masks_non_positive_outputs() {
    let mut module = module(vec![LayerSpec::Relu], vec![4]);
    let x = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![-1.0, 2.0, 0.0, 3.0]).unwrap();

    let (y, cache) = module.forward(x).unwrap();
    assert_eq!(y.as_slice().unwrap(), &[0.0, 2.0, 0.0, 3.0]);

    let d = ArrayD::from_elem(IxDyn(&[1, 4]), 1.0);
    let dx = module.backward(cache, d, &mut [], true).unwrap().unwrap();
    assert_eq!(dx.as_slice().unwrap(), &[0.0, 1.0, 0.0, 1.0]);
}

#[test]
fn dropout_is_the_identity_outside_training() {
    let mut module = module(vec![LayerSpec::Dropout { p: 0.5 }], vec![64]);
    let x = ArrayD::from_elem(IxDyn(&[2, 64]), 1.0);

    let (y, _) = module.forward(x.clone()).unwrap();
    assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
    assert!(y.iter().any(|&v| v == 0.0));

    module.set_training(false);
    let (y, _) = module.forward(x.clone()).unwrap();
    assert_eq!(y, x);
}

#[test]
fn interleaved_calls_keep_their_own_caches() {
    let mut rng = StdRng::seed_from_u64(17);
    let layers = vec![
        LayerSpec::conv(1, 2, 3, 1, 1),
        LayerSpec::Relu,
        LayerSpec::max_pool(2, 2),
        LayerSpec::Flatten,
        LayerSpec::linear(8, 3),
    ];
    let mut module = module(layers, vec![1, 4, 4]);

    let a = uniform(&[2, 1, 4, 4], &mut rng);
    let b = uniform(&[3, 1, 4, 4], &mut rng);
    let da = uniform(&[2, 3], &mut rng);
    let db = uniform(&[3, 3], &mut rng);

    let expected = |module: &mut Sequential, x: &ArrayD<f32>, d: &ArrayD<f32>| {
        let (_, cache) = module.forward(x.clone()).unwrap();
        let mut grad = vec![0.0; module.size()];
        let dx = module.backward(cache, d.clone(), &mut grad, true).unwrap();
        (grad, dx)
    };
    let (grad_a, dx_a) = expected(&mut module, &a, &da);
    let (grad_b, dx_b) = expected(&mut module, &b, &db);

    let (_, cache_a) = module.forward(a).unwrap();
    let (_, cache_b) = module.forward(b).unwrap();

    let mut grad = vec![0.0; module.size()];
    let dx = module.backward(cache_b, db, &mut grad, true).unwrap();
    assert_all_close(&grad, &grad_b);
    assert_all_close(dx.unwrap().as_slice().unwrap(), dx_b.unwrap().as_slice().unwrap());

    let dx = module.backward(cache_a, da, &mut grad, true).unwrap();
    assert_all_close(&grad, &grad_a);
    assert_all_close(dx.unwrap().as_slice().unwrap(), dx_a.unwrap().as_slice().unwrap());
}

#[test]
fn input_gradient_is_skipped_when_not_needed() {
    let mut module = module(vec![LayerSpec::linear(3, 2)], vec![3]);
    let x = ArrayD::from_elem(IxDyn(&[4, 3]), 0.5);

    let (_, cache) = module.forward(x).unwrap();
    let mut grad = vec![0.0; module.size()];
    let d = ArrayD::from_elem(IxDyn(&[4, 2]), 1.0);

    assert!(module.backward(cache, d, &mut grad, false).unwrap().is_none());
    // Every bias sees the four samples.
    assert_eq!(&grad[6..], &[4.0, 4.0]);
}

#[test]
fn wrong_input_shape_is_rejected() {
    let mut module = module(vec![LayerSpec::conv(3, 4, 3, 1, 1)], vec![3, 8, 8]);
    let x = ArrayD::zeros(IxDyn(&[2, 1, 8, 8]));
    assert!(matches!(
        module.forward(x),
        Err(MlErr::InvalidShape { .. })
    ));
}

#[test]
fn wrong_gradient_length_is_rejected() {
    let mut module = module(vec![LayerSpec::linear(2, 2)], vec![2]);
    let (_, cache) = module.forward(ArrayD::zeros(IxDyn(&[1, 2]))).unwrap();
    let d = ArrayD::zeros(IxDyn(&[1, 2]));
    let err = module.backward(cache, d, &mut [0.0; 3], true);
    assert!(matches!(err, Err(MlErr::SizeMismatch { .. })));
}
