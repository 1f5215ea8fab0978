mod gradient_descent;
mod momentum;
mod optimizer;

use comms::specs::machine_learning::OptimizerSpec;

pub use gradient_descent::GradientDescent;
pub use momentum::GradientDescentWithMomentum;
pub use optimizer::Optimizer;

/// Builds an optimizer following a spec.
///
/// # Arguments
/// * `spec` - The specification for the optimizer.
pub fn build_optimizer(spec: OptimizerSpec) -> Box<dyn Optimizer + Send> {
    match spec {
        OptimizerSpec::GradientDescent { learning_rate } => {
            Box::new(GradientDescent::new(learning_rate))
        }
        OptimizerSpec::GradientDescentWithMomentum {
            learning_rate,
            momentum,
        } => Box::new(GradientDescentWithMomentum::new(learning_rate, momentum)),
    }
}
