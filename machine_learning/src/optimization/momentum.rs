use super::Optimizer;

/// Gradient descent with a velocity term, `v = momentum * v + grad; params -= lr * v`.
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Vec<f32>,
}

impl GradientDescentWithMomentum {
    /// Returns a new `GradientDescentWithMomentum`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `update_params`.
    /// * `momentum` - How much of the previous velocity is kept on each step.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) {
        if self.velocity.len() != params.len() {
            self.velocity = vec![0.0; params.len()];
        }

        let (lr, mu) = (self.learning_rate, self.momentum);

        for ((w, v), g) in params.iter_mut().zip(&mut self.velocity).zip(grad) {
            *v = mu * *v + g;
            *w -= lr * *v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_accumulates_across_steps() {
        let mut optimizer = GradientDescentWithMomentum::new(0.5, 0.9);
        let mut params = [1.0, -1.0];

        optimizer.update_params(&mut params, &[1.0, 2.0]);
        assert_eq!(params, [0.5, -2.0]);

        optimizer.update_params(&mut params, &[1.0, 2.0]);
        assert!((params[0] - (0.5 - 0.5 * 1.9)).abs() < 1e-6);
        assert!((params[1] - (-2.0 - 0.5 * 3.8)).abs() < 1e-6);
    }
}
