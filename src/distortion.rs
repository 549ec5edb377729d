//! Radial lens distortion
//!
//! Brown's radial model: a point at normalized distance `r` from the center
//! moves along its radius by the factor `1 + k1 r^2 + k2 r^4`. The inverse has
//! no closed form and is solved by Newton iterations, which is what makes this
//! model expensive enough to be worth approximating.

use nalgebra::Matrix3;

use crate::config::DistortionConfig;
use crate::error::{TransfoError, TransfoResult};
use crate::extent::Position;
use crate::transform::TransfoModel;

const MAX_ITERATIONS: usize = 30;
const CONVERGENCE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct RadialDistortion {
    center: Position,
    k1: f64,
    k2: f64,
    normalization_radius: f64,
    /// Undistorted radius beyond which the model is undefined
    valid_radius: Option<f64>,
    reversed: bool,
}

impl RadialDistortion {
    pub fn new(center: Position, k1: f64, k2: f64, normalization_radius: f64) -> Self {
        debug_assert!(normalization_radius > 0.0, "normalization radius must be positive");
        Self {
            center,
            k1,
            k2,
            normalization_radius,
            valid_radius: None,
            reversed: false,
        }
    }

    pub fn from_config(config: &DistortionConfig) -> Self {
        let mut model = Self::new(
            Position::new(config.center_x, config.center_y),
            config.k1,
            config.k2,
            config.normalization_radius,
        );
        model.valid_radius = config.valid_radius;
        model
    }

    pub fn with_valid_radius(mut self, radius: f64) -> Self {
        self.valid_radius = Some(radius);
        self
    }

    fn factor(&self, r: f64) -> f64 {
        let r2 = r * r;
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }

    fn check_domain(&self, undistorted_radius: f64, x: f64, y: f64) -> TransfoResult<()> {
        match self.valid_radius {
            Some(limit) if undistorted_radius > limit => Err(TransfoError::OutOfDomain { x, y }),
            _ => Ok(()),
        }
    }

    fn distort(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let dx = x - self.center.x;
        let dy = y - self.center.y;
        let radius = (dx * dx + dy * dy).sqrt();
        self.check_domain(radius, x, y)?;

        let factor = self.factor(radius / self.normalization_radius);
        Ok(Position::new(
            self.center.x + dx * factor,
            self.center.y + dy * factor,
        ))
    }

    fn undistort(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let dx = x - self.center.x;
        let dy = y - self.center.y;
        let distorted = (dx * dx + dy * dy).sqrt() / self.normalization_radius;
        if distorted == 0.0 {
            return Ok(self.center);
        }

        // Newton on r * factor(r) = distorted
        let mut r = distorted;
        let mut converged = false;
        for _ in 0..MAX_ITERATIONS {
            let r2 = r * r;
            let f = r * self.factor(r) - distorted;
            let slope = 1.0 + 3.0 * self.k1 * r2 + 5.0 * self.k2 * r2 * r2;
            if slope <= 0.0 {
                break;
            }
            let step = f / slope;
            r -= step;
            if step.abs() <= CONVERGENCE_EPSILON * distorted.max(1.0) {
                converged = true;
                break;
            }
        }
        if !converged || r <= 0.0 || !r.is_finite() {
            return Err(TransfoError::NoConvergence { x, y });
        }

        self.check_domain(r * self.normalization_radius, x, y)?;
        let scale = r / distorted;
        Ok(Position::new(
            self.center.x + dx * scale,
            self.center.y + dy * scale,
        ))
    }
}

impl TransfoModel for RadialDistortion {
    fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        if self.reversed {
            self.undistort(x, y)
        } else {
            self.distort(x, y)
        }
    }

    fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
        if self.reversed {
            self.distort(x, y)
        } else {
            self.undistort(x, y)
        }
    }

    /// Without coefficients or a domain limit the model is the identity
    fn can_be_represented_by_a_matrix(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.valid_radius.is_none()
    }

    fn matrix(&self) -> Option<Matrix3<f64>> {
        self.can_be_represented_by_a_matrix().then(Matrix3::identity)
    }

    fn clone_box(&self) -> Box<dyn TransfoModel> {
        Box::new(self.clone())
    }

    fn reverse(&mut self) {
        self.reversed = !self.reversed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens() -> RadialDistortion {
        RadialDistortion::new(Position::new(320.0, 240.0), 0.08, -0.01, 400.0)
    }

    #[test]
    fn test_center_is_fixed() {
        let model = lens();
        let p = model.convert_direct(320.0, 240.0).unwrap();
        assert_eq!(p, Position::new(320.0, 240.0));
        let q = model.convert_inverse(320.0, 240.0).unwrap();
        assert_eq!(q, Position::new(320.0, 240.0));
    }

    #[test]
    fn test_inverse_undoes_direct() {
        let model = lens();
        for (x, y) in [(0.0, 0.0), (640.0, 480.0), (100.0, 400.0), (321.0, 239.5)] {
            let p = model.convert_direct(x, y).unwrap();
            let back = model.convert_inverse(p.x, p.y).unwrap();
            assert!((back.x - x).abs() < 1e-8, "x: {} vs {}", back.x, x);
            assert!((back.y - y).abs() < 1e-8, "y: {} vs {}", back.y, y);
        }
    }

    #[test]
    fn test_reverse_swaps_directions() {
        let mut model = lens();
        let p = model.convert_direct(10.0, 20.0).unwrap();
        model.reverse();
        let back = model.convert_direct(p.x, p.y).unwrap();
        assert!((back.x - 10.0).abs() < 1e-8);
        assert!((back.y - 20.0).abs() < 1e-8);
    }

    #[test]
    fn test_valid_radius_limits_domain() {
        let model = lens().with_valid_radius(100.0);
        assert!(model.convert_direct(350.0, 240.0).is_ok());
        assert!(matches!(
            model.convert_direct(0.0, 0.0),
            Err(TransfoError::OutOfDomain { .. })
        ));
    }

    #[test]
    fn test_zero_coefficients_are_linear() {
        let model = RadialDistortion::new(Position::new(0.0, 0.0), 0.0, 0.0, 1.0);
        assert!(model.can_be_represented_by_a_matrix());
        assert_eq!(model.matrix(), Some(Matrix3::identity()));
        assert!(!lens().can_be_represented_by_a_matrix());
        assert!(lens().matrix().is_none());

        let bounded = model.with_valid_radius(2.0);
        assert!(!bounded.can_be_represented_by_a_matrix());
        assert!(bounded.matrix().is_none());
    }
}
