//! Precision studies of approximating adapters
//!
//! An adapter replaces an expensive model by cheap local approximations. The
//! studies here compare both over a sampled area to report how far the
//! approximation drifts. They are diagnostics and never alter the adapter.

use serde::Serialize;

use crate::error::{TransfoError, TransfoResult};
use crate::extent::{Extent, Position};
use crate::transform::TransfoModel;

/// Refuse studies that would sample more points than this
pub const MAX_STUDY_SAMPLES: usize = 10_000_000;

/// Error statistics over the points both sides could convert
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PrecisionReport {
    pub mean_error_x: f64,
    pub mean_error_y: f64,
    /// Largest absolute error on either axis
    pub max_error: f64,
    pub sample_count: usize,
    /// Points that either side failed to convert
    pub rejected_count: usize,
}

#[derive(Default)]
struct ErrorAccumulator {
    sum_x: f64,
    sum_y: f64,
    max_error: f64,
    sample_count: usize,
    rejected_count: usize,
}

impl ErrorAccumulator {
    fn add(&mut self, expected: &Position, actual: &Position) {
        let dx = (expected.x - actual.x).abs();
        let dy = (expected.y - actual.y).abs();
        self.sum_x += dx;
        self.sum_y += dy;
        self.max_error = self.max_error.max(dx).max(dy);
        self.sample_count += 1;
    }

    fn reject(&mut self) {
        self.rejected_count += 1;
    }

    fn finish(self) -> PrecisionReport {
        let n = self.sample_count.max(1) as f64;
        PrecisionReport {
            mean_error_x: self.sum_x / n,
            mean_error_y: self.sum_y / n,
            max_error: self.max_error,
            sample_count: self.sample_count,
            rejected_count: self.rejected_count,
        }
    }
}

/// A model that approximates another one
pub trait TransfoModelAdapter: TransfoModel {
    /// Direct conversion through the adapted model, bypassing any approximation
    fn exact_convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position>;

    /// Area the adapter was prepared for, if one was given
    fn application_area(&self) -> Option<Extent>;

    /// Compare exact and approximated direct conversions on a regular grid
    fn study_precision_over(&self, area: &Extent, step: f64) -> TransfoResult<PrecisionReport> {
        let points = sample_grid(area, step)?;
        Ok(self.study_precision_over_points(&points))
    }

    fn study_precision_over_points(&self, points: &[Position]) -> PrecisionReport {
        let mut errors = ErrorAccumulator::default();
        for p in points {
            match (self.exact_convert_direct(p.x, p.y), self.convert_direct(p.x, p.y)) {
                (Ok(exact), Ok(approximated)) => errors.add(&exact, &approximated),
                _ => errors.reject(),
            }
        }
        errors.finish()
    }
}

/// How far `convert_inverse(convert_direct(p))` lands from `p`
pub fn study_reversibility_over(
    model: &dyn TransfoModel,
    area: &Extent,
    step: f64,
) -> TransfoResult<PrecisionReport> {
    let mut errors = ErrorAccumulator::default();
    for p in sample_grid(area, step)? {
        let back = model
            .convert_direct(p.x, p.y)
            .and_then(|q| model.convert_inverse(q.x, q.y));
        match back {
            Ok(back) => errors.add(&p, &back),
            Err(_) => errors.reject(),
        }
    }
    Ok(errors.finish())
}

/// Points of `area` spaced by `step`, borders included
pub fn sample_grid(area: &Extent, step: f64) -> TransfoResult<Vec<Position>> {
    if !(step.is_finite() && step > 0.0) {
        return Err(TransfoError::InvalidStudy(format!(
            "step must be positive, got {}",
            step
        )));
    }
    if !area.is_defined() || area.width() <= 0.0 || area.height() <= 0.0 {
        return Err(TransfoError::InvalidStudy("study area is empty".to_string()));
    }

    let columns = (area.width() / step).floor() as usize + 1;
    let rows = (area.height() / step).floor() as usize + 1;
    if columns.saturating_mul(rows) > MAX_STUDY_SAMPLES {
        return Err(TransfoError::InvalidStudy(format!(
            "{} x {} samples exceed the limit of {}",
            columns, rows, MAX_STUDY_SAMPLES
        )));
    }

    let origin = area.origin();
    let mut points = Vec::with_capacity(columns * rows);
    for row in 0..rows {
        for column in 0..columns {
            points.push(Position::new(
                origin.x + column as f64 * step,
                origin.y + row as f64 * step,
            ));
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distortion::RadialDistortion;
    use crate::transform::ProjectiveModel;

    /// Wraps a model and shifts its direct output, to get a known error
    #[derive(Debug, Clone)]
    struct Shifted<M> {
        model: M,
        shift: Position,
    }

    impl<M: TransfoModel + Clone + 'static> TransfoModel for Shifted<M> {
        fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
            let p = self.model.convert_direct(x, y)?;
            Ok(Position::new(p.x + self.shift.x, p.y + self.shift.y))
        }

        fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
            self.model.convert_inverse(x - self.shift.x, y - self.shift.y)
        }

        fn clone_box(&self) -> Box<dyn TransfoModel> {
            Box::new(self.clone())
        }

        fn reverse(&mut self) {}
    }

    impl<M: TransfoModel + Clone + 'static> TransfoModelAdapter for Shifted<M> {
        fn exact_convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
            self.model.convert_direct(x, y)
        }

        fn application_area(&self) -> Option<Extent> {
            None
        }
    }

    #[test]
    fn test_sample_grid_includes_borders() {
        let points = sample_grid(&Extent::new(0.0, 0.0, 10.0, 5.0), 5.0).unwrap();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], Position::new(0.0, 0.0));
        assert_eq!(points[5], Position::new(10.0, 5.0));
    }

    #[test]
    fn test_invalid_study_arguments() {
        let area = Extent::new(0.0, 0.0, 10.0, 10.0);
        assert!(matches!(sample_grid(&area, 0.0), Err(TransfoError::InvalidStudy(_))));
        assert!(matches!(sample_grid(&area, f64::NAN), Err(TransfoError::InvalidStudy(_))));
        assert!(matches!(
            sample_grid(&Extent::undefined(), 1.0),
            Err(TransfoError::InvalidStudy(_))
        ));
        assert!(matches!(
            sample_grid(&Extent::new(0.0, 0.0, 0.0, 10.0), 1.0),
            Err(TransfoError::InvalidStudy(_))
        ));
    }

    #[test]
    fn test_exact_adapter_has_no_error() {
        let adapter = Shifted {
            model: ProjectiveModel::translation(3.0, 4.0),
            shift: Position::new(0.0, 0.0),
        };
        let report = adapter
            .study_precision_over(&Extent::new(0.0, 0.0, 100.0, 100.0), 10.0)
            .unwrap();
        assert_eq!(report.sample_count, 121);
        assert_eq!(report.rejected_count, 0);
        assert_eq!(report.max_error, 0.0);
    }

    #[test]
    fn test_known_shift_is_measured() {
        let adapter = Shifted {
            model: ProjectiveModel::identity(),
            shift: Position::new(0.3, -0.4),
        };
        let report = adapter
            .study_precision_over(&Extent::new(0.0, 0.0, 10.0, 10.0), 1.0)
            .unwrap();
        assert!((report.mean_error_x - 0.3).abs() < 1e-12);
        assert!((report.mean_error_y - 0.4).abs() < 1e-12);
        assert!((report.max_error - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_failed_points_are_rejected() {
        let lens = RadialDistortion::new(Position::new(0.0, 0.0), 0.05, 0.0, 10.0)
            .with_valid_radius(5.0);
        let adapter = Shifted {
            model: lens,
            shift: Position::new(0.0, 0.0),
        };
        let report = adapter
            .study_precision_over_points(&[Position::new(1.0, 1.0), Position::new(9.0, 9.0)]);
        assert_eq!(report.sample_count, 1);
        assert_eq!(report.rejected_count, 1);
        assert_eq!(report.max_error, 0.0);
    }

    #[test]
    fn test_reversibility_of_projective_model() {
        let model = ProjectiveModel::from_corners(
            [
                Position::new(0.0, 0.0),
                Position::new(100.0, 0.0),
                Position::new(100.0, 100.0),
                Position::new(0.0, 100.0),
            ],
            [
                Position::new(5.0, 3.0),
                Position::new(110.0, -2.0),
                Position::new(95.0, 120.0),
                Position::new(-4.0, 98.0),
            ],
        )
        .unwrap();
        let report =
            study_reversibility_over(&model, &Extent::new(0.0, 0.0, 100.0, 100.0), 5.0).unwrap();
        assert_eq!(report.rejected_count, 0);
        assert!(report.max_error < 1e-9);
    }
}
