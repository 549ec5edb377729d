//! Transform models
//!
//! [`TransfoModel`] is the conversion contract shared by every model, the
//! adapters included, so that models can be nested and composed. The
//! projective (homography) model is the cheap local approximation the
//! adapters cache.

use std::fmt::Debug;

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::error::{TransfoError, TransfoResult};
use crate::extent::{Extent, Position};

/// Homogeneous weights smaller than this are treated as points at infinity
const WEIGHT_EPSILON: f64 = 1e-12;

/// Pivots smaller than this make a fit singular. Fits run on conditioned
/// control points, so this is relative to a unit scale.
const PIVOT_EPSILON: f64 = 1e-10;

/// A 2D coordinate transform with a direct and an inverse direction
pub trait TransfoModel: Debug {
    fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position>;

    fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position>;

    fn can_be_represented_by_a_matrix(&self) -> bool {
        false
    }

    /// Homogeneous 3x3 matrix, when the model is linear or projective
    fn matrix(&self) -> Option<Matrix3<f64>> {
        None
    }

    fn clone_box(&self) -> Box<dyn TransfoModel>;

    /// Swap the direct and inverse directions
    fn reverse(&mut self);

    fn is_convert_direct_thread_safe(&self) -> bool {
        true
    }

    fn is_convert_inverse_thread_safe(&self) -> bool {
        true
    }

    /// This model followed by `after`, when it can absorb the linear model
    /// without losing its own structure
    fn compose_linear_after(&self, _after: &ProjectiveModel) -> Option<Box<dyn TransfoModel>> {
        None
    }

    /// `before` followed by this model, under the same condition
    fn compose_linear_before(&self, _before: &ProjectiveModel) -> Option<Box<dyn TransfoModel>> {
        None
    }
}

impl Clone for Box<dyn TransfoModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Projective transformation (3x3 homography) with its cached inverse
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectiveModel {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Default for ProjectiveModel {
    fn default() -> Self {
        Self::identity()
    }
}

impl ProjectiveModel {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Build from a homogeneous matrix, which must be invertible
    pub fn from_matrix(matrix: Matrix3<f64>) -> TransfoResult<Self> {
        let matrix = normalize(matrix);
        let inverse = matrix.try_inverse().ok_or(TransfoError::NotInvertible)?;
        Ok(Self {
            matrix,
            inverse: normalize(inverse),
        })
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            matrix: Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0),
            inverse: Matrix3::new(1.0, 0.0, -dx, 0.0, 1.0, -dy, 0.0, 0.0, 1.0),
        }
    }

    pub fn scaling(sx: f64, sy: f64) -> TransfoResult<Self> {
        Self::from_matrix(Matrix3::new(sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0))
    }

    /// Exact projective mapping of 4 source points to 4 destination points.
    /// Uses the Direct Linear Transform (DLT) algorithm.
    pub fn from_corners(src: [Position; 4], dst: [Position; 4]) -> TransfoResult<Self> {
        let homography = conditioned(&src, &dst, "projective", |s, d| {
            compute_homography([s[0], s[1], s[2], s[3]], [d[0], d[1], d[2], d[3]])
        })?;
        Self::from_matrix(homography)
    }

    /// Exact affine mapping of a source triangle to a destination triangle
    pub fn affine_from_triangle(src: [Position; 3], dst: [Position; 3]) -> TransfoResult<Self> {
        let source = Matrix3::new(
            src[0].x, src[1].x, src[2].x,
            src[0].y, src[1].y, src[2].y,
            1.0, 1.0, 1.0,
        );
        let target = Matrix3::new(
            dst[0].x, dst[1].x, dst[2].x,
            dst[0].y, dst[1].y, dst[2].y,
            1.0, 1.0, 1.0,
        );
        let source_inverse = source
            .try_inverse()
            .ok_or(TransfoError::SingularFit { kind: "affine" })?;
        Self::from_matrix(target * source_inverse)
            .map_err(|_| TransfoError::SingularFit { kind: "affine" })
    }

    /// Best model through the control points: affine for 3, exact projective
    /// for 4, least-squares projective beyond
    pub fn fit(src: &[Position], dst: &[Position]) -> TransfoResult<Self> {
        if src.len() != dst.len() || src.len() < 3 {
            return Err(TransfoError::ControlPointMismatch {
                src: src.len(),
                dst: dst.len(),
            });
        }
        match src.len() {
            3 => Self::affine_from_triangle([src[0], src[1], src[2]], [dst[0], dst[1], dst[2]]),
            4 => Self::from_corners(
                [src[0], src[1], src[2], src[3]],
                [dst[0], dst[1], dst[2], dst[3]],
            ),
            _ => Self::from_matrix(conditioned(
                src,
                dst,
                "projective",
                fit_homography_least_squares,
            )?),
        }
    }

    /// Least-squares affine model through any number (>= 3) of control points
    pub fn fit_affine(src: &[Position], dst: &[Position]) -> TransfoResult<Self> {
        if src.len() != dst.len() || src.len() < 3 {
            return Err(TransfoError::ControlPointMismatch {
                src: src.len(),
                dst: dst.len(),
            });
        }
        if src.len() == 3 {
            return Self::affine_from_triangle([src[0], src[1], src[2]], [dst[0], dst[1], dst[2]]);
        }

        Self::from_matrix(conditioned(src, dst, "affine", fit_affine_least_squares)?)
            .map_err(|_| TransfoError::SingularFit { kind: "affine" })
    }

    #[inline]
    pub fn transform_point(&self, x: f64, y: f64) -> TransfoResult<Position> {
        apply_homography(&self.matrix, x, y)
    }

    #[inline]
    pub fn inverse_transform_point(&self, x: f64, y: f64) -> TransfoResult<Position> {
        apply_homography(&self.inverse, x, y)
    }

    pub fn homography(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn inverse_homography(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    pub fn is_affine(&self) -> bool {
        self.matrix[(2, 0)].abs() < WEIGHT_EPSILON && self.matrix[(2, 1)].abs() < WEIGHT_EPSILON
    }

    pub fn is_identity(&self) -> bool {
        (self.matrix - Matrix3::identity()).abs().max() < WEIGHT_EPSILON
    }

    /// This model followed by `next`
    pub fn then(&self, next: &ProjectiveModel) -> ProjectiveModel {
        ProjectiveModel {
            matrix: normalize(next.matrix * self.matrix),
            inverse: normalize(self.inverse * next.inverse),
        }
    }

    pub fn reversed(&self) -> ProjectiveModel {
        ProjectiveModel {
            matrix: self.inverse,
            inverse: self.matrix,
        }
    }
}

impl TransfoModel for ProjectiveModel {
    fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        self.transform_point(x, y)
    }

    fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
        self.inverse_transform_point(x, y)
    }

    fn can_be_represented_by_a_matrix(&self) -> bool {
        true
    }

    fn matrix(&self) -> Option<Matrix3<f64>> {
        Some(self.matrix)
    }

    fn clone_box(&self) -> Box<dyn TransfoModel> {
        Box::new(self.clone())
    }

    fn reverse(&mut self) {
        std::mem::swap(&mut self.matrix, &mut self.inverse);
    }
}

/// A sequence of models applied in order
#[derive(Debug, Clone)]
pub struct ComposedModel {
    steps: Vec<Box<dyn TransfoModel>>,
}

impl ComposedModel {
    pub fn new(steps: Vec<Box<dyn TransfoModel>>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Box<dyn TransfoModel>] {
        &self.steps
    }
}

impl TransfoModel for ComposedModel {
    fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        self.steps
            .iter()
            .try_fold(Position::new(x, y), |p, step| step.convert_direct(p.x, p.y))
    }

    fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
        self.steps
            .iter()
            .rev()
            .try_fold(Position::new(x, y), |p, step| step.convert_inverse(p.x, p.y))
    }

    fn can_be_represented_by_a_matrix(&self) -> bool {
        self.steps.iter().all(|step| step.can_be_represented_by_a_matrix())
    }

    fn matrix(&self) -> Option<Matrix3<f64>> {
        self.steps
            .iter()
            .try_fold(Matrix3::identity(), |acc, step| step.matrix().map(|m| m * acc))
            .map(normalize)
    }

    fn clone_box(&self) -> Box<dyn TransfoModel> {
        Box::new(self.clone())
    }

    fn reverse(&mut self) {
        self.steps.reverse();
        for step in &mut self.steps {
            step.reverse();
        }
    }

    fn is_convert_direct_thread_safe(&self) -> bool {
        self.steps.iter().all(|step| step.is_convert_direct_thread_safe())
    }

    fn is_convert_inverse_thread_safe(&self) -> bool {
        self.steps.iter().all(|step| step.is_convert_inverse_thread_safe())
    }
}

/// `first` followed by `second`.
///
/// Collapses to one projective model when both sides are matrices, folds a
/// linear side into an adapter when the adapter accepts it, and otherwise
/// keeps both models in a sequence.
pub fn compose(first: &dyn TransfoModel, second: &dyn TransfoModel) -> Box<dyn TransfoModel> {
    let first_linear = first.matrix().and_then(|m| ProjectiveModel::from_matrix(m).ok());
    let second_linear = second.matrix().and_then(|m| ProjectiveModel::from_matrix(m).ok());

    match (first_linear, second_linear) {
        (Some(a), Some(b)) => Box::new(a.then(&b)),
        (None, Some(b)) => first
            .compose_linear_after(&b)
            .unwrap_or_else(|| sequence(first, second)),
        (Some(a), None) => second
            .compose_linear_before(&a)
            .unwrap_or_else(|| sequence(first, second)),
        (None, None) => sequence(first, second),
    }
}

fn sequence(first: &dyn TransfoModel, second: &dyn TransfoModel) -> Box<dyn TransfoModel> {
    Box::new(ComposedModel::new(vec![first.clone_box(), second.clone_box()]))
}

/// Bounding box of an extent's corners mapped through `convert`
pub fn map_extent(
    area: &Extent,
    convert: impl Fn(f64, f64) -> TransfoResult<Position>,
) -> Option<Extent> {
    let corners = area
        .corners()
        .iter()
        .map(|c| convert(c.x, c.y))
        .collect::<TransfoResult<Vec<_>>>()
        .ok()?;
    Some(Extent::bounding(&corners))
}

/// Scale so that the bottom-right coefficient is 1 when it can be
fn normalize(m: Matrix3<f64>) -> Matrix3<f64> {
    let w = m[(2, 2)];
    if w.abs() > WEIGHT_EPSILON {
        m / w
    } else {
        m
    }
}

/// Similarity moving the centroid of `points` to the origin at a mean
/// distance of sqrt(2), with its inverse
fn conditioning(
    points: &[Position],
    kind: &'static str,
) -> TransfoResult<(Matrix3<f64>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let spread = points.iter().map(|p| (p.x - cx).hypot(p.y - cy)).sum::<f64>() / n;
    if !(spread.is_finite() && spread > 0.0) {
        return Err(TransfoError::SingularFit { kind });
    }
    let s = std::f64::consts::SQRT_2 / spread;
    Ok((
        Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0),
        Matrix3::new(1.0 / s, 0.0, cx, 0.0, 1.0 / s, cy, 0.0, 0.0, 1.0),
    ))
}

/// Run `solve` on conditioned control points and bring its result back to
/// the original coordinates
fn conditioned(
    src: &[Position],
    dst: &[Position],
    kind: &'static str,
    solve: impl FnOnce(&[Position], &[Position]) -> TransfoResult<Matrix3<f64>>,
) -> TransfoResult<Matrix3<f64>> {
    let (src_in, _) = conditioning(src, kind)?;
    let (dst_in, dst_out) = conditioning(dst, kind)?;
    let apply = |t: &Matrix3<f64>, p: &Position| {
        Position::new(t[(0, 0)] * p.x + t[(0, 2)], t[(1, 1)] * p.y + t[(1, 2)])
    };
    let src: Vec<_> = src.iter().map(|p| apply(&src_in, p)).collect();
    let dst: Vec<_> = dst.iter().map(|p| apply(&dst_in, p)).collect();
    Ok(dst_out * solve(&src, &dst)? * src_in)
}

/// Compute a 3x3 homography matrix from 4 point correspondences
/// using the Direct Linear Transform (DLT) algorithm
fn compute_homography(src: [Position; 4], dst: [Position; 4]) -> TransfoResult<Matrix3<f64>> {
    // For each point correspondence (x,y) -> (x',y'), we have two equations:
    // x*h1 + y*h2 + h3 - x'*x*h7 - x'*y*h8 = x'
    // x*h4 + y*h5 + h6 - y'*x*h7 - y'*y*h8 = y'
    let mut a = [[0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];

    for i in 0..4 {
        let Position { x, y } = src[i];
        let Position { x: xp, y: yp } = dst[i];

        let row1 = i * 2;
        let row2 = i * 2 + 1;

        a[row1] = [x, y, 1.0, 0.0, 0.0, 0.0, -xp * x, -xp * y];
        b[row1] = xp;

        a[row2] = [0.0, 0.0, 0.0, x, y, 1.0, -yp * x, -yp * y];
        b[row2] = yp;
    }

    let h = solve_linear_system(&mut a, &mut b)?;

    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

/// Solve an 8x8 linear system using Gaussian elimination with partial pivoting
fn solve_linear_system(a: &mut [[f64; 8]; 8], b: &mut [f64; 8]) -> TransfoResult<[f64; 8]> {
    let n = 8;

    // Forward elimination with partial pivoting
    for col in 0..n {
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..n {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }

        if max_row != col {
            a.swap(col, max_row);
            b.swap(col, max_row);
        }

        let pivot = a[col][col];
        if pivot.abs() < PIVOT_EPSILON {
            return Err(TransfoError::SingularFit { kind: "projective" });
        }

        for row in (col + 1)..n {
            let factor = a[row][col] / pivot;
            for j in col..n {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    // Back substitution
    let mut x = [0.0f64; 8];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }

    Ok(x)
}

/// Least-squares affine fit over any number (>= 3) of correspondences
fn fit_affine_least_squares(src: &[Position], dst: &[Position]) -> TransfoResult<Matrix3<f64>> {
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 6);
    let mut b = DVector::<f64>::zeros(2 * n);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        a[(2 * i, 0)] = s.x;
        a[(2 * i, 1)] = s.y;
        a[(2 * i, 2)] = 1.0;
        b[2 * i] = d.x;
        a[(2 * i + 1, 3)] = s.x;
        a[(2 * i + 1, 4)] = s.y;
        a[(2 * i + 1, 5)] = 1.0;
        b[2 * i + 1] = d.y;
    }
    let h = a
        .svd(true, true)
        .solve(&b, PIVOT_EPSILON)
        .map_err(|_| TransfoError::SingularFit { kind: "affine" })?;
    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], 0.0, 0.0, 1.0))
}

/// Least-squares DLT for more than 4 correspondences, solved by SVD
fn fit_homography_least_squares(src: &[Position], dst: &[Position]) -> TransfoResult<Matrix3<f64>> {
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 8);
    let mut b = DVector::<f64>::zeros(2 * n);

    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let (x, y, xp, yp) = (s.x, s.y, d.x, d.y);
        let row1 = 2 * i;
        let row2 = 2 * i + 1;

        a[(row1, 0)] = x;
        a[(row1, 1)] = y;
        a[(row1, 2)] = 1.0;
        a[(row1, 6)] = -xp * x;
        a[(row1, 7)] = -xp * y;
        b[row1] = xp;

        a[(row2, 3)] = x;
        a[(row2, 4)] = y;
        a[(row2, 5)] = 1.0;
        a[(row2, 6)] = -yp * x;
        a[(row2, 7)] = -yp * y;
        b[row2] = yp;
    }

    let h = a
        .svd(true, true)
        .solve(&b, PIVOT_EPSILON)
        .map_err(|_| TransfoError::SingularFit { kind: "projective" })?;

    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

/// Apply a homography matrix to a point
#[inline]
fn apply_homography(h: &Matrix3<f64>, x: f64, y: f64) -> TransfoResult<Position> {
    let p = h * Vector3::new(x, y, 1.0);
    if p.z.abs() < WEIGHT_EPSILON {
        return Err(TransfoError::PointAtInfinity { x, y });
    }
    Ok(Position::new(p.x / p.z, p.y / p.z))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Position, b: Position, tolerance: f64) -> bool {
        (a.x - b.x).abs() < tolerance && (a.y - b.y).abs() < tolerance
    }

    fn square(size: f64) -> [Position; 4] {
        [
            Position::new(0.0, 0.0),
            Position::new(size, 0.0),
            Position::new(size, size),
            Position::new(0.0, size),
        ]
    }

    #[test]
    fn test_identity_transform() {
        let transform = ProjectiveModel::from_corners(square(100.0), square(100.0)).unwrap();

        let p = transform.convert_direct(50.0, 50.0).unwrap();
        assert!(close(p, Position::new(50.0, 50.0), 0.01));
        assert!(transform.is_identity());
    }

    #[test]
    fn test_simple_transform() {
        let src = [
            Position::new(10.0, 10.0),
            Position::new(90.0, 10.0),
            Position::new(90.0, 90.0),
            Position::new(10.0, 90.0),
        ];
        let transform = ProjectiveModel::from_corners(src, square(100.0)).unwrap();

        let p = transform.convert_direct(10.0, 10.0).unwrap();
        assert!(close(p, Position::new(0.0, 0.0), 1e-9));

        let back = transform.convert_inverse(100.0, 100.0).unwrap();
        assert!(close(back, Position::new(90.0, 90.0), 1e-9));
    }

    #[test]
    fn test_perspective_round_trip() {
        let dst = [
            Position::new(3.0, 1.0),
            Position::new(120.0, -4.0),
            Position::new(95.0, 88.0),
            Position::new(-2.0, 70.0),
        ];
        let transform = ProjectiveModel::from_corners(square(100.0), dst).unwrap();
        assert!(!transform.is_affine());

        for (s, d) in square(100.0).iter().zip(dst.iter()) {
            let p = transform.convert_direct(s.x, s.y).unwrap();
            assert!(close(p, *d, 1e-7));
        }
        let p = transform.convert_direct(37.0, 61.0).unwrap();
        let back = transform.convert_inverse(p.x, p.y).unwrap();
        assert!(close(back, Position::new(37.0, 61.0), 1e-8));
    }

    #[test]
    fn test_collinear_corners_are_singular() {
        let src = [
            Position::new(0.0, 0.0),
            Position::new(1.0, 1.0),
            Position::new(2.0, 2.0),
            Position::new(3.0, 3.0),
        ];
        let result = ProjectiveModel::from_corners(src, square(1.0));
        assert!(matches!(result, Err(TransfoError::SingularFit { .. })));
    }

    #[test]
    fn test_affine_from_triangle() {
        let src = [Position::new(0.0, 0.0), Position::new(1.0, 0.0), Position::new(0.0, 1.0)];
        let dst = [Position::new(5.0, 5.0), Position::new(7.0, 5.0), Position::new(5.0, 8.0)];
        let model = ProjectiveModel::affine_from_triangle(src, dst).unwrap();

        assert!(model.is_affine());
        let p = model.convert_direct(1.0, 1.0).unwrap();
        assert!(close(p, Position::new(7.0, 8.0), 1e-12));
    }

    #[test]
    fn test_least_squares_fit_recovers_exact_model() {
        let exact = ProjectiveModel::from_matrix(Matrix3::new(
            1.1, 0.05, 3.0, -0.02, 0.95, -1.0, 1e-4, -2e-4, 1.0,
        ))
        .unwrap();
        let src: Vec<Position> = (0..3)
            .flat_map(|i| (0..3).map(move |j| Position::new(i as f64 * 10.0, j as f64 * 10.0)))
            .collect();
        let dst: Vec<Position> = src
            .iter()
            .map(|p| exact.convert_direct(p.x, p.y).unwrap())
            .collect();

        let fitted = ProjectiveModel::fit(&src, &dst).unwrap();
        let p = fitted.convert_direct(13.0, 7.0).unwrap();
        let q = exact.convert_direct(13.0, 7.0).unwrap();
        assert!(close(p, q, 1e-6));
    }

    #[test]
    fn test_fit_is_scale_independent() {
        let exact = ProjectiveModel::from_matrix(Matrix3::new(
            1.1, 0.05, 3e-6, -0.02, 0.95, -1e-6, 2.0, -3.0, 1.0,
        ))
        .unwrap();
        let src: Vec<Position> = (0..3)
            .flat_map(|i| (0..3).map(move |j| Position::new(i as f64 * 1e-5, j as f64 * 1e-5)))
            .collect();
        let dst: Vec<Position> = src
            .iter()
            .map(|p| exact.convert_direct(p.x, p.y).unwrap())
            .collect();

        let corners = ProjectiveModel::fit(
            &[src[0], src[6], src[8], src[2]],
            &[dst[0], dst[6], dst[8], dst[2]],
        )
        .unwrap();
        let fitted = ProjectiveModel::fit(&src, &dst).unwrap();
        let affine = ProjectiveModel::fit_affine(&src, &src).unwrap();

        let q = exact.convert_direct(1.3e-5, 0.7e-5).unwrap();
        assert!(close(corners.convert_direct(1.3e-5, 0.7e-5).unwrap(), q, 1e-14));
        assert!(close(fitted.convert_direct(1.3e-5, 0.7e-5).unwrap(), q, 1e-14));
        assert!(affine.is_identity());
    }

    #[test]
    fn test_fit_rejects_mismatched_lists() {
        let src = [Position::new(0.0, 0.0), Position::new(1.0, 0.0)];
        assert!(matches!(
            ProjectiveModel::fit(&src, &src),
            Err(TransfoError::ControlPointMismatch { .. })
        ));
    }

    #[test]
    fn test_point_at_infinity() {
        let model = ProjectiveModel::from_matrix(Matrix3::new(
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0,
        ))
        .unwrap();
        assert!(matches!(
            model.convert_direct(-1.0, 0.0),
            Err(TransfoError::PointAtInfinity { .. })
        ));
    }

    #[test]
    fn test_compose_linear_models_collapses() {
        let a = ProjectiveModel::translation(1.0, 2.0);
        let b = ProjectiveModel::scaling(2.0, 3.0).unwrap();
        let composed = compose(&a, &b);

        assert!(composed.can_be_represented_by_a_matrix());
        let p = composed.convert_direct(1.0, 1.0).unwrap();
        assert!(close(p, Position::new(4.0, 9.0), 1e-12));
    }

    #[test]
    fn test_composed_model_reverse() {
        let steps: Vec<Box<dyn TransfoModel>> = vec![
            Box::new(ProjectiveModel::translation(1.0, 0.0)),
            Box::new(ProjectiveModel::scaling(2.0, 2.0).unwrap()),
        ];
        let mut model = ComposedModel::new(steps);
        let direct = model.convert_direct(1.0, 1.0).unwrap();
        assert!(close(direct, Position::new(4.0, 2.0), 1e-12));

        model.reverse();
        let back = model.convert_direct(4.0, 2.0).unwrap();
        assert!(close(back, Position::new(1.0, 1.0), 1e-12));
    }
}
