//! Projective grid adapter
//!
//! Approximates an arbitrary model by a grid of square cells, each replaced by
//! the projective model fitted on the cell's four converted corners. Only a
//! window of `rows × columns` cells is cached per direction; a conversion
//! that falls outside the window recenters it on the new cell.

use std::cell::RefCell;

use nalgebra::Matrix3;
use tracing::debug;

use crate::config::GridAdapterConfig;
use crate::error::{TransfoError, TransfoResult};
use crate::extent::{Extent, Position};
use crate::precision::TransfoModelAdapter;
use crate::transform::{map_extent, ProjectiveModel, TransfoModel};

/// Largest cell index magnitude. Keeps window arithmetic on `i64` exact and
/// far from overflow.
const MAX_CELL_INDEX: f64 = (1u64 << 52) as f64;

/// Cell index of `value` along one axis, `None` when not representable
fn cell_index(value: f64, step: f64) -> Option<i64> {
    let index = (value / step).floor();
    (index.is_finite() && index.abs() <= MAX_CELL_INDEX).then_some(index as i64)
}

/// Cached cells of one conversion direction
#[derive(Debug, Clone)]
struct GridWindow {
    step: f64,
    rows: usize,
    columns: usize,
    origin_row: i64,
    origin_column: i64,
    /// Row-major, `None` until first used
    cells: Vec<Option<ProjectiveModel>>,
    active: bool,
}

impl GridWindow {
    fn new(step: f64, rows: usize, columns: usize) -> Self {
        Self {
            step,
            rows,
            columns,
            origin_row: 0,
            origin_column: 0,
            cells: vec![None; rows * columns],
            active: false,
        }
    }

    fn extent(&self) -> Option<Extent> {
        if !self.active {
            return None;
        }
        Some(Extent::new(
            self.origin_column as f64 * self.step,
            self.origin_row as f64 * self.step,
            (self.origin_column + self.columns as i64) as f64 * self.step,
            (self.origin_row + self.rows as i64) as f64 * self.step,
        ))
    }

    fn contains_cell(&self, row: i64, column: i64) -> bool {
        self.active
            && row >= self.origin_row
            && row < self.origin_row + self.rows as i64
            && column >= self.origin_column
            && column < self.origin_column + self.columns as i64
    }

    fn recenter(&mut self, row: i64, column: i64) {
        let fitted = self.cells.iter().filter(|cell| cell.is_some()).count();
        self.origin_row = row - (self.rows / 2) as i64;
        self.origin_column = column - (self.columns / 2) as i64;
        self.cells.iter_mut().for_each(|cell| *cell = None);
        self.active = true;
        debug!(
            "Grid window recentered on cell ({}, {}), dropped {} fitted cells",
            row, column, fitted
        );
    }

    /// Convert through the cell containing (x, y), fitting it from `exact`
    /// when needed. Nothing is cached when a corner fails to convert.
    fn convert(
        &mut self,
        x: f64,
        y: f64,
        exact: impl Fn(f64, f64) -> TransfoResult<Position>,
    ) -> TransfoResult<Position> {
        let (row, column) = match (cell_index(y, self.step), cell_index(x, self.step)) {
            (Some(row), Some(column)) => (row, column),
            _ => return Err(TransfoError::OutOfDomain { x, y }),
        };
        if !self.contains_cell(row, column) {
            self.recenter(row, column);
        }

        let index = (row - self.origin_row) as usize * self.columns
            + (column - self.origin_column) as usize;
        if let Some(cell) = &self.cells[index] {
            return cell.transform_point(x, y);
        }

        let cell = self.fit_cell(row, column, &exact)?;
        let result = cell.transform_point(x, y);
        self.cells[index] = Some(cell);
        result
    }

    fn fit_cell(
        &self,
        row: i64,
        column: i64,
        exact: &impl Fn(f64, f64) -> TransfoResult<Position>,
    ) -> TransfoResult<ProjectiveModel> {
        let x0 = column as f64 * self.step;
        let y0 = row as f64 * self.step;
        let x1 = x0 + self.step;
        let y1 = y0 + self.step;
        let src = [
            Position::new(x0, y0),
            Position::new(x1, y0),
            Position::new(x1, y1),
            Position::new(x0, y1),
        ];
        let dst = [
            exact(x0, y0)?,
            exact(x1, y0)?,
            exact(x1, y1)?,
            exact(x0, y1)?,
        ];
        ProjectiveModel::from_corners(src, dst)
    }
}

/// Adapter approximating a model by lazily fitted projective cells
#[derive(Debug, Clone)]
pub struct ProjectiveGridAdapter {
    /// Applied before the adapted model
    pre: ProjectiveModel,
    /// Applied after the adapted model
    post: ProjectiveModel,
    model: Box<dyn TransfoModel>,
    config: GridAdapterConfig,
    application_area: Option<Extent>,
    direct: RefCell<GridWindow>,
    inverse: RefCell<GridWindow>,
}

impl ProjectiveGridAdapter {
    pub fn new(model: Box<dyn TransfoModel>, config: GridAdapterConfig) -> Self {
        debug_assert!(
            config.direct_step > 0.0 && config.inverse_step > 0.0,
            "grid steps must be positive"
        );
        let rows = config.rows.max(1);
        let columns = config.columns.max(1);
        Self {
            pre: ProjectiveModel::identity(),
            post: ProjectiveModel::identity(),
            model,
            config: GridAdapterConfig {
                rows,
                columns,
                ..config
            },
            application_area: None,
            direct: RefCell::new(GridWindow::new(config.direct_step, rows, columns)),
            inverse: RefCell::new(GridWindow::new(config.inverse_step, rows, columns)),
        }
    }

    /// Record the area the adapter is meant for, in direct input coordinates
    pub fn with_application_area(mut self, area: Extent) -> Self {
        self.application_area = Some(area);
        self
    }

    pub fn direct_step(&self) -> f64 {
        self.config.direct_step
    }

    pub fn inverse_step(&self) -> f64 {
        self.config.inverse_step
    }

    pub fn config(&self) -> &GridAdapterConfig {
        &self.config
    }

    pub fn adapted_model(&self) -> &dyn TransfoModel {
        self.model.as_ref()
    }

    /// Area covered by the cached direct window, in adapted model coordinates
    pub fn current_direct_extent(&self) -> Option<Extent> {
        self.direct.borrow().extent()
    }

    pub fn current_inverse_extent(&self) -> Option<Extent> {
        self.inverse.borrow().extent()
    }
}

impl TransfoModel for ProjectiveGridAdapter {
    fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let p = self.pre.transform_point(x, y)?;
        let p = self
            .direct
            .borrow_mut()
            .convert(p.x, p.y, |x, y| self.model.convert_direct(x, y))?;
        self.post.transform_point(p.x, p.y)
    }

    fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let p = self.post.inverse_transform_point(x, y)?;
        let p = self
            .inverse
            .borrow_mut()
            .convert(p.x, p.y, |x, y| self.model.convert_inverse(x, y))?;
        self.pre.inverse_transform_point(p.x, p.y)
    }

    fn can_be_represented_by_a_matrix(&self) -> bool {
        self.model.can_be_represented_by_a_matrix()
    }

    fn matrix(&self) -> Option<Matrix3<f64>> {
        self.model
            .matrix()
            .map(|m| self.post.homography() * m * self.pre.homography())
    }

    fn clone_box(&self) -> Box<dyn TransfoModel> {
        Box::new(self.clone())
    }

    fn reverse(&mut self) {
        self.application_area = self
            .application_area
            .and_then(|area| map_extent(&area, |x, y| self.exact_convert_direct(x, y)));

        self.model.reverse();
        let pre = self.pre.reversed();
        self.pre = self.post.reversed();
        self.post = pre;
        self.direct.swap(&self.inverse);
        std::mem::swap(&mut self.config.direct_step, &mut self.config.inverse_step);
    }

    fn is_convert_direct_thread_safe(&self) -> bool {
        false
    }

    fn is_convert_inverse_thread_safe(&self) -> bool {
        false
    }

    fn compose_linear_after(&self, after: &ProjectiveModel) -> Option<Box<dyn TransfoModel>> {
        let mut composed = self.clone();
        composed.post = self.post.then(after);
        Some(Box::new(composed))
    }

    fn compose_linear_before(&self, before: &ProjectiveModel) -> Option<Box<dyn TransfoModel>> {
        let mut composed = self.clone();
        composed.pre = before.then(&self.pre);
        composed.application_area = self
            .application_area
            .and_then(|area| map_extent(&area, |x, y| before.inverse_transform_point(x, y)));
        Some(Box::new(composed))
    }
}

impl TransfoModelAdapter for ProjectiveGridAdapter {
    fn exact_convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let p = self.pre.transform_point(x, y)?;
        let p = self.model.convert_direct(p.x, p.y)?;
        self.post.transform_point(p.x, p.y)
    }

    fn application_area(&self) -> Option<Extent> {
        self.application_area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distortion::RadialDistortion;
    use crate::transform::compose;

    fn affine() -> ProjectiveModel {
        ProjectiveModel::affine_from_triangle(
            [
                Position::new(0.0, 0.0),
                Position::new(1.0, 0.0),
                Position::new(0.0, 1.0),
            ],
            [
                Position::new(12.0, -7.0),
                Position::new(12.9, -6.6),
                Position::new(11.7, -6.1),
            ],
        )
        .unwrap()
    }

    fn lens() -> RadialDistortion {
        RadialDistortion::new(Position::new(320.0, 240.0), 0.08, -0.01, 400.0)
    }

    fn grid(model: Box<dyn TransfoModel>) -> ProjectiveGridAdapter {
        ProjectiveGridAdapter::new(model, GridAdapterConfig::default())
    }

    #[test]
    fn test_affine_round_trip() {
        let adapter = grid(Box::new(affine()));
        let mut good = 0;
        let mut total = 0;
        for i in 0..40 {
            for j in 0..30 {
                let (x, y) = (i as f64 * 16.3 - 5.0, j as f64 * 15.7 + 2.0);
                let p = adapter.convert_direct(x, y).unwrap();
                let back = adapter.convert_inverse(p.x, p.y).unwrap();
                total += 1;
                if (back.x - x).abs() < 1e-5 && (back.y - y).abs() < 1e-5 {
                    good += 1;
                }
            }
        }
        assert!(good * 100 >= total * 95, "{} of {} round trips", good, total);
    }

    #[test]
    fn test_affine_precision_is_exact() {
        let adapter = grid(Box::new(affine()));
        let report = adapter
            .study_precision_over(&Extent::new(0.0, 0.0, 300.0, 200.0), 7.0)
            .unwrap();
        assert_eq!(report.rejected_count, 0);
        assert!(report.max_error < 1e-6);
    }

    #[test]
    fn test_lens_precision() {
        let adapter = grid(Box::new(lens()));
        let report = adapter
            .study_precision_over(&Extent::new(0.0, 0.0, 640.0, 480.0), 5.0)
            .unwrap();
        assert_eq!(report.rejected_count, 0);
        assert!(report.mean_error_x < 0.05);
        assert!(report.max_error < 0.25);
    }

    #[test]
    fn test_window_follows_conversions() {
        let adapter = grid(Box::new(lens()));
        assert!(adapter.current_direct_extent().is_none());

        adapter.convert_direct(10.0, 10.0).unwrap();
        let first = adapter.current_direct_extent().unwrap();
        assert!(first.is_point_in(&Position::new(10.0, 10.0)));
        assert!(adapter.current_inverse_extent().is_none());

        adapter.convert_direct(600.0, 450.0).unwrap();
        let second = adapter.current_direct_extent().unwrap();
        assert!(second.is_point_in(&Position::new(600.0, 450.0)));
        assert!(!second.is_point_in(&Position::new(10.0, 10.0)));
        assert_eq!(second.width(), 8.0 * 16.0);
    }

    #[test]
    fn test_corner_failure_propagates() {
        let adapter = grid(Box::new(lens().with_valid_radius(100.0)));
        // Inside the valid radius, but the cell's far corner is not
        let p = Position::new(320.0 + 99.0, 240.0);
        assert!(matches!(
            adapter.convert_direct(p.x, p.y),
            Err(TransfoError::OutOfDomain { .. })
        ));
        assert!(adapter.convert_direct(p.x, p.y).is_err());
        assert!(adapter.convert_direct(330.0, 250.0).is_ok());
    }

    #[test]
    fn test_unrepresentable_cell_is_out_of_domain() {
        let adapter = grid(Box::new(ProjectiveModel::identity()));
        assert!(matches!(
            adapter.convert_direct(-1e300, 5.0),
            Err(TransfoError::OutOfDomain { .. })
        ));
        assert!(adapter.convert_inverse(5.0, f64::MAX).is_err());
        assert!(adapter.current_direct_extent().is_none());

        let p = adapter.convert_direct(5.0, 5.0).unwrap();
        assert!(p.distance_to(&Position::new(5.0, 5.0)) < 1e-9);
    }

    #[test]
    fn test_tiny_cells_fit_identity() {
        let config = GridAdapterConfig {
            direct_step: 1e-5,
            inverse_step: 1e-5,
            ..GridAdapterConfig::default()
        };
        let adapter = ProjectiveGridAdapter::new(Box::new(ProjectiveModel::identity()), config);
        let p = adapter.convert_direct(0.00123, 0.00456).unwrap();
        assert!((p.x - 0.00123).abs() < 1e-12);
        assert!((p.y - 0.00456).abs() < 1e-12);
        let back = adapter.convert_inverse(p.x, p.y).unwrap();
        assert!(back.distance_to(&Position::new(0.00123, 0.00456)) < 1e-12);
    }

    #[test]
    fn test_reverse_swaps_directions() {
        let original = grid(Box::new(lens())).with_application_area(Extent::new(0.0, 0.0, 640.0, 480.0));
        let mut reversed = original.clone();
        reversed.reverse();

        let expected = original.convert_inverse(100.0, 80.0).unwrap();
        let actual = reversed.convert_direct(100.0, 80.0).unwrap();
        assert!(expected.distance_to(&actual) < 1e-9);
        assert!(reversed.application_area().is_some());
    }

    #[test]
    fn test_linear_composition_folds_into_adapter() {
        let adapter = grid(Box::new(lens()));
        let shift = ProjectiveModel::translation(5.0, -3.0);

        let after = compose(&adapter, &shift);
        let p = adapter.convert_direct(50.0, 60.0).unwrap();
        let q = after.convert_direct(50.0, 60.0).unwrap();
        assert!((q.x - p.x - 5.0).abs() < 1e-9);
        assert!((q.y - p.y + 3.0).abs() < 1e-9);
        assert!(!after.is_convert_direct_thread_safe());

        let before = compose(&shift, &adapter);
        let r = before.convert_direct(45.0, 63.0).unwrap();
        assert!(r.distance_to(&p) < 1e-9);
    }

    #[test]
    fn test_matrix_only_for_linear_core() {
        let linear = grid(Box::new(affine()));
        assert!(linear.can_be_represented_by_a_matrix());
        assert_eq!(linear.matrix(), Some(*affine().homography()));

        let curved = grid(Box::new(lens()));
        assert!(!curved.can_be_represented_by_a_matrix());
        assert!(curved.matrix().is_none());

        let flat = grid(Box::new(RadialDistortion::new(Position::new(0.0, 0.0), 0.0, 0.0, 1.0)));
        assert!(flat.can_be_represented_by_a_matrix());
        assert_eq!(flat.matrix(), Some(Matrix3::identity()));
    }
}
