//! Projective mesh adapter
//!
//! Approximates a model by one local model per facet of a [`Mesh`]. Facet
//! models are created once, on the first conversion, for both directions:
//! the inverse mesh is made of the converted facets carrying the reversed
//! models. Points outside every facet fall back to a default model fitted on
//! the mesh extent.
//!
//! Conversions along a scanline mostly land in the facet hit last, so that
//! facet is tested first and the index search starts from its node.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::MeshAdapterConfig;
use crate::error::{TransfoError, TransfoResult};
use crate::extent::{Extent, Position};
use crate::mesh::{polygon_area, Facet, FacetMesh, Mesh};
use crate::precision::TransfoModelAdapter;
use crate::spatial_index::{NodeId, Spatial};
use crate::transform::{map_extent, ProjectiveModel, TransfoModel};

/// Builds the local model of a facet from its vertices and their images
pub trait FacetFitter: Debug {
    fn fit(&self, src: &[Position], dst: &[Position]) -> TransfoResult<ProjectiveModel>;

    fn clone_box(&self) -> Box<dyn FacetFitter>;
}

impl Clone for Box<dyn FacetFitter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Exact projective fit on quads, affine on triangles, least squares beyond
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectiveFitter;

impl FacetFitter for ProjectiveFitter {
    fn fit(&self, src: &[Position], dst: &[Position]) -> TransfoResult<ProjectiveModel> {
        ProjectiveModel::fit(src, dst)
    }

    fn clone_box(&self) -> Box<dyn FacetFitter> {
        Box::new(*self)
    }
}

/// Affine fit whatever the facet shape, exact on triangles
#[derive(Debug, Clone, Copy, Default)]
pub struct AffineFitter;

impl FacetFitter for AffineFitter {
    fn fit(&self, src: &[Position], dst: &[Position]) -> TransfoResult<ProjectiveModel> {
        ProjectiveModel::fit_affine(src, dst)
    }

    fn clone_box(&self) -> Box<dyn FacetFitter> {
        Box::new(*self)
    }
}

#[derive(Debug)]
struct DerivedModels {
    direct: FacetMesh,
    inverse: FacetMesh,
    default_model: ProjectiveModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Direct,
    Inverse,
}

#[derive(Debug, Clone, Default)]
struct MeshState {
    models: Option<Arc<DerivedModels>>,
    last_direct: Option<(Arc<Facet>, NodeId)>,
    last_inverse: Option<(Arc<Facet>, NodeId)>,
}

/// Adapter approximating a model by per-facet projective models
#[derive(Debug, Clone)]
pub struct ProjectiveMeshAdapter {
    /// Applied before the adapted model
    pre: ProjectiveModel,
    /// Applied after the adapted model
    post: ProjectiveModel,
    model: Box<dyn TransfoModel>,
    mesh: Arc<Mesh>,
    fitter: Box<dyn FacetFitter>,
    config: MeshAdapterConfig,
    reversed: bool,
    state: RefCell<MeshState>,
}

impl ProjectiveMeshAdapter {
    pub fn new(model: Box<dyn TransfoModel>, mesh: Arc<Mesh>, config: MeshAdapterConfig) -> Self {
        Self {
            pre: ProjectiveModel::identity(),
            post: ProjectiveModel::identity(),
            model,
            mesh,
            fitter: Box::new(ProjectiveFitter),
            config,
            reversed: false,
            state: RefCell::new(MeshState::default()),
        }
    }

    /// Replace the facet fitter; models already created are dropped
    pub fn with_fitter(mut self, fitter: Box<dyn FacetFitter>) -> Self {
        self.fitter = fitter;
        self.state = RefCell::new(MeshState::default());
        self
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn adapted_model(&self) -> &dyn TransfoModel {
        self.model.as_ref()
    }

    pub fn models_created(&self) -> bool {
        self.state.borrow().models.is_some()
    }

    /// Facets kept in the direct mesh, 0 before models are created
    pub fn direct_facet_count(&self) -> usize {
        self.state
            .borrow()
            .models
            .as_ref()
            .map_or(0, |models| models.direct.len())
    }

    pub fn inverse_facet_count(&self) -> usize {
        self.state
            .borrow()
            .models
            .as_ref()
            .map_or(0, |models| models.inverse.len())
    }

    /// Fit the facet models of both directions if not done yet
    pub fn create_models(&self) -> TransfoResult<()> {
        if self.models_created() {
            return Ok(());
        }
        let models = self.build_models()?;
        self.state.borrow_mut().models = Some(Arc::new(models));
        Ok(())
    }

    /// Projective model fitted on the four corners of the mesh extent
    pub fn create_default_model(&self) -> TransfoResult<ProjectiveModel> {
        let extent = self.mesh.extent();
        if !extent.is_defined() {
            return Err(TransfoError::SingularFit { kind: "default" });
        }
        let src = extent.corners();
        let mut dst = [Position::default(); 4];
        for (target, corner) in dst.iter_mut().zip(src.iter()) {
            *target = self.model.convert_direct(corner.x, corner.y)?;
        }
        ProjectiveModel::from_corners(src, dst)
    }

    fn build_models(&self) -> TransfoResult<DerivedModels> {
        let mut direct = FacetMesh::new(self.config.split_threshold);
        let mut inverse = FacetMesh::new(self.config.split_threshold);
        let mut src_vertices = Vec::new();
        let mut dst_vertices = Vec::new();
        let mut dropped = 0;

        for (id, polygon) in self.mesh.facets().iter().enumerate() {
            let converted = match polygon
                .iter()
                .map(|v| self.model.convert_direct(v.x, v.y))
                .collect::<TransfoResult<Vec<_>>>()
            {
                Ok(converted) => converted,
                Err(err) => {
                    warn!("Dropping facet {}: {}", id, err);
                    dropped += 1;
                    continue;
                }
            };

            let src_area = polygon_area(polygon).abs();
            let dst_area = polygon_area(&converted).abs();
            if dst_area <= self.config.degenerate_epsilon * src_area {
                warn!(
                    "Dropping facet {}: converted area {} is degenerate",
                    id, dst_area
                );
                dropped += 1;
                continue;
            }

            let fitted = match self.fitter.fit(polygon, &converted) {
                Ok(fitted) => fitted,
                Err(err) => {
                    warn!("Dropping facet {}: {}", id, err);
                    dropped += 1;
                    continue;
                }
            };

            let reversed = fitted.reversed();
            let added = direct
                .add(Facet::new(id, polygon.clone(), fitted))
                .and_then(|_| inverse.add(Facet::new(id, converted.clone(), reversed)));
            if let Err(err) = added {
                warn!("Dropping facet {}: {}", id, err);
                dropped += 1;
                continue;
            }

            src_vertices.extend_from_slice(polygon);
            dst_vertices.extend(converted);
        }

        let default_model = match self.create_default_model() {
            Ok(model) => model,
            // Corners outside the model domain, fit what the facets converted
            Err(err) => {
                debug!("Default model from facet vertices: {}", err);
                ProjectiveModel::fit(&src_vertices, &dst_vertices)?
            }
        };

        debug!(
            "Created {} facet models, dropped {}",
            direct.len(),
            dropped
        );
        Ok(DerivedModels {
            direct,
            inverse,
            default_model,
        })
    }

    /// Convert a point of the adapted model's space through the facet models
    fn convert_through_facets(&self, direction: Direction, p: Position) -> TransfoResult<Position> {
        self.create_models()?;
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(models) = state.models.clone() else {
            return Err(TransfoError::SingularFit { kind: "mesh" });
        };
        let (facets, last) = match direction {
            Direction::Direct => (&models.direct, &mut state.last_direct),
            Direction::Inverse => (&models.inverse, &mut state.last_inverse),
        };

        if let Some((facet, _)) = last.as_ref() {
            if facet.is_point_in(&p) {
                return facet.model().transform_point(p.x, p.y);
            }
        }

        let start = last.as_ref().map(|(_, node)| *node);
        if let Some((facet, node)) = facets.find(&p, start) {
            let result = facet.model().transform_point(p.x, p.y);
            *last = Some((facet, node));
            return result;
        }

        match direction {
            Direction::Direct => models.default_model.transform_point(p.x, p.y),
            Direction::Inverse => models.default_model.inverse_transform_point(p.x, p.y),
        }
    }

    fn forward(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let p = self.pre.transform_point(x, y)?;
        let p = self.convert_through_facets(Direction::Direct, p)?;
        self.post.transform_point(p.x, p.y)
    }

    fn backward(&self, x: f64, y: f64) -> TransfoResult<Position> {
        let p = self.post.inverse_transform_point(x, y)?;
        let p = self.convert_through_facets(Direction::Inverse, p)?;
        self.pre.inverse_transform_point(p.x, p.y)
    }
}

impl TransfoModel for ProjectiveMeshAdapter {
    fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        if self.reversed {
            self.backward(x, y)
        } else {
            self.forward(x, y)
        }
    }

    fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
        if self.reversed {
            self.forward(x, y)
        } else {
            self.backward(x, y)
        }
    }

    fn clone_box(&self) -> Box<dyn TransfoModel> {
        Box::new(self.clone())
    }

    fn reverse(&mut self) {
        self.reversed = !self.reversed;
    }

    fn is_convert_direct_thread_safe(&self) -> bool {
        false
    }

    fn is_convert_inverse_thread_safe(&self) -> bool {
        false
    }

    fn compose_linear_after(&self, after: &ProjectiveModel) -> Option<Box<dyn TransfoModel>> {
        let mut composed = self.clone();
        if self.reversed {
            composed.pre = after.reversed().then(&self.pre);
        } else {
            composed.post = self.post.then(after);
        }
        Some(Box::new(composed))
    }

    fn compose_linear_before(&self, before: &ProjectiveModel) -> Option<Box<dyn TransfoModel>> {
        let mut composed = self.clone();
        if self.reversed {
            composed.post = self.post.then(&before.reversed());
        } else {
            composed.pre = before.then(&self.pre);
        }
        Some(Box::new(composed))
    }
}

impl TransfoModelAdapter for ProjectiveMeshAdapter {
    fn exact_convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
        if self.reversed {
            let p = self.post.inverse_transform_point(x, y)?;
            let p = self.model.convert_inverse(p.x, p.y)?;
            self.pre.inverse_transform_point(p.x, p.y)
        } else {
            let p = self.pre.transform_point(x, y)?;
            let p = self.model.convert_direct(p.x, p.y)?;
            self.post.transform_point(p.x, p.y)
        }
    }

    /// The mesh extent, expressed in this adapter's input coordinates
    fn application_area(&self) -> Option<Extent> {
        let extent = self.mesh.extent();
        if !extent.is_defined() {
            return None;
        }
        if self.reversed {
            map_extent(&extent, |x, y| {
                let p = self.model.convert_direct(x, y)?;
                self.post.transform_point(p.x, p.y)
            })
        } else {
            map_extent(&extent, |x, y| self.pre.inverse_transform_point(x, y))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distortion::RadialDistortion;
    use crate::transform::compose;

    fn lens() -> RadialDistortion {
        RadialDistortion::new(Position::new(200.0, 200.0), 0.08, -0.01, 300.0)
    }

    fn area() -> Extent {
        Extent::new(0.0, 0.0, 400.0, 400.0)
    }

    fn adapter(model: Box<dyn TransfoModel>, rows: usize, columns: usize) -> ProjectiveMeshAdapter {
        ProjectiveMeshAdapter::new(
            model,
            Arc::new(Mesh::regular(&area(), rows, columns)),
            MeshAdapterConfig::default(),
        )
    }

    /// Clamps everything right of x = 200 onto that line
    #[derive(Debug, Clone)]
    struct Squash;

    impl TransfoModel for Squash {
        fn convert_direct(&self, x: f64, y: f64) -> TransfoResult<Position> {
            Ok(Position::new(x.min(200.0), y))
        }

        fn convert_inverse(&self, x: f64, y: f64) -> TransfoResult<Position> {
            Err(TransfoError::OutOfDomain { x, y })
        }

        fn clone_box(&self) -> Box<dyn TransfoModel> {
            Box::new(self.clone())
        }

        fn reverse(&mut self) {}
    }

    #[test]
    fn test_models_created_on_first_use() {
        let adapter = adapter(Box::new(lens()), 4, 4);
        assert!(!adapter.models_created());
        assert_eq!(adapter.direct_facet_count(), 0);

        adapter.convert_direct(10.0, 10.0).unwrap();
        assert!(adapter.models_created());
        assert_eq!(adapter.direct_facet_count(), 16);
        assert_eq!(adapter.inverse_facet_count(), 16);
    }

    #[test]
    fn test_shared_vertex_is_consistent() {
        let adapter = adapter(Box::new(lens()), 4, 4);
        adapter.create_models().unwrap();
        let vertex = Position::new(100.0, 100.0);
        let exact = lens().convert_direct(vertex.x, vertex.y).unwrap();

        let converted = adapter.convert_direct(vertex.x, vertex.y).unwrap();
        assert!(converted.is_finite());
        assert!(converted.distance_to(&exact) < 1e-6);

        let state = adapter.state.borrow();
        let models = state.models.as_ref().unwrap();
        let sharing: Vec<_> = models
            .direct
            .index()
            .get_all()
            .into_iter()
            .filter(|facet| facet.polygon().contains(&vertex))
            .collect();
        assert_eq!(sharing.len(), 4);
        for facet in sharing {
            let p = facet.model().transform_point(vertex.x, vertex.y).unwrap();
            assert!(p.distance_to(&converted) < 1e-6);
        }
    }

    #[test]
    fn test_far_point_uses_default_model() {
        let adapter = adapter(Box::new(lens()), 4, 4);
        let far = adapter.convert_direct(5000.0, -3000.0).unwrap();
        assert!(far.is_finite());

        let default_model = adapter.create_default_model().unwrap();
        let expected = default_model.transform_point(5000.0, -3000.0).unwrap();
        assert!(far.distance_to(&expected) < 1e-9);

        let back = adapter.convert_inverse(far.x, far.y).unwrap();
        assert!((back.x - 5000.0).abs() < 1e-6);
        assert!((back.y + 3000.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_facets_are_dropped() {
        let adapter = adapter(Box::new(Squash), 4, 4);
        adapter.create_models().unwrap();
        assert_eq!(adapter.direct_facet_count(), 8);
        assert_eq!(adapter.inverse_facet_count(), 8);

        let p = adapter.convert_direct(50.0, 250.0).unwrap();
        assert!(p.distance_to(&Position::new(50.0, 250.0)) < 1e-9);
    }

    #[test]
    fn test_failed_vertices_drop_facets() {
        let model = lens().with_valid_radius(230.0);
        let adapter = adapter(Box::new(model), 4, 4);
        adapter.create_models().unwrap();
        // The four corner facets reach beyond the valid radius
        assert_eq!(adapter.direct_facet_count(), 12);
        assert!(adapter.convert_direct(5.0, 5.0).unwrap().is_finite());
    }

    #[test]
    fn test_last_hit_facet_is_reused() {
        let adapter = adapter(Box::new(lens()), 8, 8);
        let fresh = adapter.clone();
        for i in 0..50 {
            let x = 3.0 + i as f64 * 7.9;
            let cached = adapter.convert_direct(x, 123.0).unwrap();
            let expected = fresh.clone().convert_direct(x, 123.0).unwrap();
            assert_eq!(cached, expected);
        }

        let state = adapter.state.borrow();
        let (facet, _) = state.last_direct.as_ref().unwrap();
        assert!(facet.is_point_in(&Position::new(3.0 + 49.0 * 7.9, 123.0)));
        assert!(state.last_inverse.is_none());
    }

    #[test]
    fn test_inverse_round_trip() {
        let adapter = adapter(Box::new(lens()), 8, 8);
        for (x, y) in [(12.0, 17.0), (199.0, 201.0), (390.0, 5.0), (250.0, 333.0)] {
            let p = adapter.convert_direct(x, y).unwrap();
            let back = adapter.convert_inverse(p.x, p.y).unwrap();
            assert!((back.x - x).abs() < 1e-6, "{} vs {}", back.x, x);
            assert!((back.y - y).abs() < 1e-6, "{} vs {}", back.y, y);
        }
    }

    #[test]
    fn test_triangles_with_affine_fitter() {
        let mesh = Arc::new(Mesh::triangulated(&area(), 6, 6));
        let adapter = ProjectiveMeshAdapter::new(
            Box::new(lens()),
            Arc::clone(&mesh),
            MeshAdapterConfig::default(),
        )
        .with_fitter(Box::new(AffineFitter));
        let report = adapter.study_precision_over(&area(), 10.0).unwrap();
        assert_eq!(adapter.direct_facet_count(), 72);
        assert_eq!(report.rejected_count, 0);
        assert!(report.max_error < 2.0);
    }

    #[test]
    fn test_reverse_flips_directions() {
        let original = adapter(Box::new(lens()), 8, 8);
        let mut reversed = original.clone();
        reversed.reverse();

        let p = Position::new(150.0, 260.0);
        let expected = original.convert_inverse(p.x, p.y).unwrap();
        let actual = reversed.convert_direct(p.x, p.y).unwrap();
        assert!(expected.distance_to(&actual) < 1e-12);

        let exact = reversed.exact_convert_direct(p.x, p.y).unwrap();
        let exact_expected = lens().convert_inverse(p.x, p.y).unwrap();
        assert!(exact.distance_to(&exact_expected) < 1e-12);
        assert!(!reversed.is_convert_inverse_thread_safe());
    }

    #[test]
    fn test_linear_composition_folds_into_adapter() {
        let shift = ProjectiveModel::translation(-20.0, 11.0);
        for reversed in [false, true] {
            let mut adapter = adapter(Box::new(lens()), 8, 8);
            if reversed {
                adapter.reverse();
            }

            let after = compose(&adapter, &shift);
            let p = adapter.convert_direct(120.0, 80.0).unwrap();
            let q = after.convert_direct(120.0, 80.0).unwrap();
            assert!((q.x - p.x + 20.0).abs() < 1e-9);
            assert!((q.y - p.y - 11.0).abs() < 1e-9);

            let before = compose(&shift, &adapter);
            let r = before.convert_direct(140.0, 69.0).unwrap();
            assert!(r.distance_to(&p) < 1e-9);
        }
    }

    #[test]
    fn test_application_area_follows_direction() {
        let mut adapter = adapter(Box::new(lens()), 4, 4);
        assert_eq!(adapter.application_area(), Some(area()));
        adapter.reverse();
        let reversed_area = adapter.application_area().unwrap();
        assert!(reversed_area.width() > area().width());
    }
}
