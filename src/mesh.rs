//! Meshes of polygonal facets
//!
//! A [`Mesh`] only describes facet geometry and is shared between adapters.
//! A [`FacetMesh`] is built from it by attaching a local model to every facet
//! and indexing the facets for point lookups.

use std::sync::Arc;

use crate::error::IndexError;
use crate::extent::{Extent, Position};
use crate::spatial_index::{NodeId, Spatial, SpatialIndex, UniqueInPointFinder};
use crate::transform::ProjectiveModel;

/// Polygon facets covering an area
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    facets: Vec<Vec<Position>>,
    extent: Extent,
}

impl Mesh {
    /// Facets are simple polygons of at least three vertices
    pub fn new(facets: Vec<Vec<Position>>) -> Self {
        debug_assert!(
            facets.iter().all(|facet| facet.len() >= 3),
            "facets need at least three vertices"
        );
        let mut extent = Extent::undefined();
        for vertex in facets.iter().flatten() {
            extent.add(*vertex);
        }
        Self { facets, extent }
    }

    /// `rows × columns` quads covering `area`
    pub fn regular(area: &Extent, rows: usize, columns: usize) -> Self {
        let (xs, ys) = lattice(area, rows, columns);
        let mut facets = Vec::with_capacity(rows * columns);
        for row in 0..rows {
            for column in 0..columns {
                facets.push(vec![
                    Position::new(xs[column], ys[row]),
                    Position::new(xs[column + 1], ys[row]),
                    Position::new(xs[column + 1], ys[row + 1]),
                    Position::new(xs[column], ys[row + 1]),
                ]);
            }
        }
        Self::new(facets)
    }

    /// The quads of [`Mesh::regular`], each split into two triangles
    pub fn triangulated(area: &Extent, rows: usize, columns: usize) -> Self {
        let (xs, ys) = lattice(area, rows, columns);
        let mut facets = Vec::with_capacity(2 * rows * columns);
        for row in 0..rows {
            for column in 0..columns {
                let a = Position::new(xs[column], ys[row]);
                let b = Position::new(xs[column + 1], ys[row]);
                let c = Position::new(xs[column + 1], ys[row + 1]);
                let d = Position::new(xs[column], ys[row + 1]);
                facets.push(vec![a, b, c]);
                facets.push(vec![a, c, d]);
            }
        }
        Self::new(facets)
    }

    pub fn facets(&self) -> &[Vec<Position>] {
        &self.facets
    }

    pub fn count_facets(&self) -> usize {
        self.facets.len()
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }
}

/// Grid line coordinates; the last line lands exactly on the area border so
/// neighbouring facets share their vertices bit for bit
fn lattice(area: &Extent, rows: usize, columns: usize) -> (Vec<f64>, Vec<f64>) {
    let rows = rows.max(1);
    let columns = columns.max(1);
    let line = |min: f64, max: f64, count: usize, i: usize| {
        if i == count {
            max
        } else {
            min + (max - min) * i as f64 / count as f64
        }
    };
    let xs = (0..=columns)
        .map(|i| line(area.x_min(), area.x_max(), columns, i))
        .collect();
    let ys = (0..=rows)
        .map(|i| line(area.y_min(), area.y_max(), rows, i))
        .collect();
    (xs, ys)
}

/// Signed area, positive for counter-clockwise polygons
pub fn polygon_area(polygon: &[Position]) -> f64 {
    let n = polygon.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let a = polygon[i];
            let b = polygon[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice / 2.0
}

/// Point in polygon, borders included
pub fn polygon_contains(polygon: &[Position], extent: &Extent, p: &Position) -> bool {
    if !extent.is_point_outer_in(p) {
        return false;
    }

    let tolerance = extent.tolerance();
    let n = polygon.len();
    let mut inside = false;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];

        // On the edge
        let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
        let length = a.distance_to(&b);
        if cross.abs() <= tolerance * length.max(1.0)
            && p.x >= a.x.min(b.x) - tolerance
            && p.x <= a.x.max(b.x) + tolerance
            && p.y >= a.y.min(b.y) - tolerance
            && p.y <= a.y.max(b.y) + tolerance
        {
            return true;
        }

        if (a.y > p.y) != (b.y > p.y) {
            let crossing = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < crossing {
                inside = !inside;
            }
        }
    }
    inside
}

/// A facet with the local model that approximates the adapted model on it
#[derive(Debug)]
pub struct Facet {
    id: usize,
    polygon: Vec<Position>,
    extent: Extent,
    model: ProjectiveModel,
}

impl Facet {
    pub fn new(id: usize, polygon: Vec<Position>, model: ProjectiveModel) -> Self {
        let extent = Extent::bounding(&polygon);
        Self {
            id,
            polygon,
            extent,
            model,
        }
    }

    /// Index of the source facet in its [`Mesh`]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn polygon(&self) -> &[Position] {
        &self.polygon
    }

    pub fn model(&self) -> &ProjectiveModel {
        &self.model
    }
}

impl PartialEq for Facet {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Spatial for Facet {
    fn extent(&self) -> Extent {
        self.extent
    }

    fn is_point_in(&self, p: &Position) -> bool {
        polygon_contains(&self.polygon, &self.extent, p)
    }
}

/// Facets with their models, indexed for point lookups
#[derive(Debug, Clone)]
pub struct FacetMesh {
    index: SpatialIndex<Arc<Facet>, UniqueInPointFinder>,
}

impl FacetMesh {
    pub fn new(split_threshold: usize) -> Self {
        Self {
            index: SpatialIndex::new(split_threshold),
        }
    }

    pub fn add(&mut self, facet: Facet) -> Result<(), IndexError> {
        self.index.add_item(Arc::new(facet))
    }

    pub fn len(&self) -> usize {
        self.index.count_items()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &SpatialIndex<Arc<Facet>, UniqueInPointFinder> {
        &self.index
    }

    /// Facet containing `p`, searching outward from `start` when given.
    /// Also returns the node holding the facet.
    pub fn find(&self, p: &Position, start: Option<NodeId>) -> Option<(Arc<Facet>, NodeId)> {
        let start = start.or_else(|| self.index.root())?;
        let (found, node) = self.index.get_at_from(start, p);
        found.into_iter().next().zip(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Vec<Position> {
        vec![
            Position::new(0.0, 0.0),
            Position::new(1.0, 0.0),
            Position::new(1.0, 1.0),
            Position::new(0.0, 1.0),
        ]
    }

    #[test]
    fn test_regular_mesh_layout() {
        let mesh = Mesh::regular(&Extent::new(0.0, 0.0, 30.0, 20.0), 2, 3);
        assert_eq!(mesh.count_facets(), 6);
        assert_eq!(mesh.extent(), Extent::new(0.0, 0.0, 30.0, 20.0));
        assert_eq!(mesh.facets()[4][0], Position::new(10.0, 10.0));
        assert!(mesh.facets().iter().all(|facet| polygon_area(facet) > 0.0));
    }

    #[test]
    fn test_triangulated_mesh_covers_same_area() {
        let area = Extent::new(-1.0, -1.0, 2.0, 1.0);
        let quads = Mesh::regular(&area, 3, 4);
        let triangles = Mesh::triangulated(&area, 3, 4);
        assert_eq!(triangles.count_facets(), 2 * quads.count_facets());

        let total: f64 = triangles.facets().iter().map(|f| polygon_area(f)).sum();
        assert!((total - area.area()).abs() < 1e-12);
    }

    #[test]
    fn test_polygon_contains_borders() {
        let square = unit_square();
        let extent = Extent::bounding(&square);
        assert!(polygon_contains(&square, &extent, &Position::new(0.5, 0.5)));
        assert!(polygon_contains(&square, &extent, &Position::new(1.0, 0.3)));
        assert!(polygon_contains(&square, &extent, &Position::new(0.0, 0.0)));
        assert!(!polygon_contains(&square, &extent, &Position::new(1.01, 0.5)));

        let triangle = vec![
            Position::new(0.0, 0.0),
            Position::new(1.0, 0.0),
            Position::new(1.0, 1.0),
        ];
        let extent = Extent::bounding(&triangle);
        assert!(polygon_contains(&triangle, &extent, &Position::new(0.5, 0.5)));
        assert!(polygon_contains(&triangle, &extent, &Position::new(0.8, 0.2)));
        assert!(!polygon_contains(&triangle, &extent, &Position::new(0.2, 0.8)));
    }

    #[test]
    fn test_facet_mesh_lookup() {
        let mesh = Mesh::regular(&Extent::new(0.0, 0.0, 100.0, 100.0), 10, 10);
        let mut facets = FacetMesh::new(4);
        for (id, polygon) in mesh.facets().iter().enumerate() {
            facets
                .add(Facet::new(id, polygon.clone(), ProjectiveModel::identity()))
                .unwrap();
        }
        assert_eq!(facets.len(), 100);

        let (facet, node) = facets.find(&Position::new(35.0, 72.0), None).unwrap();
        assert_eq!(facet.id(), 73);

        // Searching from the last node reaches neighbours too
        let (neighbour, _) = facets.find(&Position::new(45.0, 72.0), Some(node)).unwrap();
        assert_eq!(neighbour.id(), 74);
        let (far, _) = facets.find(&Position::new(95.0, 5.0), Some(node)).unwrap();
        assert_eq!(far.id(), 9);

        assert!(facets.find(&Position::new(150.0, 50.0), Some(node)).is_none());
    }
}
