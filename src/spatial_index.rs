//! Quadtree spatial index
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. A leaf splits
//! into four quadrants when it would reach the split threshold; items that fit
//! in no quadrant stay on the node that could not place them.
//!
//! Queries can start from any node. They search the node, its children and
//! then walk up to the parent, never going back toward the node that
//! initiated the call, so a query started from a recently used node only
//! visits the neighbourhood it needs.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::IndexError;
use crate::extent::{Extent, Position, EPSILON_MULTIPLIER};

/// Smallest accepted split threshold
pub const MINIMAL_THRESHOLD: usize = 3;

/// Split threshold used when none is given
pub const DEFAULT_THRESHOLD: usize = 10;

/// Leaves this deep below the root are never split, so coincident items
/// may crowd them past the threshold
pub const MAX_DEPTH: usize = 48;

/// Anything that can be located by an extent
pub trait Spatial {
    fn extent(&self) -> Extent;

    /// Exact containment test, used by finders that need more than the extent
    fn is_point_in(&self, p: &Position) -> bool {
        self.extent().is_point_outer_in(p)
    }
}

impl Spatial for Position {
    fn extent(&self) -> Extent {
        Extent::new(self.x, self.y, self.x, self.y)
    }
}

impl Spatial for Extent {
    fn extent(&self) -> Extent {
        *self
    }
}

impl<S: Spatial + ?Sized> Spatial for Arc<S> {
    fn extent(&self) -> Extent {
        (**self).extent()
    }

    fn is_point_in(&self, p: &Position) -> bool {
        (**self).is_point_in(p)
    }
}

impl<S: Spatial + ?Sized> Spatial for Rc<S> {
    fn extent(&self) -> Extent {
        (**self).extent()
    }

    fn is_point_in(&self, p: &Position) -> bool {
        (**self).is_point_in(p)
    }
}

/// Query policy of an index.
///
/// A probable solution is checked cheaply against extents; only probable
/// solutions are handed to the possibly expensive exact test.
pub trait Finder<T: Spatial> {
    /// Whether a query may stop at the first solution found
    fn has_unique_solution() -> bool;

    fn is_a_probable_solution_at(item: &T, _node_extent: &Extent, p: &Position) -> bool {
        item.extent().is_point_outer_in(p)
    }

    fn is_a_solution_at(_item: &T, _node_extent: &Extent, _p: &Position) -> bool {
        true
    }

    fn is_a_probable_solution_in(item: &T, _node_extent: &Extent, area: &Extent) -> bool {
        item.extent().outer_overlaps(area)
    }

    fn is_a_solution_in(_item: &T, _node_extent: &Extent, _area: &Extent) -> bool {
        true
    }
}

/// Every item near the query is a solution
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFinder;

impl<T: Spatial> Finder<T> for DefaultFinder {
    fn has_unique_solution() -> bool {
        false
    }
}

/// Items are mutually exclusive; the first one containing the point wins
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueInPointFinder;

impl<T: Spatial> Finder<T> for UniqueInPointFinder {
    fn has_unique_solution() -> bool {
        true
    }

    fn is_a_solution_at(item: &T, _node_extent: &Extent, p: &Position) -> bool {
        item.is_point_in(p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKind {
    Leaf,
    /// Children in NW, NE, SW, SE order
    Internal { children: [NodeId; 4] },
}

#[derive(Debug, Clone)]
pub struct Node<T> {
    extent: Extent,
    parent: Option<NodeId>,
    kind: NodeKind,
    items: Vec<T>,
}

impl<T> Node<T> {
    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn children(&self) -> Option<[NodeId; 4]> {
        match self.kind {
            NodeKind::Leaf => None,
            NodeKind::Internal { children } => Some(children),
        }
    }

    /// Items referenced directly by this node
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

/// Quadtree over shared items
#[derive(Debug, Clone)]
pub struct SpatialIndex<T, F = DefaultFinder> {
    nodes: Vec<Node<T>>,
    root: Option<NodeId>,
    split_threshold: usize,
    max_extent: Option<Extent>,
    _finder: PhantomData<F>,
}

impl<T, F> SpatialIndex<T, F>
where
    T: Spatial + Clone + PartialEq,
    F: Finder<T>,
{
    /// Index whose root grows to accommodate whatever is added
    pub fn new(split_threshold: usize) -> Self {
        debug_assert!(
            split_threshold >= MINIMAL_THRESHOLD,
            "split threshold below {}",
            MINIMAL_THRESHOLD
        );
        Self {
            nodes: Vec::new(),
            root: None,
            split_threshold,
            max_extent: None,
            _finder: PhantomData,
        }
    }

    /// Index restricted to a fixed extent
    pub fn with_extent(split_threshold: usize, extent: Extent) -> Self {
        let mut index = Self::new(split_threshold);
        let root = index.create_node(extent, None);
        index.root = Some(root);
        index.max_extent = Some(index.nodes[root.0].extent);
        index
    }

    fn create_node(&mut self, extent: Extent, parent: Option<NodeId>) -> NodeId {
        let mut extent = extent;
        // Zero sized nodes could never be split meaningfully
        if !(extent.x_max() > extent.x_min()) {
            let grow = (extent.x_min().abs() * EPSILON_MULTIPLIER * 1000.0).max(1.0);
            extent.set_x_max(extent.x_min() + grow);
        }
        if !(extent.y_max() > extent.y_min()) {
            let grow = (extent.y_min().abs() * EPSILON_MULTIPLIER * 1000.0).max(1.0);
            extent.set_y_max(extent.y_min() + grow);
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            extent,
            parent,
            kind: NodeKind::Leaf,
            items: Vec::new(),
        });
        id
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node<T> {
        &self.nodes[id.0]
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id.0].is_leaf()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_extent(&self) -> Option<Extent> {
        self.max_extent
    }

    /// Extent currently covered by the root
    pub fn extent(&self) -> Option<Extent> {
        self.root.map(|root| self.nodes[root.0].extent)
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    /// Change the threshold for every node, splitting leaves that now exceed it
    pub fn set_split_threshold(&mut self, split_threshold: usize) {
        debug_assert!(
            split_threshold >= MINIMAL_THRESHOLD,
            "split threshold below {}",
            MINIMAL_THRESHOLD
        );
        self.split_threshold = split_threshold;

        let crowded: Vec<NodeId> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| {
                let node = &self.nodes[id.0];
                node.is_leaf() && node.items.len() >= split_threshold && self.can_split(*id)
            })
            .collect();
        for id in crowded {
            // An earlier split may have cascaded into this node already
            if self.nodes[id.0].is_leaf() {
                self.split_node(id);
            }
        }
    }

    /// Add an item, growing the index if it has no fixed extent
    pub fn add_item(&mut self, item: T) -> Result<(), IndexError> {
        let item_extent = item.extent();
        if !item_extent.is_defined() {
            return Err(IndexError::UndefinedExtent);
        }

        let root = match self.root {
            Some(root) => root,
            None => {
                let root = self.create_node(item_extent, None);
                self.root = Some(root);
                root
            }
        };

        let extent_fixed = self.max_extent.is_some();
        if self.add_item_conditional(item.clone(), extent_fixed) {
            return Ok(());
        }
        if extent_fixed {
            return Err(IndexError::OutsideFixedExtent);
        }

        debug_assert!(!self.is_leaf(root));
        self.push_root_down(&item_extent);
        let root = self.root.unwrap_or(root);
        self.add_item_at(root, item);
        Ok(())
    }

    /// Add an item if it fits the root; a parentless leaf root that is not
    /// extent-fixed grows to accommodate it instead
    pub fn add_item_conditional(&mut self, item: T, extent_fixed: bool) -> bool {
        let Some(root) = self.root else {
            return false;
        };
        let item_extent = item.extent();
        let node = &self.nodes[root.0];
        if node.extent.contains(&item_extent) {
            self.add_item_at(root, item);
            return true;
        }
        if !extent_fixed && node.parent.is_none() && node.is_leaf() {
            self.nodes[root.0].extent.union(&item_extent);
            self.add_item_at(root, item);
            return true;
        }
        false
    }

    fn add_item_at(&mut self, id: NodeId, item: T) {
        {
            let node = &self.nodes[id.0];
            let crowded = node.is_leaf() && node.items.len() + 1 >= self.split_threshold;
            if crowded && self.can_split(id) {
                self.split_node(id);
            }
        }

        let kind = self.nodes[id.0].kind;
        match kind {
            NodeKind::Leaf => self.nodes[id.0].items.push(item),
            NodeKind::Internal { children } => match self.containing_child(&children, &item.extent()) {
                Some(child) => self.add_item_at(child, item),
                // Too large for any quadrant
                None => self.nodes[id.0].items.push(item),
            },
        }
    }

    fn can_split(&self, id: NodeId) -> bool {
        std::iter::successors(self.nodes[id.0].parent, |parent| self.nodes[parent.0].parent)
            .nth(MAX_DEPTH - 1)
            .is_none()
    }

    fn containing_child(&self, children: &[NodeId; 4], extent: &Extent) -> Option<NodeId> {
        children
            .iter()
            .copied()
            .find(|child| self.nodes[child.0].extent.contains(extent))
    }

    fn quadrants(extent: &Extent) -> [Extent; 4] {
        let half_width = extent.width() / 2.0;
        let half_height = extent.height() / 2.0;
        let mid_x = extent.x_min() + half_width;
        let mid_y = extent.y_min() + half_height;
        [
            Extent::new(extent.x_min(), mid_y, mid_x, extent.y_max()),
            Extent::new(mid_x, mid_y, extent.x_max(), extent.y_max()),
            Extent::new(extent.x_min(), extent.y_min(), mid_x, mid_y),
            Extent::new(mid_x, extent.y_min(), extent.x_max(), mid_y),
        ]
    }

    fn split_node(&mut self, id: NodeId) {
        debug_assert!(self.is_leaf(id), "only leaves can be split");

        let quadrants = Self::quadrants(&self.nodes[id.0].extent);
        let children = quadrants.map(|extent| self.create_node(extent, Some(id)));
        self.nodes[id.0].kind = NodeKind::Internal { children };

        let items = std::mem::take(&mut self.nodes[id.0].items);
        let mut kept = Vec::new();
        for item in items {
            match self.containing_child(&children, &item.extent()) {
                Some(child) => self.add_item_at(child, item),
                None => kept.push(item),
            }
        }
        self.nodes[id.0].items = kept;
    }

    /// Replace the root by one twice as large, holding the old root as a
    /// quadrant, until the extent fits
    fn push_root_down(&mut self, extent: &Extent) {
        while let Some(old_root) = self.root {
            let old_extent = self.nodes[old_root.0].extent;
            if old_extent.contains(extent) {
                break;
            }

            let width = old_extent.width();
            let height = old_extent.height();
            let grow_west = extent.x_min() < old_extent.x_min();
            let grow_south = extent.y_min() < old_extent.y_min();

            let (x_min, x_max) = if grow_west {
                (old_extent.x_min() - width, old_extent.x_max())
            } else {
                (old_extent.x_min(), old_extent.x_max() + width)
            };
            let (y_min, y_max) = if grow_south {
                (old_extent.y_min() - height, old_extent.y_max())
            } else {
                (old_extent.y_min(), old_extent.y_max() + height)
            };

            let new_root = self.create_node(Extent::new(x_min, y_min, x_max, y_max), None);
            let new_extent = self.nodes[new_root.0].extent;

            // Old root is east when growing west, north when growing south
            let old_slot = match (grow_south, grow_west) {
                (true, false) => 0,
                (true, true) => 1,
                (false, false) => 2,
                (false, true) => 3,
            };
            let quadrants = Self::quadrants(&new_extent);
            let mut children = [old_root; 4];
            for (slot, quadrant) in quadrants.iter().enumerate() {
                if slot != old_slot {
                    children[slot] = self.create_node(*quadrant, Some(new_root));
                }
            }

            self.nodes[old_root.0].parent = Some(new_root);
            self.nodes[new_root.0].kind = NodeKind::Internal { children };
            self.root = Some(new_root);
            tracing::debug!(?new_extent, "spatial index root pushed down");
        }
    }

    /// Remove one reference to an item; returns false if it was not indexed
    pub fn remove(&mut self, item: &T) -> bool {
        let Some(root) = self.root else {
            return false;
        };
        let item_extent = item.extent();
        if !self.nodes[root.0].extent.contains(&item_extent) {
            return false;
        }
        self.remove_at(root, item, &item_extent)
    }

    fn remove_at(&mut self, id: NodeId, item: &T, item_extent: &Extent) -> bool {
        let kind = self.nodes[id.0].kind;
        if let NodeKind::Internal { children } = kind {
            if let Some(child) = self.containing_child(&children, item_extent) {
                return self.remove_at(child, item, item_extent);
            }
        }

        let items = &mut self.nodes[id.0].items;
        match items.iter().position(|candidate| candidate == item) {
            Some(position) => {
                items.remove(position);
                true
            }
            None => false,
        }
    }

    /// Items located at a position
    pub fn get_at(&self, p: &Position) -> Vec<T> {
        match self.root {
            Some(root) => self.get_at_from(root, p).0,
            None => Vec::new(),
        }
    }

    /// Items located at a position, searching outward from `start`.
    ///
    /// Also returns the node where the last solution was found, a good start
    /// for the next query near the same position.
    pub fn get_at_from(&self, start: NodeId, p: &Position) -> (Vec<T>, Option<NodeId>) {
        let mut found = Vec::new();
        let mut last_node = None;
        self.get_at_node(start, p, &mut found, None, &mut last_node);
        (found, last_node)
    }

    fn get_at_node(
        &self,
        id: NodeId,
        p: &Position,
        found: &mut Vec<T>,
        initiator: Option<NodeId>,
        last_node: &mut Option<NodeId>,
    ) -> usize {
        let unique = F::has_unique_solution();
        let initial_count = found.len();
        let node = &self.nodes[id.0];

        if node.extent.is_point_outer_in(p) {
            if let NodeKind::Internal { children } = &node.kind {
                for child in children {
                    if Some(*child) != initiator
                        && self.get_at_node(*child, p, found, Some(id), last_node) >= 1
                        && unique
                    {
                        return 1;
                    }
                }
            }

            for item in &node.items {
                if F::is_a_probable_solution_at(item, &node.extent, p)
                    && F::is_a_solution_at(item, &node.extent, p)
                {
                    found.push(item.clone());
                    *last_node = Some(id);
                    if unique {
                        return 1;
                    }
                }
            }
        }

        if let Some(parent) = node.parent {
            if Some(parent) != initiator
                && self.get_at_node(parent, p, found, Some(id), last_node) >= 1
                && unique
            {
                return 1;
            }
        }

        found.len() - initial_count
    }

    /// Items overlapping an area, borders included
    pub fn get_in(&self, area: &Extent) -> Vec<T> {
        match self.root {
            Some(root) => self.get_in_from(root, area),
            None => Vec::new(),
        }
    }

    pub fn get_in_from(&self, start: NodeId, area: &Extent) -> Vec<T> {
        let mut found = Vec::new();
        self.get_in_node(start, area, &mut found, None);
        found
    }

    fn get_in_node(&self, id: NodeId, area: &Extent, found: &mut Vec<T>, initiator: Option<NodeId>) {
        let node = &self.nodes[id.0];

        if node.extent.outer_overlaps(area) {
            if let NodeKind::Internal { children } = &node.kind {
                for child in children {
                    if Some(*child) != initiator {
                        self.get_in_node(*child, area, found, Some(id));
                    }
                }
            }

            found.extend(
                node.items
                    .iter()
                    .filter(|item| {
                        F::is_a_probable_solution_in(item, &node.extent, area)
                            && F::is_a_solution_in(item, &node.extent, area)
                    })
                    .cloned(),
            );
        }

        if let Some(parent) = node.parent {
            if Some(parent) != initiator {
                self.get_in_node(parent, area, found, Some(id));
            }
        }
    }

    /// Every indexed item
    pub fn get_all(&self) -> Vec<T> {
        self.nodes.iter().flat_map(|node| node.items.iter().cloned()).collect()
    }

    pub fn count_items(&self) -> usize {
        self.nodes.iter().map(|node| node.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count_items() == 0
    }
}
