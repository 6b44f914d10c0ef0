//! Octree over peak-shape bounding boxes, for overlap detection.

use crate::ellipsoid::{Aabb, Ellipsoid};
use nalgebra::Vector3;
use std::collections::BTreeSet;

/// Leaf capacity before a node splits.
const MAX_STORAGE: usize = 5;
/// Maximum subdivision depth; beyond it the capacity is soft.
const MAX_DEPTH: usize = 5;

struct Node {
    bounds: Aabb,
    items: Vec<usize>,
    children: Option<Box<[Node; 8]>>,
}

impl Node {
    fn new(bounds: Aabb) -> Self {
        Self {
            bounds,
            items: Vec::new(),
            children: None,
        }
    }

    fn octants(&self) -> [Aabb; 8] {
        let c = self.bounds.center();
        let lo = self.bounds.lower;
        let hi = self.bounds.upper;
        std::array::from_fn(|i| {
            let pick = |bit: usize, axis: usize| {
                if (i >> bit) & 1 == 0 {
                    (lo[axis], c[axis])
                } else {
                    (c[axis], hi[axis])
                }
            };
            let (x0, x1) = pick(0, 0);
            let (y0, y1) = pick(1, 1);
            let (z0, z1) = pick(2, 2);
            Aabb::new(Vector3::new(x0, y0, z0), Vector3::new(x1, y1, z1))
        })
    }

    fn insert(&mut self, id: usize, item_bounds: &Aabb, boxes: &[Aabb], depth: usize) {
        if let Some(children) = &mut self.children {
            for child in children.iter_mut() {
                if child.bounds.intersects(item_bounds) {
                    child.insert(id, item_bounds, boxes, depth + 1);
                }
            }
            return;
        }

        self.items.push(id);
        if self.items.len() > MAX_STORAGE && depth < MAX_DEPTH {
            let mut children = Box::new(self.octants().map(Node::new));
            for &item in &self.items {
                for child in children.iter_mut() {
                    if child.bounds.intersects(&boxes[item]) {
                        child.insert(item, &boxes[item], boxes, depth + 1);
                    }
                }
            }
            self.items.clear();
            self.children = Some(children);
        }
    }

    fn collect_pairs(&self, boxes: &[Aabb], pairs: &mut BTreeSet<(usize, usize)>) {
        for (i, &a) in self.items.iter().enumerate() {
            for &b in &self.items[i + 1..] {
                if boxes[a].intersects(&boxes[b]) {
                    pairs.insert((a.min(b), a.max(b)));
                }
            }
        }
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.collect_pairs(boxes, pairs);
            }
        }
    }
}

/// Spatial index over ellipsoids (peaks' shapes), used to find pairs whose
/// scaled regions overlap. The tree does not own the shapes; they are
/// copied in and addressed by insertion order.
pub struct Octree {
    root: Node,
    shapes: Vec<Ellipsoid>,
    boxes: Vec<Aabb>,
    bkg_scale: f64,
}

impl Octree {
    /// A tree spanning the given world box; `bkg_scale` is the scale at
    /// which item bounding boxes are computed (the outermost radius of
    /// interest).
    #[must_use]
    pub fn new(lower: Vector3<f64>, upper: Vector3<f64>, bkg_scale: f64) -> Self {
        Self {
            root: Node::new(Aabb::new(lower, upper)),
            shapes: Vec::new(),
            boxes: Vec::new(),
            bkg_scale,
        }
    }

    /// Insert a shape; returns its id (insertion order).
    pub fn insert(&mut self, shape: Ellipsoid) -> usize {
        let id = self.shapes.len();
        let bounds = shape.aabb(self.bkg_scale);
        self.shapes.push(shape);
        self.boxes.push(bounds);
        let item_bounds = self.boxes[id];
        self.root.insert(id, &item_bounds, &self.boxes, 0);
        id
    }

    /// Number of stored shapes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Whether the tree is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// All pairs of shapes whose regions overlap: the background shell of
    /// one (scale `bkg_end`) intersects the peak zone of the other (scale
    /// `peak_end`), in either direction.
    #[must_use]
    pub fn collisions(&self, peak_end: f64, bkg_end: f64) -> Vec<(usize, usize)> {
        let mut candidates = BTreeSet::new();
        self.root.collect_pairs(&self.boxes, &mut candidates);

        candidates
            .into_iter()
            .filter(|&(a, b)| {
                let sa = &self.shapes[a];
                let sb = &self.shapes[b];
                sa.scaled(bkg_end).intersects(&sb.scaled(peak_end))
                    || sa.scaled(peak_end).intersects(&sb.scaled(bkg_end))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> (Vector3<f64>, Vector3<f64>) {
        (Vector3::new(0.0, 0.0, 0.0), Vector3::new(100.0, 100.0, 100.0))
    }

    #[test]
    fn finds_the_overlapping_pair() {
        let (lo, hi) = world();
        let mut tree = Octree::new(lo, hi, 3.0);
        // a grid of well-separated unit spheres plus one deliberate clash
        for i in 0..4 {
            for j in 0..4 {
                tree.insert(Ellipsoid::sphere(
                    Vector3::new(10.0 + 20.0 * f64::from(i), 10.0 + 20.0 * f64::from(j), 50.0),
                    1.0,
                ));
            }
        }
        let clashing = tree.insert(Ellipsoid::sphere(Vector3::new(11.5, 10.0, 50.0), 1.0));

        let collisions = tree.collisions(1.0, 3.0);
        assert_eq!(collisions.len(), 1);
        let (a, b) = collisions[0];
        assert_eq!(b, clashing);
        assert_eq!(a, 0);
    }

    #[test]
    fn no_false_positives_when_separated() {
        let (lo, hi) = world();
        let mut tree = Octree::new(lo, hi, 2.0);
        for i in 0..8 {
            tree.insert(Ellipsoid::sphere(
                Vector3::new(6.0 + 12.0 * f64::from(i), 50.0, 50.0),
                1.0,
            ));
        }
        assert!(tree.collisions(1.0, 2.0).is_empty());
    }

    #[test]
    fn splitting_does_not_lose_items() {
        let (lo, hi) = world();
        let mut tree = Octree::new(lo, hi, 2.0);
        // enough items to force several levels of subdivision
        for i in 0..64 {
            let x = 2.0 + 1.5 * f64::from(i);
            tree.insert(Ellipsoid::sphere(Vector3::new(x % 95.0, (x * 0.37) % 95.0, 50.0), 0.5));
        }
        assert_eq!(tree.len(), 64);
        // every adjacent pair along the line collides at large scale
        let collisions = tree.collisions(2.0, 2.0);
        assert!(!collisions.is_empty());
    }
}
