use memdex_error::{MemdexError, Result};
use memdex_query::CondType;
use memdex_types::{RowId, Variant, VariantArray};

use crate::comparator::dwithin_args;
use crate::idset::{AddMode, IdSet};
use crate::selectkey::{SelectKeyResult, SelectKeyResults};
use crate::SelectOpts;

const MAX_ENTRIES: usize = 16;
const MIN_ENTRIES: usize = 6;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// An axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    #[must_use]
    pub const fn from_point(p: Point) -> Self {
        Self {
            min_x: p.x,
            min_y: p.y,
            max_x: p.x,
            max_y: p.y,
        }
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    #[must_use]
    pub fn contains_rect(self, other: Self) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    #[must_use]
    pub fn area(self) -> f64 {
        (self.max_x - self.min_x) * (self.max_y - self.min_y)
    }

    #[must_use]
    pub fn enlargement(self, other: Self) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Minimum distance from a point to this rectangle; zero when inside.
    #[must_use]
    pub fn min_dist(self, p: Point) -> f64 {
        let dx = (self.min_x - p.x).max(0.0).max(p.x - self.max_x);
        let dy = (self.min_y - p.y).max(0.0).max(p.y - self.max_y);
        dx.hypot(dy)
    }
}

/// Node split strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Splitter {
    Linear,
    #[default]
    Quadratic,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct LeafEntry {
    point: Point,
    id: RowId,
}

#[derive(Debug, Clone)]
struct ChildEntry {
    rect: Rect,
    node: Box<RNode>,
}

#[derive(Debug, Clone)]
enum RNode {
    Leaf(Vec<LeafEntry>),
    Internal(Vec<ChildEntry>),
}

impl RNode {
    fn rect(&self) -> Option<Rect> {
        match self {
            Self::Leaf(entries) => entries
                .iter()
                .map(|e| Rect::from_point(e.point))
                .reduce(Rect::union),
            Self::Internal(children) => children.iter().map(|c| c.rect).reduce(Rect::union),
        }
    }
}

// ---------------------------------------------------------------------------
// RTreeIndex
// ---------------------------------------------------------------------------

/// Height-balanced 2-D spatial index over point fields.
///
/// Supports the `DWITHIN(point, distance)` predicate. All leaves sit at the
/// same depth; splits propagate to the root.
#[derive(Debug, Clone)]
pub struct RTreeIndex {
    root: Box<RNode>,
    splitter: Splitter,
    len: usize,
}

impl RTreeIndex {
    #[must_use]
    pub fn new(splitter: Splitter) -> Self {
        Self {
            root: Box::new(RNode::Leaf(Vec::new())),
            splitter,
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, point: Point, id: RowId) {
        self.insert_entry(LeafEntry { point, id });
        self.len += 1;
    }

    fn insert_entry(&mut self, entry: LeafEntry) {
        if let Some((rect, sibling)) = insert_rec(&mut self.root, entry, self.splitter) {
            let old = std::mem::replace(&mut self.root, Box::new(RNode::Leaf(Vec::new())));
            let old_rect = old.rect().unwrap_or(rect);
            self.root = Box::new(RNode::Internal(vec![
                ChildEntry {
                    rect: old_rect,
                    node: old,
                },
                ChildEntry {
                    rect,
                    node: sibling,
                },
            ]));
        }
    }

    /// Remove one `(point, id)` entry. Underflowing nodes dissolve and
    /// their points reinsert, keeping the tree balanced.
    pub fn delete(&mut self, point: Point, id: RowId) -> bool {
        let mut orphans = Vec::new();
        let removed = delete_rec(&mut self.root, point, id, &mut orphans);
        if removed {
            self.len -= 1;
        }
        // Collapse a root with a single internal child.
        loop {
            let replace = match self.root.as_mut() {
                RNode::Internal(children) if children.len() == 1 => {
                    Some(children.pop().expect("one child").node)
                }
                _ => None,
            };
            match replace {
                Some(child) => self.root = child,
                None => break,
            }
        }
        for orphan in orphans {
            self.insert_entry(orphan);
        }
        removed
    }

    /// Collect every id within `dist` of `(x, y)`.
    pub fn dwithin(&self, center: Point, dist: f64, out: &mut Vec<RowId>) {
        dwithin_rec(&self.root, center, dist, out);
    }

    /// Structural invariants: every parent rectangle contains the union of
    /// its children, all leaves are at the same depth, and non-root nodes
    /// hold between the minimum and maximum entry counts.
    pub fn verify(&self) -> Result<()> {
        let mut leaf_depth = None;
        verify_rec(&self.root, 0, true, &mut leaf_depth)
    }

    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        _opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        match condition {
            CondType::DWithin => {
                let (x, y, dist) = dwithin_args(values)?;
                let mut ids = Vec::new();
                self.dwithin(Point::new(x, y), dist, &mut ids);
                ids.sort_unstable();
                Ok(vec![SelectKeyResult::from_idset(IdSet::from_ids(
                    ids,
                    AddMode::Unordered,
                ))])
            }
            other => Err(MemdexError::query_exec(format!(
                "rtree index does not support condition {}",
                other.as_str()
            ))),
        }
    }

    /// Extract the point from an rtree field's payload values.
    pub fn point_from_values(values: &VariantArray) -> Result<Point> {
        if values.len() != 2 {
            return Err(MemdexError::params(
                "rtree field expects a 2-element point array",
            ));
        }
        match (values[0].as_double(), values[1].as_double()) {
            (Some(x), Some(y)) => Ok(Point::new(x, y)),
            _ => Err(MemdexError::params("rtree point must be numeric")),
        }
    }

    pub fn upsert(&mut self, values: &VariantArray, id: RowId) -> Result<()> {
        let point = Self::point_from_values(values)?;
        self.insert(point, id);
        Ok(())
    }

    pub fn delete_values(&mut self, values: &VariantArray, id: RowId) -> Result<()> {
        let point = Self::point_from_values(values)?;
        self.delete(point, id);
        Ok(())
    }

    #[must_use]
    pub fn splitter(&self) -> Splitter {
        self.splitter
    }
}

// ---------------------------------------------------------------------------
// Insert machinery
// ---------------------------------------------------------------------------

fn insert_rec(node: &mut RNode, entry: LeafEntry, splitter: Splitter) -> Option<(Rect, Box<RNode>)> {
    match node {
        RNode::Leaf(entries) => {
            entries.push(entry);
            if entries.len() <= MAX_ENTRIES {
                return None;
            }
            let items = std::mem::take(entries);
            let (a, b) = split(items, |e| Rect::from_point(e.point), splitter);
            let rect_b = rect_of(&b, |e| Rect::from_point(e.point));
            *node = RNode::Leaf(a);
            Some((rect_b, Box::new(RNode::Leaf(b))))
        }
        RNode::Internal(children) => {
            let target = choose_subtree(children, entry.point);
            let split_result = insert_rec(&mut children[target].node, entry, splitter);
            if let Some(rect) = children[target].node.rect() {
                children[target].rect = rect;
            }
            if let Some((rect, sibling)) = split_result {
                children.push(ChildEntry {
                    rect,
                    node: sibling,
                });
                if children.len() > MAX_ENTRIES {
                    let items = std::mem::take(children);
                    let (a, b) = split(items, |c| c.rect, splitter);
                    let rect_b = rect_of(&b, |c| c.rect);
                    *node = RNode::Internal(a);
                    return Some((rect_b, Box::new(RNode::Internal(b))));
                }
            }
            None
        }
    }
}

fn choose_subtree(children: &[ChildEntry], point: Point) -> usize {
    let target = Rect::from_point(point);
    let mut best = 0;
    let mut best_enlargement = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (i, child) in children.iter().enumerate() {
        let enlargement = child.rect.enlargement(target);
        let area = child.rect.area();
        if enlargement < best_enlargement
            || (enlargement == best_enlargement && area < best_area)
        {
            best = i;
            best_enlargement = enlargement;
            best_area = area;
        }
    }
    best
}

fn rect_of<T>(items: &[T], rect: impl Fn(&T) -> Rect) -> Rect {
    items
        .iter()
        .map(&rect)
        .reduce(Rect::union)
        .expect("split groups are never empty")
}

fn split<T>(items: Vec<T>, rect: impl Fn(&T) -> Rect, splitter: Splitter) -> (Vec<T>, Vec<T>) {
    match splitter {
        Splitter::Linear => split_linear(items, rect),
        Splitter::Quadratic => split_quadratic(items, rect),
    }
}

/// Guttman's linear split: seeds with the greatest normalized separation,
/// remaining entries assigned by least enlargement.
fn split_linear<T>(mut items: Vec<T>, rect: impl Fn(&T) -> Rect) -> (Vec<T>, Vec<T>) {
    let rects: Vec<Rect> = items.iter().map(&rect).collect();
    let total = rects.iter().copied().reduce(Rect::union).expect("non-empty");

    let (mut lowest_high_x, mut highest_low_x) = (0usize, 0usize);
    let (mut lowest_high_y, mut highest_low_y) = (0usize, 0usize);
    for (i, r) in rects.iter().enumerate() {
        if r.max_x < rects[lowest_high_x].max_x {
            lowest_high_x = i;
        }
        if r.min_x > rects[highest_low_x].min_x {
            highest_low_x = i;
        }
        if r.max_y < rects[lowest_high_y].max_y {
            lowest_high_y = i;
        }
        if r.min_y > rects[highest_low_y].min_y {
            highest_low_y = i;
        }
    }
    let width_x = (total.max_x - total.min_x).max(f64::EPSILON);
    let width_y = (total.max_y - total.min_y).max(f64::EPSILON);
    let sep_x = (rects[highest_low_x].min_x - rects[lowest_high_x].max_x) / width_x;
    let sep_y = (rects[highest_low_y].min_y - rects[lowest_high_y].max_y) / width_y;

    let (mut seed_a, mut seed_b) = if sep_x > sep_y {
        (lowest_high_x, highest_low_x)
    } else {
        (lowest_high_y, highest_low_y)
    };
    if seed_a == seed_b {
        seed_b = if seed_a == 0 { 1 } else { 0 };
    }
    if seed_a > seed_b {
        std::mem::swap(&mut seed_a, &mut seed_b);
    }

    // Remove seeds back-to-front so indices stay valid.
    let item_b = items.remove(seed_b);
    let item_a = items.remove(seed_a);
    distribute(items, item_a, item_b, rect)
}

/// Guttman's quadratic split: seeds maximize dead area, remaining entries
/// assigned by strongest preference.
fn split_quadratic<T>(mut items: Vec<T>, rect: impl Fn(&T) -> Rect) -> (Vec<T>, Vec<T>) {
    let rects: Vec<Rect> = items.iter().map(&rect).collect();
    let (mut seed_a, mut seed_b) = (0usize, 1usize);
    let mut worst = f64::NEG_INFINITY;
    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            let dead = rects[i].union(rects[j]).area() - rects[i].area() - rects[j].area();
            if dead > worst {
                worst = dead;
                seed_a = i;
                seed_b = j;
            }
        }
    }
    let item_b = items.remove(seed_b);
    let item_a = items.remove(seed_a);
    distribute(items, item_a, item_b, rect)
}

fn distribute<T>(
    items: Vec<T>,
    seed_a: T,
    seed_b: T,
    rect: impl Fn(&T) -> Rect,
) -> (Vec<T>, Vec<T>) {
    let mut rect_a = rect(&seed_a);
    let mut rect_b = rect(&seed_b);
    let mut group_a = vec![seed_a];
    let mut group_b = vec![seed_b];
    let mut remaining = items;

    while let Some(item) = remaining.pop() {
        let left = remaining.len();
        // Force-assign when one group needs every remaining entry to reach
        // the minimum fill.
        if group_a.len() + left + 1 <= MIN_ENTRIES {
            rect_a = rect_a.union(rect(&item));
            group_a.push(item);
            continue;
        }
        if group_b.len() + left + 1 <= MIN_ENTRIES {
            rect_b = rect_b.union(rect(&item));
            group_b.push(item);
            continue;
        }
        let r = rect(&item);
        let enlarge_a = rect_a.enlargement(r);
        let enlarge_b = rect_b.enlargement(r);
        let to_a = match enlarge_a.partial_cmp(&enlarge_b) {
            Some(std::cmp::Ordering::Less) => true,
            Some(std::cmp::Ordering::Greater) => false,
            _ => group_a.len() <= group_b.len(),
        };
        if to_a {
            rect_a = rect_a.union(r);
            group_a.push(item);
        } else {
            rect_b = rect_b.union(r);
            group_b.push(item);
        }
    }
    (group_a, group_b)
}

// ---------------------------------------------------------------------------
// Delete machinery
// ---------------------------------------------------------------------------

fn delete_rec(
    node: &mut RNode,
    point: Point,
    id: RowId,
    orphans: &mut Vec<LeafEntry>,
) -> bool {
    match node {
        RNode::Leaf(entries) => {
            let before = entries.len();
            entries.retain(|e| !(e.id == id && e.point == point));
            entries.len() < before
        }
        RNode::Internal(children) => {
            let target = Rect::from_point(point);
            let mut removed = false;
            let mut i = 0;
            while i < children.len() {
                if !removed && children[i].rect.contains_rect(target) {
                    if delete_rec(&mut children[i].node, point, id, orphans) {
                        removed = true;
                        let underflow = match children[i].node.as_ref() {
                            RNode::Leaf(entries) => entries.len() < MIN_ENTRIES,
                            RNode::Internal(sub) => sub.len() < MIN_ENTRIES,
                        };
                        if underflow {
                            let child = children.remove(i);
                            collect_points(&child.node, orphans);
                            continue;
                        }
                        if let Some(rect) = children[i].node.rect() {
                            children[i].rect = rect;
                        }
                    }
                }
                i += 1;
            }
            removed
        }
    }
}

fn collect_points(node: &RNode, out: &mut Vec<LeafEntry>) {
    match node {
        RNode::Leaf(entries) => out.extend(entries.iter().copied()),
        RNode::Internal(children) => {
            for child in children {
                collect_points(&child.node, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Search and verification
// ---------------------------------------------------------------------------

fn dwithin_rec(node: &RNode, center: Point, dist: f64, out: &mut Vec<RowId>) {
    match node {
        RNode::Leaf(entries) => {
            for e in entries {
                if e.point.distance(center) <= dist {
                    out.push(e.id);
                }
            }
        }
        RNode::Internal(children) => {
            for child in children {
                if child.rect.min_dist(center) <= dist {
                    dwithin_rec(&child.node, center, dist, out);
                }
            }
        }
    }
}

fn verify_rec(
    node: &RNode,
    depth: usize,
    is_root: bool,
    leaf_depth: &mut Option<usize>,
) -> Result<()> {
    match node {
        RNode::Leaf(entries) => {
            if !is_root && (entries.len() < MIN_ENTRIES || entries.len() > MAX_ENTRIES) {
                return Err(MemdexError::logic(format!(
                    "rtree leaf entry count {} out of bounds",
                    entries.len()
                )));
            }
            match leaf_depth {
                Some(d) if *d != depth => Err(MemdexError::logic(format!(
                    "rtree leaves at differing depths {d} and {depth}"
                ))),
                Some(_) => Ok(()),
                None => {
                    *leaf_depth = Some(depth);
                    Ok(())
                }
            }
        }
        RNode::Internal(children) => {
            if children.is_empty() || (!is_root && children.len() < MIN_ENTRIES) {
                return Err(MemdexError::logic("rtree internal node underfilled"));
            }
            for child in children {
                let actual = child
                    .node
                    .rect()
                    .ok_or_else(|| MemdexError::logic("rtree empty child node"))?;
                if !child.rect.contains_rect(actual) {
                    return Err(MemdexError::logic(
                        "rtree parent rect does not contain child union",
                    ));
                }
                verify_rec(&child.node, depth + 1, false, leaf_depth)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn grid_tree(splitter: Splitter, side: u32) -> RTreeIndex {
        let mut tree = RTreeIndex::new(splitter);
        for i in 0..side * side {
            let p = Point::new(f64::from(i % side), f64::from(i / side));
            tree.insert(p, i);
        }
        tree
    }

    #[test]
    fn test_insert_and_verify_both_splitters() {
        for splitter in [Splitter::Linear, Splitter::Quadratic] {
            let tree = grid_tree(splitter, 40);
            assert_eq!(tree.len(), 1600);
            tree.verify().unwrap();
        }
    }

    #[test]
    fn test_dwithin_matches_linear_scan() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut tree = RTreeIndex::new(Splitter::Quadratic);
        let mut points = Vec::new();
        for id in 0..5000u32 {
            let p = Point::new(rng.gen_range(0.0..1000.0), rng.gen_range(0.0..1000.0));
            points.push(p);
            tree.insert(p, id);
        }
        tree.verify().unwrap();
        for _ in 0..50 {
            let center = Point::new(rng.gen_range(0.0..1000.0), rng.gen_range(0.0..1000.0));
            let dist = rng.gen_range(1.0..200.0);
            let mut found = Vec::new();
            tree.dwithin(center, dist, &mut found);
            found.sort_unstable();
            let expected: Vec<RowId> = points
                .iter()
                .enumerate()
                .filter(|(_, p)| p.distance(center) <= dist)
                .map(|(i, _)| i as RowId)
                .collect();
            assert_eq!(found, expected);
        }
    }

    #[test]
    fn test_delete_keeps_invariants() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut tree = RTreeIndex::new(Splitter::Linear);
        let mut points = Vec::new();
        for id in 0..800u32 {
            let p = Point::new(rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0));
            points.push((p, id));
            tree.insert(p, id);
        }
        for (p, id) in points.drain(..400) {
            assert!(tree.delete(p, id));
            tree.verify().unwrap();
        }
        assert_eq!(tree.len(), 400);
        // Remaining points are still findable.
        for (p, id) in &points {
            let mut found = Vec::new();
            tree.dwithin(*p, 0.0, &mut found);
            assert!(found.contains(id));
        }
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let mut tree = RTreeIndex::new(Splitter::Quadratic);
        tree.insert(Point::new(1.0, 1.0), 1);
        assert!(!tree.delete(Point::new(2.0, 2.0), 1));
        assert!(!tree.delete(Point::new(1.0, 1.0), 2));
        assert!(tree.delete(Point::new(1.0, 1.0), 1));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_rect_min_dist() {
        let r = Rect {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 10.0,
            max_y: 10.0,
        };
        assert_eq!(r.min_dist(Point::new(5.0, 5.0)), 0.0);
        assert_eq!(r.min_dist(Point::new(13.0, 14.0)), 5.0);
        assert_eq!(r.min_dist(Point::new(-3.0, 5.0)), 3.0);
    }

    #[test]
    fn test_select_key_dwithin() {
        use smallvec::smallvec;
        let mut tree = RTreeIndex::new(Splitter::Quadratic);
        tree.upsert(&smallvec![Variant::Double(1.0), Variant::Double(1.0)], 1)
            .unwrap();
        tree.upsert(&smallvec![Variant::Double(50.0), Variant::Double(50.0)], 2)
            .unwrap();
        let res = tree
            .select_key(
                &smallvec![
                    Variant::Tuple(vec![Variant::Double(0.0), Variant::Double(0.0)]),
                    Variant::Double(5.0)
                ],
                CondType::DWithin,
                &SelectOpts::default(),
            )
            .unwrap();
        let ids: Vec<RowId> = res[0].idsets[0].iter().collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_unsupported_condition_is_query_exec() {
        let tree = RTreeIndex::new(Splitter::Linear);
        let err = tree
            .select_key(&Default::default(), CondType::Eq, &SelectOpts::default())
            .unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::QueryExec);
    }
}
