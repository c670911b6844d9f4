//! Level-of-detail octree over a single point arena.
//!
//! Every node owns a contiguous range of [`Octree::points`]: the points it
//! retains at its level of detail. Non-leaf nodes keep one point per grid
//! cell (cell size `grid_size / 2^depth`) and hand the rest to their octants.

use crate::cancel::CancellationToken;
use crate::error::{Result, TilerError};
use crate::geom::{Aabb, LocalPoint};
use crate::options::TilerOptions;
use crate::stream::PointStream;
use rayon::prelude::*;
use std::collections::HashSet;
use std::ops::Range;

/// Builder thresholds, taken from [`TilerOptions`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildParams {
    pub grid_size: f64,
    pub max_depth: u32,
    pub min_points_per_tile: usize,
}

impl BuildParams {
    /// Point spacing targeted at `depth`; also the node's geometric error.
    #[inline]
    pub fn spacing(&self, depth: u32) -> f64 {
        self.grid_size / f64::from(1u32 << depth.min(31))
    }

    #[inline]
    fn split_threshold(&self) -> usize {
        self.min_points_per_tile.saturating_mul(2)
    }
}

impl From<&TilerOptions> for BuildParams {
    fn from(options: &TilerOptions) -> Self {
        Self {
            grid_size: options.grid_size,
            max_depth: options.max_depth,
            min_points_per_tile: options.min_points_per_tile,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OctreeNode {
    /// Tight bounds of every point assigned to this subtree.
    pub bounds: Aabb,
    pub depth: u32,
    /// Octant digits from the root; empty for the root.
    pub path: Vec<u8>,
    /// Retained points, as a range of the owning arena.
    pub points: Range<usize>,
    pub geometric_error: f64,
    /// Non-empty octants only, in octant order.
    pub children: Vec<OctreeNode>,
}

impl OctreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn retained(&self) -> usize {
        self.points.len()
    }

    pub fn has_content(&self) -> bool {
        !self.points.is_empty()
    }

    /// Payload location relative to the output directory, e.g. `3/5/content.pnts`.
    pub fn content_uri(&self) -> String {
        let mut uri = String::with_capacity(self.path.len() * 2 + 12);
        for digit in &self.path {
            uri.push(char::from(b'0' + digit));
            uri.push('/');
        }
        uri.push_str("content.pnts");
        uri
    }

    /// Points held by this node and all of its descendants.
    pub fn subtree_points(&self) -> usize {
        self.retained() + self.children.iter().map(|c| c.subtree_points()).sum::<usize>()
    }

    /// Pre-order walk.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a OctreeNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Octree {
    /// Arena reordered so that every node's retained points are contiguous.
    pub points: Vec<LocalPoint>,
    pub root: OctreeNode,
    pub params: BuildParams,
}

impl Octree {
    /// Build the tree, consuming the job's points.
    pub fn build(
        mut points: Vec<LocalPoint>,
        params: BuildParams,
        cancel: &CancellationToken,
    ) -> Result<Octree> {
        let root = build_node(&mut points, 0, 0, Vec::new(), &params, cancel)?;
        log::debug!(
            "octree: {} points, {} nodes, depth {}",
            points.len(),
            count_nodes(&root),
            deepest(&root)
        );
        Ok(Octree {
            points,
            root,
            params,
        })
    }

    /// Stream over the points retained by `node`.
    pub fn stream(&self, node: &OctreeNode) -> PointStream<'_> {
        PointStream::new(&self.points[node.points.clone()])
    }

    /// All nodes in pre-order.
    pub fn nodes(&self) -> Vec<&OctreeNode> {
        let mut out = Vec::new();
        self.root.visit(&mut |n| out.push(n));
        out
    }

    pub fn node_count(&self) -> usize {
        count_nodes(&self.root)
    }

    pub fn depth(&self) -> u32 {
        deepest(&self.root)
    }
}

fn count_nodes(node: &OctreeNode) -> usize {
    1 + node.children.iter().map(count_nodes).sum::<usize>()
}

fn deepest(node: &OctreeNode) -> u32 {
    node.children
        .iter()
        .map(deepest)
        .max()
        .unwrap_or(node.depth)
}

/// `points` is the node's slice of the arena, starting at `offset`.
fn build_node(
    points: &mut [LocalPoint],
    offset: usize,
    depth: u32,
    path: Vec<u8>,
    params: &BuildParams,
    cancel: &CancellationToken,
) -> Result<OctreeNode> {
    cancel.check()?;

    let len = points.len();
    let bounds = Aabb::from_points(points);
    let leaf = |bounds: Aabb| OctreeNode {
        bounds,
        depth,
        path: path.clone(),
        points: offset..offset + len,
        geometric_error: params.spacing(depth),
        children: Vec::new(),
    };

    if depth >= params.max_depth || len < params.split_threshold() {
        return Ok(leaf(bounds));
    }

    if bounds.extent().max_element() <= 0.0 {
        let err = TilerError::Build {
            depth,
            reason: format!("{len} coincident points"),
        };
        log::debug!("{err}; keeping them in one leaf");
        return Ok(leaf(bounds));
    }

    let retained = retain_grid_sample(points, &bounds, params.spacing(depth));
    let rest = &mut points[retained..];

    let center = bounds.center();
    let counts = partition_octants(rest, center);

    let mut jobs = Vec::with_capacity(8);
    let mut tail = rest;
    let mut child_offset = offset + retained;
    for (octant, &count) in counts.iter().enumerate() {
        let (head, next) = tail.split_at_mut(count);
        tail = next;
        if count > 0 {
            let mut child_path = path.clone();
            child_path.push(octant as u8);
            jobs.push((head, child_offset, child_path));
        }
        child_offset += count;
    }

    let children = jobs
        .into_par_iter()
        .map(|(slice, child_offset, child_path)| {
            build_node(slice, child_offset, depth + 1, child_path, params, cancel)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(OctreeNode {
        bounds,
        depth,
        path,
        points: offset..offset + retained,
        geometric_error: params.spacing(depth),
        children,
    })
}

/// Keep the first point seen in each grid cell, moving the kept points to the
/// front of `points` with relative order preserved. Returns how many were kept.
fn retain_grid_sample(points: &mut [LocalPoint], bounds: &Aabb, cell: f64) -> usize {
    let origin = bounds.min.as_dvec3();
    let mut occupied: HashSet<[u64; 3]> = HashSet::with_capacity(points.len() / 4);

    let keep: Vec<bool> = points
        .iter()
        .map(|p| {
            let idx = ((p.position.as_dvec3() - origin) / cell).floor();
            occupied.insert([idx.x as u64, idx.y as u64, idx.z as u64])
        })
        .collect();

    let mut reordered = Vec::with_capacity(points.len());
    reordered.extend(points.iter().zip(&keep).filter(|(_, &k)| k).map(|(p, _)| *p));
    let retained = reordered.len();
    reordered.extend(points.iter().zip(&keep).filter(|(_, &k)| !k).map(|(p, _)| *p));
    points.copy_from_slice(&reordered);

    retained
}

/// Stable partition of `points` by octant around `center`. Returns the size of
/// each octant's run, in octant order.
fn partition_octants(points: &mut [LocalPoint], center: glam::Vec3) -> [usize; 8] {
    let mut buckets: [Vec<LocalPoint>; 8] = Default::default();
    for p in points.iter() {
        buckets[Aabb::octant(center, p.position)].push(*p);
    }

    let mut counts = [0usize; 8];
    let mut start = 0;
    for (octant, bucket) in buckets.iter().enumerate() {
        points[start..start + bucket.len()].copy_from_slice(bucket);
        start += bucket.len();
        counts[octant] = bucket.len();
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn lp(x: f32, y: f32, z: f32) -> LocalPoint {
        LocalPoint {
            position: Vec3::new(x, y, z),
            ..Default::default()
        }
    }

    /// Deterministic pseudo-random cloud in a `size`-metre cube.
    fn cloud(n: usize, size: f32) -> Vec<LocalPoint> {
        let mut state = 0x2545_f491_u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state as f32 / u32::MAX as f32) * size
        };
        (0..n)
            .map(|i| {
                let mut p = lp(next(), next(), next());
                p.intensity = (i % 251) as u8;
                p
            })
            .collect()
    }

    fn params(grid: f64, depth: u32, min: usize) -> BuildParams {
        BuildParams {
            grid_size: grid,
            max_depth: depth,
            min_points_per_tile: min,
        }
    }

    fn build(points: Vec<LocalPoint>, p: BuildParams) -> Octree {
        Octree::build(points, p, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn every_point_lands_in_exactly_one_node() {
        let input = cloud(20_000, 100.0);
        let tree = build(input.clone(), params(10.0, 6, 300));

        let mut ranges: Vec<Range<usize>> = tree.nodes().iter().map(|n| n.points.clone()).collect();
        ranges.sort_by_key(|r| r.start);
        let mut cursor = 0;
        for r in &ranges {
            assert_eq!(r.start, cursor);
            cursor = r.end;
        }
        assert_eq!(cursor, input.len());
        assert_eq!(tree.root.subtree_points(), input.len());

        // Same multiset of points.
        let key = |p: &LocalPoint| (p.position.x.to_bits(), p.position.y.to_bits(), p.position.z.to_bits());
        let mut a: Vec<_> = input.iter().map(key).collect();
        let mut b: Vec<_> = tree.points.iter().map(key).collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn depth_and_leaf_rules_hold() {
        let p = params(5.0, 4, 100);
        let tree = build(cloud(30_000, 200.0), p);
        assert_eq!(tree.root.depth, 0);

        for node in tree.nodes() {
            assert!(node.depth <= p.max_depth);
            assert_eq!(node.geometric_error, p.spacing(node.depth));
            let assigned = node.subtree_points();
            if node.depth == p.max_depth || assigned < 2 * p.min_points_per_tile {
                assert!(node.is_leaf(), "node {:?} should be a leaf", node.path);
                assert_eq!(node.retained(), assigned);
            }
            for child in &node.children {
                assert_eq!(child.depth, node.depth + 1);
                assert!(node.bounds.contains(&child.bounds));
                assert_eq!(&child.path[..node.path.len()], &node.path[..]);
            }
            assert!(node.children.windows(2).all(|w| w[0].path < w[1].path));
        }
        assert!(tree.depth() > 0);
    }

    #[test]
    fn interior_nodes_keep_one_point_per_cell() {
        let p = params(10.0, 3, 50);
        let tree = build(cloud(5_000, 100.0), p);
        assert!(!tree.root.is_leaf());

        let cell = p.spacing(0);
        let origin = tree.root.bounds.min.as_dvec3();
        let mut seen = HashSet::new();
        for point in tree.stream(&tree.root) {
            let idx = ((point.position.as_dvec3() - origin) / cell).floor();
            assert!(seen.insert([idx.x as i64, idx.y as i64, idx.z as i64]));
        }
        // 100 m cube at 10 m spacing has at most 11^3 occupied cells.
        assert!(tree.root.retained() <= 11 * 11 * 11);
    }

    #[test]
    fn sampling_keeps_the_first_point_of_each_cell() {
        let points = vec![lp(0.5, 0.5, 0.5), lp(0.6, 0.6, 0.6), lp(3.5, 0.5, 0.5), lp(0.7, 0.5, 0.5)];
        let mut arena = points.clone();
        let bounds = Aabb::from_points(&arena);
        let kept = retain_grid_sample(&mut arena, &bounds, 1.0);
        assert_eq!(kept, 2);
        assert_eq!(arena[..2], [points[0], points[2]]);
        assert_eq!(arena[2..], [points[1], points[3]]);
    }

    #[test]
    fn small_input_is_a_single_leaf_in_input_order() {
        let input = cloud(9_999, 50.0);
        let tree = build(input.clone(), params(20.0, 10, 5000));
        assert!(tree.root.is_leaf());
        assert_eq!(tree.root.retained(), 9_999);
        assert_eq!(tree.points, input);
    }

    #[test]
    fn ten_thousand_points_split_once_at_the_threshold() {
        let tree = build(cloud(10_000, 200.0), params(20.0, 10, 5000));
        assert!(!tree.root.is_leaf());
        assert!(tree.root.retained() > 0);
        assert!(tree.root.children.len() <= 8);
        for child in &tree.root.children {
            assert!(child.is_leaf());
            assert!(child.retained() < 10_000);
        }
        assert_eq!(tree.root.subtree_points(), 10_000);
    }

    #[test]
    fn coincident_points_become_a_leaf() {
        let input = vec![lp(1.0, 1.0, 1.0); 64];
        let tree = build(input, params(1.0, 8, 4));
        assert!(tree.root.is_leaf());
        assert_eq!(tree.root.retained(), 64);
    }

    #[test]
    fn empty_input_yields_empty_root() {
        let tree = build(Vec::new(), params(20.0, 10, 5000));
        assert!(tree.root.is_leaf());
        assert!(!tree.root.has_content());
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root.content_uri(), "content.pnts");
    }

    #[test]
    fn build_is_deterministic() {
        let p = params(4.0, 5, 64);
        let a = build(cloud(12_000, 80.0), p);
        let b = build(cloud(12_000, 80.0), p);
        assert_eq!(a.points, b.points);
        assert_eq!(a.root, b.root);
    }

    #[test]
    fn content_uri_follows_octant_path() {
        let tree = build(cloud(4_000, 100.0), params(10.0, 3, 100));
        for node in tree.nodes() {
            let digits: Vec<String> = node.path.iter().map(|d| d.to_string()).collect();
            let expected = if digits.is_empty() {
                "content.pnts".to_string()
            } else {
                format!("{}/content.pnts", digits.join("/"))
            };
            assert_eq!(node.content_uri(), expected);
        }
    }

    #[test]
    fn cancelled_build_stops() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Octree::build(cloud(100, 1.0), params(1.0, 2, 1), &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
