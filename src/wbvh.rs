//! The worker-level BVH: built once from every worker's reported bounds,
//! shipped to all workers so they can forward rays, then dropped.

use serde::{Deserialize, Serialize};

use crate::spatial::BoundingBox;

/// Flat node array; children index into it. `worker` is nonzero on leaves
/// (worker id 0 is the reserved sentinel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WbvhNode {
    pub bounds: BoundingBox,
    pub left: u32,
    pub right: u32,
    pub worker: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBvh {
    nodes: Vec<WbvhNode>,
}

impl WorkerBvh {
    /// Median-split build over the workers' bounds. The input order does
    /// not matter; every worker ends up in exactly one leaf.
    pub fn build(bounds: &[(u32, BoundingBox)]) -> Self {
        assert!(!bounds.is_empty());
        let mut items: Vec<(u32, BoundingBox)> = bounds.to_vec();
        let mut nodes = Vec::with_capacity(bounds.len() * 2);
        build_node(&mut items, &mut nodes);
        Self { nodes }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<WbvhNode>()
    }

    pub fn nodes(&self) -> &[WbvhNode] {
        &self.nodes
    }
}

fn build_node(items: &mut [(u32, BoundingBox)], nodes: &mut Vec<WbvhNode>) -> u32 {
    let bounds = items[1..]
        .iter()
        .fold(items[0].1, |acc, (_, b)| acc.union(b));

    let index = nodes.len() as u32;
    if items.len() == 1 {
        nodes.push(WbvhNode {
            bounds,
            left: 0,
            right: 0,
            worker: items[0].0,
        });
        return index;
    }

    nodes.push(WbvhNode {
        bounds,
        left: 0,
        right: 0,
        worker: 0,
    });

    let axis = bounds.longest_axis();
    items.sort_by(|a, b| {
        a.1.centroid()[axis]
            .partial_cmp(&b.1.centroid()[axis])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mid = items.len() / 2;
    let (lo, hi) = items.split_at_mut(mid);

    let left = build_node(lo, nodes);
    let right = build_node(hi, nodes);
    nodes[index as usize].left = left;
    nodes[index as usize].right = right;
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(at: f32) -> BoundingBox {
        BoundingBox {
            min: [at, 0.0, 0.0],
            max: [at + 1.0, 1.0, 1.0],
        }
    }

    #[test]
    fn single_worker_is_one_leaf() {
        let bvh = WorkerBvh::build(&[(1, cube(0.0))]);
        assert_eq!(bvh.node_count(), 1);
        assert_eq!(bvh.nodes()[0].worker, 1);
    }

    #[test]
    fn every_worker_lands_in_exactly_one_leaf() {
        let input = [(1, cube(0.0)), (2, cube(5.0)), (3, cube(10.0)), (4, cube(2.0))];
        let bvh = WorkerBvh::build(&input);

        let mut leaves: Vec<u32> = bvh
            .nodes()
            .iter()
            .filter(|n| n.worker != 0)
            .map(|n| n.worker)
            .collect();
        leaves.sort_unstable();
        assert_eq!(leaves, vec![1, 2, 3, 4]);
        assert_eq!(bvh.node_count(), 2 * input.len() - 1);
    }

    #[test]
    fn root_bounds_cover_all_workers() {
        let bvh = WorkerBvh::build(&[(1, cube(0.0)), (2, cube(9.0))]);
        let root = &bvh.nodes()[0].bounds;
        assert_eq!(root.min[0], 0.0);
        assert_eq!(root.max[0], 10.0);
    }
}
