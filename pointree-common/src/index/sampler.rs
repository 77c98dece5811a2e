use crate::attributes::Attributes;
use crate::index::node::Node;
use nalgebra::Point3;
use rand::seq::SliceRandom;
use std::cell::RefCell;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplingMethod {
    Poisson,
    Random,
}

/// Bottom-up subsampling of a built octree.
///
/// For every inner node the sampler lifts a representative subset of the
/// children's points into the node; the children keep only the rejected
/// points. `on_complete` is invoked for every child whose payload is
/// final (its buffer can be written out), `on_discard` for leaf children
/// whose points were hoisted entirely.
///
/// Subtrees already flagged `sampled` act as leaves: their payload takes
/// part in the parent's sampling, but they are not descended into. This
/// is how the final top-of-tree pass runs over chunk roots that were
/// sampled per chunk.
pub trait Sampler: Send + Sync {
    fn sample(
        &self,
        node: &mut Node,
        attributes: &Attributes,
        base_spacing: f64,
        on_complete: &mut dyn FnMut(&mut Node),
        on_discard: &mut dyn FnMut(&Node),
    );
}

#[derive(Copy, Clone)]
struct SamplerPoint {
    x: f64,
    y: f64,
    z: f64,
    center_distance: f64,
    point_index: u32,
    child_index: u8,
}

/// Collects all child payload points with their distance to the node
/// center, in child order. The sort below is stable, so ties keep
/// child-then-record order.
fn gather_child_points(node: &Node, attributes: &Attributes) -> Vec<SamplerPoint> {
    let bytes_per_point = attributes.bytes_per_point;
    let center = node.bounds.center();
    let total: u64 = node
        .children
        .iter()
        .flatten()
        .map(|child| child.num_points)
        .sum();
    let mut points = Vec::with_capacity(total as usize);

    for (child_index, child) in node.children.iter().enumerate() {
        let Some(child) = child else { continue };
        let Some(buffer) = &child.points else { continue };
        for i in 0..child.num_points as usize {
            let record = &buffer[i * bytes_per_point..(i + 1) * bytes_per_point];
            let world = attributes.decode_position(record);
            let center_distance = (world - center).norm();
            points.push(SamplerPoint {
                x: world.x,
                y: world.y,
                z: world.z,
                center_distance,
                point_index: i as u32,
                child_index: child_index as u8,
            });
        }
    }

    points
}

/// Splits every child's buffer into the parent's accepted payload and
/// the child's remaining rejects, then finalizes the children.
fn apply_accepted_flags(
    node: &mut Node,
    flags: &[Vec<bool>; 8],
    num_accepted: usize,
    attributes: &Attributes,
    on_complete: &mut dyn FnMut(&mut Node),
    on_discard: &mut dyn FnMut(&Node),
) {
    let bytes_per_point = attributes.bytes_per_point;
    let mut accepted = Vec::with_capacity(num_accepted * bytes_per_point);

    for index in 0..8 {
        let Some(mut child) = node.children[index].take() else {
            continue;
        };
        let buffer = child.points.take().unwrap_or_default();
        let child_flags = &flags[index];
        let mut rejected =
            Vec::with_capacity(buffer.len() - child_flags.iter().filter(|&&f| f).count() * bytes_per_point);

        for (i, record) in buffer.chunks_exact(bytes_per_point).enumerate() {
            if child_flags[i] {
                accepted.extend_from_slice(record);
            } else {
                rejected.extend_from_slice(record);
            }
        }

        let num_rejected = (rejected.len() / bytes_per_point) as u64;
        if num_rejected == 0 && child.is_leaf() {
            // fully hoisted leaves disappear
            on_discard(&child);
            continue;
        }
        if num_rejected > 0 {
            child.points = Some(rejected);
            child.num_points = num_rejected;
        } else {
            // inner node that lost all its points: keep it as an empty
            // structural node so the hierarchy stays connected
            child.points = None;
            child.num_points = 0;
        }
        on_complete(&mut child);
        node.children[index] = Some(child);
    }

    node.num_points = (accepted.len() / bytes_per_point) as u64;
    node.points = Some(accepted);
}

/// Poisson-disk sampler: keeps a subset whose pairwise distance stays
/// above the level spacing, preferring points close to the node center.
pub struct PoissonSampler;

impl PoissonSampler {
    /// At most this many already accepted points are checked per
    /// candidate before giving up and accepting it.
    const MAX_CHECKS: usize = 10_000;

    fn accept(candidate: &SamplerPoint, spacing: f64, accepted: &[SamplerPoint]) -> bool {
        let limit = candidate.center_distance - spacing;
        let spacing_squared = spacing * spacing;
        let mut checks = 0;

        // accepted is ordered by distance to the center. Any accepted
        // point closer to the center than (candidate distance - spacing)
        // cannot conflict, and neither can anything before it.
        for other in accepted.iter().rev() {
            if limit > 0.0 && other.center_distance < limit {
                return true;
            }
            let dx = other.x - candidate.x;
            let dy = other.y - candidate.y;
            let dz = other.z - candidate.z;
            if dx * dx + dy * dy + dz * dz < spacing_squared {
                return false;
            }
            checks += 1;
            if checks > Self::MAX_CHECKS {
                return true;
            }
        }

        true
    }

    fn sample_node(
        &self,
        node: &mut Node,
        attributes: &Attributes,
        base_spacing: f64,
        on_complete: &mut dyn FnMut(&mut Node),
        on_discard: &mut dyn FnMut(&Node),
    ) {
        if node.sampled {
            return;
        }
        node.sampled = true;

        if node.is_leaf() {
            return;
        }
        for child in node.children.iter_mut().flatten() {
            self.sample_node(child, attributes, base_spacing, on_complete, on_discard);
        }

        let spacing = base_spacing / 2.0_f64.powi(node.level() as i32);
        let mut points = gather_child_points(node, attributes);
        points.sort_by(|a, b| a.center_distance.partial_cmp(&b.center_distance).unwrap());

        let mut flags: [Vec<bool>; 8] = Default::default();
        for (index, child) in node.children.iter().enumerate() {
            if let Some(child) = child {
                flags[index] = vec![false; child.num_points as usize];
            }
        }

        let mut accepted: Vec<SamplerPoint> = Vec::new();
        for point in &points {
            if Self::accept(point, spacing, &accepted) {
                flags[point.child_index as usize][point.point_index as usize] = true;
                accepted.push(*point);
            }
        }

        apply_accepted_flags(
            node,
            &flags,
            accepted.len(),
            attributes,
            on_complete,
            on_discard,
        );
    }
}

impl Sampler for PoissonSampler {
    fn sample(
        &self,
        node: &mut Node,
        attributes: &Attributes,
        base_spacing: f64,
        on_complete: &mut dyn FnMut(&mut Node),
        on_discard: &mut dyn FnMut(&Node),
    ) {
        self.sample_node(node, attributes, base_spacing, on_complete, on_discard);
    }
}

/// Random grid sampler: keeps the first point per 128³ grid cell that
/// lands close enough to the cell center, one sweep per node.
pub struct RandomSampler;

const RANDOM_GRID_SIZE: usize = 128;

thread_local! {
    /// Reused occupancy grid plus the current sweep counter. A cell is
    /// free in this sweep while its marker is older than the counter.
    static OCCUPANCY: RefCell<(Vec<i64>, i64)> = const { RefCell::new((Vec::new(), 0)) };
}

/// Cell of a position in a grid over the node bounds, and the normalized
/// distance of the position to its cell center.
fn occupancy_cell(
    world: &Point3<f64>,
    min: &Point3<f64>,
    size: &nalgebra::Vector3<f64>,
    grid_size: usize,
) -> (usize, f64) {
    let g = grid_size as f64;
    let nx = (world.x - min.x) / size.x;
    let ny = (world.y - min.y) / size.y;
    let nz = (world.z - min.z) / size.z;

    let lx = 2.0 * (g * nx).fract() - 1.0;
    let ly = 2.0 * (g * ny).fract() - 1.0;
    let lz = 2.0 * (g * nz).fract() - 1.0;
    let distance = (lx * lx + ly * ly + lz * lz).sqrt();

    let limit = grid_size as i64 - 1;
    let x = ((g * nx) as i64).clamp(0, limit) as usize;
    let y = ((g * ny) as i64).clamp(0, limit) as usize;
    let z = ((g * nz) as i64).clamp(0, limit) as usize;

    (x + y * grid_size + z * grid_size * grid_size, distance)
}

impl RandomSampler {
    fn sample_node(
        &self,
        node: &mut Node,
        attributes: &Attributes,
        base_spacing: f64,
        on_complete: &mut dyn FnMut(&mut Node),
        on_discard: &mut dyn FnMut(&Node),
    ) {
        if node.sampled {
            return;
        }
        node.sampled = true;

        let bytes_per_point = attributes.bytes_per_point;
        if node.is_leaf() {
            // shuffle leaf payloads so that partial reads are unbiased
            if let Some(buffer) = &mut node.points {
                let mut order: Vec<usize> = (0..node.num_points as usize).collect();
                order.shuffle(&mut rand::thread_rng());
                let mut shuffled = vec![0u8; buffer.len()];
                for (target, &source) in order.iter().enumerate() {
                    shuffled[target * bytes_per_point..(target + 1) * bytes_per_point]
                        .copy_from_slice(
                            &buffer[source * bytes_per_point..(source + 1) * bytes_per_point],
                        );
                }
                *buffer = shuffled;
            }
            return;
        }

        for child in node.children.iter_mut().flatten() {
            self.sample_node(child, attributes, base_spacing, on_complete, on_discard);
        }

        let min = node.bounds.min;
        let size = node.bounds.size();
        let center_limit = 0.7 * 3.0_f64.sqrt();

        let mut flags: [Vec<bool>; 8] = Default::default();
        let mut num_accepted = 0;

        OCCUPANCY.with(|occupancy| {
            let (grid, sweep) = &mut *occupancy.borrow_mut();
            if grid.is_empty() {
                grid.resize(RANDOM_GRID_SIZE * RANDOM_GRID_SIZE * RANDOM_GRID_SIZE, -1);
            }
            *sweep += 1;

            for (child_index, child) in node.children.iter().enumerate() {
                let Some(child) = child else { continue };
                let Some(buffer) = &child.points else {
                    continue;
                };
                let mut child_flags = vec![false; child.num_points as usize];

                for (i, record) in buffer.chunks_exact(attributes.bytes_per_point).enumerate() {
                    let world = attributes.decode_position(record);
                    let (cell, distance) =
                        occupancy_cell(&world, &min, &size, RANDOM_GRID_SIZE);

                    let accepted = child.num_points < 100
                        || (distance < center_limit && grid[cell] < *sweep);
                    if accepted {
                        grid[cell] = *sweep;
                        child_flags[i] = true;
                        num_accepted += 1;
                    }
                }
                flags[child_index] = child_flags;
            }
        });

        apply_accepted_flags(
            node,
            &flags,
            num_accepted,
            attributes,
            on_complete,
            on_discard,
        );
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &self,
        node: &mut Node,
        attributes: &Attributes,
        base_spacing: f64,
        on_complete: &mut dyn FnMut(&mut Node),
        on_discard: &mut dyn FnMut(&Node),
    ) {
        self.sample_node(node, attributes, base_spacing, on_complete, on_discard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Attribute, AttributeType, Attributes};
    use crate::geometry::bounding_box::Aabb;
    use nalgebra::Vector3;

    fn position_only_attributes() -> Attributes {
        let mut attributes = Attributes::new(vec![Attribute::new(
            "position",
            AttributeType::Int32,
            3,
        )]);
        attributes.pos_scale = Vector3::new(0.001, 0.001, 0.001);
        attributes.pos_offset = Vector3::new(0.0, 0.0, 0.0);
        attributes
    }

    fn encode(attributes: &Attributes, points: &[(f64, f64, f64)]) -> Vec<u8> {
        let mut buffer = Vec::new();
        for &(x, y, z) in points {
            let xi = (x / attributes.pos_scale.x).round() as i32;
            let yi = (y / attributes.pos_scale.y).round() as i32;
            let zi = (z / attributes.pos_scale.z).round() as i32;
            buffer.extend_from_slice(&xi.to_le_bytes());
            buffer.extend_from_slice(&yi.to_le_bytes());
            buffer.extend_from_slice(&zi.to_le_bytes());
        }
        buffer
    }

    fn leaf_child(parent: &mut Node, index: usize, attributes: &Attributes, pts: &[(f64, f64, f64)]) {
        let child = parent.expand_to(&[index as u8]);
        child.points = Some(encode(attributes, pts));
        child.num_points = pts.len() as u64;
    }

    #[test]
    fn poisson_accepted_points_keep_spacing() {
        let attributes = position_only_attributes();
        let mut root = Node::new(
            "r".to_string(),
            Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)),
        );

        // a dense line of points along x in two children
        let low: Vec<(f64, f64, f64)> = (0..50).map(|i| (i as f64 * 0.01, 0.2, 0.2)).collect();
        let high: Vec<(f64, f64, f64)> = (0..50).map(|i| (0.5 + i as f64 * 0.01, 0.2, 0.2)).collect();
        leaf_child(&mut root, 0, &attributes, &low);
        leaf_child(&mut root, 4, &attributes, &high);

        let mut completed = Vec::new();
        PoissonSampler.sample(
            &mut root,
            &attributes,
            0.1,
            &mut |node| completed.push(node.name.clone()),
            &mut |_| {},
        );

        let accepted = root.points.as_ref().unwrap();
        let positions: Vec<Point3<f64>> = accepted
            .chunks_exact(attributes.bytes_per_point)
            .map(|record| attributes.decode_position(record))
            .collect();
        assert!(!positions.is_empty());
        for (i, a) in positions.iter().enumerate() {
            for b in positions.iter().skip(i + 1) {
                assert!((a - b).norm() >= 0.1 - 1e-9, "{a:?} and {b:?} too close");
            }
        }

        // every surviving point is accounted for
        let rejected: u64 = root
            .children
            .iter()
            .flatten()
            .map(|child| child.num_points)
            .sum();
        assert_eq!(root.num_points + rejected, 100);
        assert!(!completed.is_empty());
    }

    #[test]
    fn poisson_discards_fully_hoisted_leaves() {
        let attributes = position_only_attributes();
        let mut root = Node::new(
            "r".to_string(),
            Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)),
        );
        leaf_child(&mut root, 0, &attributes, &[(0.1, 0.1, 0.1)]);
        leaf_child(&mut root, 7, &attributes, &[(0.9, 0.9, 0.9)]);

        let mut discarded = 0;
        PoissonSampler.sample(
            &mut root,
            &attributes,
            0.01,
            &mut |_| {},
            &mut |_| discarded += 1,
        );

        // spacing is small, both points lift into the root
        assert_eq!(root.num_points, 2);
        assert_eq!(discarded, 2);
        assert!(root.is_leaf());
    }

    #[test]
    fn sampled_subtrees_are_not_descended() {
        let attributes = position_only_attributes();
        let mut root = Node::new(
            "r".to_string(),
            Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)),
        );
        // child that was already sampled in an earlier pass; its own
        // children have no payload anymore
        {
            let child = root.expand_to(&[0]);
            child.sampled = true;
            child.points = Some(encode(&attributes, &[(0.1, 0.1, 0.1)]));
            child.num_points = 1;
            let grandchild = child.expand_to(&[0]);
            grandchild.sampled = true;
        }
        leaf_child(&mut root, 7, &attributes, &[(0.9, 0.9, 0.9)]);

        PoissonSampler.sample(&mut root, &attributes, 0.001, &mut |_| {}, &mut |_| {});
        // both points hoisted; the sampled child stays because it is not
        // a leaf
        assert_eq!(root.num_points, 2);
        assert!(root.children[0].is_some());
        assert!(root.children[7].is_none());
    }

    #[test]
    fn occupancy_cell_distance() {
        let min = Point3::new(0.0, 0.0, 0.0);
        let size = Vector3::new(1.0, 1.0, 1.0);
        // dead center of a cell
        let (_, d) = occupancy_cell(
            &Point3::new(0.5 / 128.0, 0.5 / 128.0, 0.5 / 128.0),
            &min,
            &size,
            128,
        );
        assert!(d < 1e-9);
        // cell corner is sqrt(3) away in normalized units
        let (_, d) = occupancy_cell(&Point3::new(0.0, 0.0, 0.0), &min, &size, 128);
        assert!((d - 3.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn random_sampler_keeps_total_count() {
        let attributes = position_only_attributes();
        let mut root = Node::new(
            "r".to_string(),
            Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)),
        );
        let pts: Vec<(f64, f64, f64)> = (0..200)
            .map(|i| (0.001 * i as f64, 0.3, 0.4))
            .collect();
        leaf_child(&mut root, 0, &attributes, &pts);

        RandomSampler.sample(&mut root, &attributes, 0.1, &mut |_| {}, &mut |_| {});
        let rejected: u64 = root
            .children
            .iter()
            .flatten()
            .map(|child| child.num_points)
            .sum();
        assert_eq!(root.num_points + rejected, 200);
        assert!(root.num_points > 0);
    }
}
