use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Axis aligned bounding box in world coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Aabb { min, max }
    }

    /// An inverted box that any point will extend.
    pub fn empty() -> Self {
        Aabb {
            min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    pub fn extend(&mut self, position: &Point3<f64>) {
        self.min.x = self.min.x.min(position.x);
        self.min.y = self.min.y.min(position.y);
        self.min.z = self.min.z.min(position.z);
        self.max.x = self.max.x.max(position.x);
        self.max.y = self.max.y.max(position.y);
        self.max.z = self.max.z.max(position.z);
    }

    pub fn extend_aabb(&mut self, other: &Aabb) {
        self.extend(&other.min);
        self.extend(&other.max);
    }

    #[inline]
    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }

    #[inline]
    pub fn center(&self) -> Point3<f64> {
        self.min + self.size() * 0.5
    }

    pub fn contains(&self, position: &Point3<f64>) -> bool {
        position.x >= self.min.x
            && position.y >= self.min.y
            && position.z >= self.min.z
            && position.x <= self.max.x
            && position.y <= self.max.y
            && position.z <= self.max.z
    }

    /// Grows the box into a cube whose side length is the longest axis,
    /// anchored at `min`.
    pub fn cube(&self) -> Aabb {
        let size = self.size();
        let side = size.x.max(size.y).max(size.z);
        Aabb {
            min: self.min,
            max: self.min + Vector3::new(side, side, side),
        }
    }

    /// Returns the octant of this box selected by the child index.
    /// Index bits are `0bxyz`: the high bit selects the upper x half,
    /// the low bit the upper z half.
    pub fn child(&self, index: usize) -> Aabb {
        debug_assert!(index < 8);
        let center = self.center();
        let mut child = *self;

        if (index & 0b100) == 0 {
            child.max.x = center.x;
        } else {
            child.min.x = center.x;
        }

        if (index & 0b010) == 0 {
            child.max.y = center.y;
        } else {
            child.min.y = center.y;
        }

        if (index & 0b001) == 0 {
            child.max.z = center.z;
        } else {
            child.min.z = center.z;
        }

        child
    }
}
