use foundation::math::{Mat4, Vec3, stable_total_cmp_f64};

use crate::items::item_for_instance;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Plane {
    pub n: Vec3,
    pub d: f64,
}

impl Plane {
    pub fn new(n: Vec3, d: f64) -> Self {
        Self { n, d }
    }

    pub fn normalize(self) -> Self {
        let l2 = self.n.length_squared();
        if l2 <= 0.0 {
            return self;
        }
        let inv = 1.0 / l2.sqrt();
        Self {
            n: self.n * inv,
            d: self.d * inv,
        }
    }

    pub fn distance(&self, p: Vec3) -> f64 {
        self.n.dot(p) + self.d
    }
}

/// View frustum as 6 planes.
///
/// Convention:
/// - A point `p` is inside iff `plane.distance(p) >= 0` for all planes.
/// - Planes are in world space when built from a world-space view-projection.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frustum {
    pub left: Plane,
    pub right: Plane,
    pub bottom: Plane,
    pub top: Plane,
    pub near: Plane,
    pub far: Plane,
}

impl Frustum {
    /// Build a frustum from a view-projection matrix (Gribb/Hartmann).
    ///
    /// Expects the clip-space convention where visible points satisfy
    /// `-w <= x <= w`, `-w <= y <= w`, `0 <= z <= w`.
    pub fn from_view_proj(m: &Mat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);

        let plane = |a: [f64; 4], sign: f64, b: [f64; 4]| {
            Plane::new(
                Vec3::new(a[0] + sign * b[0], a[1] + sign * b[1], a[2] + sign * b[2]),
                a[3] + sign * b[3],
            )
        };

        Self {
            left: plane(r3, 1.0, r0).normalize(),
            right: plane(r3, -1.0, r0).normalize(),
            bottom: plane(r3, 1.0, r1).normalize(),
            top: plane(r3, -1.0, r1).normalize(),
            near: plane(r3, 1.0, r2).normalize(),
            far: plane(r3, -1.0, r2).normalize(),
        }
    }

    pub fn planes(&self) -> [Plane; 6] {
        [
            self.left, self.right, self.bottom, self.top, self.near, self.far,
        ]
    }

    /// Conservative bounding-sphere test: a sphere is excluded only when it
    /// is entirely behind some plane.
    pub fn intersects_sphere(&self, center: Vec3, radius: f64) -> bool {
        for plane in self.planes() {
            if plane.distance(center) < -radius {
                return false;
            }
        }
        true
    }
}

/// One in-frustum instance, already mapped to the item it displays.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct VisibleItem {
    pub item_index: usize,
    pub instance_index: usize,
    pub world_pos: Vec3,
}

/// Collects the items currently inside the frustum, mapped through the
/// temporal-cycling offset.
///
/// Used purely to prioritize texture loading — every instance is still
/// drawn; instanced draws make full-sphere rendering cheap. If the frustum
/// test comes back empty (degenerate matrices, mid-resize), a fallback set
/// of the first few items keeps the loader supplied with priorities.
pub fn visible_items(
    world: &Mat4,
    anchors: &[Vec3],
    margin: f64,
    frustum: &Frustum,
    item_count: usize,
    rotation_offset: usize,
) -> Vec<VisibleItem> {
    let mut out = Vec::new();
    for (instance_index, anchor) in anchors.iter().enumerate() {
        let Some(item_index) =
            item_for_instance(instance_index, anchors.len(), item_count, rotation_offset)
        else {
            continue;
        };
        let world_pos = world.transform_point(*anchor);
        if frustum.intersects_sphere(world_pos, margin) {
            out.push(VisibleItem {
                item_index,
                instance_index,
                world_pos,
            });
        }
    }

    if out.is_empty() {
        const FALLBACK_COUNT: usize = 8;
        for (instance_index, anchor) in anchors.iter().enumerate().take(FALLBACK_COUNT) {
            let Some(item_index) =
                item_for_instance(instance_index, anchors.len(), item_count, rotation_offset)
            else {
                continue;
            };
            out.push(VisibleItem {
                item_index,
                instance_index,
                world_pos: world.transform_point(*anchor),
            });
        }
    }

    out
}

/// Orders visible items nearest-first for load prioritization.
///
/// Deterministic: distance ties break on item index.
pub fn sort_nearest_first(items: &mut [VisibleItem], camera_pos: Vec3) {
    items.sort_by(|a, b| {
        let da = (a.world_pos - camera_pos).length_squared();
        let db = (b.world_pos - camera_pos).length_squared();
        stable_total_cmp_f64(da, db).then_with(|| a.item_index.cmp(&b.item_index))
    });
}

/// Convenience: visible item indices, nearest first.
pub fn visible_item_indices(
    world: &Mat4,
    anchors: &[Vec3],
    margin: f64,
    frustum: &Frustum,
    item_count: usize,
    rotation_offset: usize,
    camera_pos: Vec3,
) -> Vec<usize> {
    let mut items = visible_items(world, anchors, margin, frustum, item_count, rotation_offset);
    sort_nearest_first(&mut items, camera_pos);
    items.into_iter().map(|v| v.item_index).collect()
}
