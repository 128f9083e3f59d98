use foundation::math::Vec3;

use crate::mesh::{MeshData, compute_normals};

/// Disc billboard geometry: a fan of `segments` triangles around a center
/// vertex, with UVs mapping the unit disc into [0,1]². One disc is drawn
/// per instance to carry the item's atlas cell.
#[derive(Debug, Clone)]
pub struct DiscGeometry {
    pub mesh: MeshData,
    pub radius: f64,
}

impl DiscGeometry {
    pub fn new(segments: u32, radius: f64) -> Self {
        let segments = segments.max(3);
        let mut mesh = MeshData::default();

        mesh.push_vertex(Vec3::ZERO);
        mesh.uvs.extend_from_slice(&[0.5, 0.5]);

        for i in 0..segments {
            let theta = std::f64::consts::TAU * f64::from(i) / f64::from(segments);
            let (sin_t, cos_t) = theta.sin_cos();
            mesh.push_vertex(Vec3::new(cos_t * radius, sin_t * radius, 0.0));
            mesh.uvs
                .extend_from_slice(&[(0.5 + 0.5 * cos_t) as f32, (0.5 + 0.5 * sin_t) as f32]);
        }

        for i in 0..segments {
            let current = i + 1;
            let next = (i + 1) % segments + 1;
            mesh.indices.extend_from_slice(&[0, current, next]);
        }

        compute_normals(&mut mesh);
        Self { mesh, radius }
    }
}

#[cfg(test)]
mod tests {
    use super::DiscGeometry;
    use foundation::math::Vec3;

    #[test]
    fn fan_counts() {
        let disc = DiscGeometry::new(16, 0.5);
        assert_eq!(disc.mesh.vertex_count(), 17);
        assert_eq!(disc.mesh.triangle_count(), 16);
        assert_eq!(disc.mesh.uvs.len(), 17 * 2);
    }

    #[test]
    fn uvs_cover_the_unit_square() {
        let disc = DiscGeometry::new(8, 1.0);
        // Ring vertex 0 sits at (radius, 0) → uv (1.0, 0.5).
        assert!((disc.mesh.uvs[2] - 1.0).abs() < 1e-6);
        assert!((disc.mesh.uvs[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn winding_gives_a_forward_normal() {
        let disc = DiscGeometry::new(12, 1.0);
        let n = disc.mesh.normal(0);
        assert!((n - Vec3::new(0.0, 0.0, 1.0)).length() < 1e-6);
    }

    #[test]
    fn segment_count_is_clamped_to_a_valid_fan() {
        let disc = DiscGeometry::new(2, 1.0);
        assert_eq!(disc.mesh.triangle_count(), 3);
    }
}
