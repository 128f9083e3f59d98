use std::collections::BTreeMap;

use foundation::math::Vec3;

use crate::mesh::MeshData;

/// Unit icosahedron: 12 vertices, 20 triangular faces.
///
/// Vertices lie on three orthogonal golden-ratio rectangles; they are not
/// yet on the unit sphere (`spherize` does that after subdivision).
pub fn icosahedron() -> MeshData {
    let t = (1.0 + 5.0f64.sqrt()) / 2.0;

    let mut mesh = MeshData::default();
    let verts = [
        Vec3::new(-1.0, t, 0.0),
        Vec3::new(1.0, t, 0.0),
        Vec3::new(-1.0, -t, 0.0),
        Vec3::new(1.0, -t, 0.0),
        Vec3::new(0.0, -1.0, t),
        Vec3::new(0.0, 1.0, t),
        Vec3::new(0.0, -1.0, -t),
        Vec3::new(0.0, 1.0, -t),
        Vec3::new(t, 0.0, -1.0),
        Vec3::new(t, 0.0, 1.0),
        Vec3::new(-t, 0.0, -1.0),
        Vec3::new(-t, 0.0, 1.0),
    ];
    for v in verts {
        mesh.push_vertex(v);
    }

    mesh.indices = vec![
        0, 11, 5, 0, 5, 1, 0, 1, 7, 0, 7, 10, 0, 10, 11, //
        1, 5, 9, 5, 11, 4, 11, 10, 2, 10, 7, 6, 7, 1, 8, //
        3, 9, 4, 3, 4, 2, 3, 2, 6, 3, 6, 8, 3, 8, 9, //
        4, 9, 5, 2, 4, 11, 6, 2, 10, 8, 6, 7, 9, 8, 1,
    ];

    mesh
}

/// Splits every triangle into 4, `levels` times.
///
/// Midpoints are cached by the unordered vertex-index pair, so a midpoint
/// shared by two faces is created exactly once and the mesh stays
/// continuous (no duplicate vertices along shared edges).
pub fn subdivide(mesh: &MeshData, levels: u32) -> MeshData {
    let mut out = mesh.clone();

    for _ in 0..levels {
        let mut cache: BTreeMap<(u32, u32), u32> = BTreeMap::new();
        let mut next = MeshData {
            positions: out.positions.clone(),
            normals: Vec::new(),
            uvs: Vec::new(),
            indices: Vec::with_capacity(out.indices.len() * 4),
        };

        let indices = out.indices.clone();
        for tri in indices.chunks_exact(3) {
            let (a, b, c) = (tri[0], tri[1], tri[2]);
            let ab = midpoint(&mut next, &mut cache, a, b);
            let bc = midpoint(&mut next, &mut cache, b, c);
            let ca = midpoint(&mut next, &mut cache, c, a);

            next.indices.extend_from_slice(&[a, ab, ca]);
            next.indices.extend_from_slice(&[b, bc, ab]);
            next.indices.extend_from_slice(&[c, ca, bc]);
            next.indices.extend_from_slice(&[ab, bc, ca]);
        }

        out = next;
    }

    out
}

fn midpoint(mesh: &mut MeshData, cache: &mut BTreeMap<(u32, u32), u32>, a: u32, b: u32) -> u32 {
    let key = (a.min(b), a.max(b));
    if let Some(&existing) = cache.get(&key) {
        return existing;
    }
    let mid = (mesh.position(a as usize) + mesh.position(b as usize)) * 0.5;
    let index = mesh.push_vertex(mid);
    cache.insert(key, index);
    index
}

/// Projects every vertex onto the sphere of `radius` and sets its normal to
/// the normalized position (exact for a sphere).
pub fn spherize(mesh: &mut MeshData, radius: f64) {
    for i in 0..mesh.vertex_count() {
        let dir = mesh.position(i).normalize_or_zero();
        mesh.set_position(i, dir * radius);
        mesh.set_normal(i, dir);
    }
}

/// Builds the instance-anchor sphere: icosahedron, subdivided `levels`
/// times, spherized to `radius`. Level 1 yields the 42 anchors used by the
/// item sphere.
pub fn build_anchor_sphere(levels: u32, radius: f64) -> MeshData {
    let mut mesh = subdivide(&icosahedron(), levels);
    spherize(&mut mesh, radius);
    mesh
}

/// Closed-form vertex count after `levels` subdivisions: `10·4^L + 2`.
pub fn subdivided_vertex_count(levels: u32) -> usize {
    10 * 4usize.pow(levels) + 2
}

#[cfg(test)]
mod tests {
    use super::{
        build_anchor_sphere, icosahedron, midpoint, spherize, subdivide, subdivided_vertex_count,
    };
    use std::collections::BTreeMap;

    #[test]
    fn icosahedron_has_twelve_vertices_twenty_faces() {
        let mesh = icosahedron();
        assert_eq!(mesh.vertex_count(), 12);
        assert_eq!(mesh.triangle_count(), 20);
    }

    #[test]
    fn subdivision_matches_closed_form_counts() {
        for levels in 0..3 {
            let mesh = subdivide(&icosahedron(), levels);
            assert_eq!(mesh.vertex_count(), subdivided_vertex_count(levels));
            assert_eq!(mesh.triangle_count(), 20 * 4usize.pow(levels));
        }
    }

    #[test]
    fn midpoint_cache_is_symmetric_in_its_arguments() {
        let mut mesh = icosahedron();
        let mut cache = BTreeMap::new();
        let ab = midpoint(&mut mesh, &mut cache, 0, 11);
        let ba = midpoint(&mut mesh, &mut cache, 11, 0);
        assert_eq!(ab, ba);
        // One midpoint added, not two.
        assert_eq!(mesh.vertex_count(), 13);
    }

    #[test]
    fn shared_edges_produce_no_duplicate_vertices() {
        // Every edge of the icosahedron is shared by two faces; if the
        // cache failed, the count would exceed the closed form.
        let mesh = subdivide(&icosahedron(), 1);
        assert_eq!(mesh.vertex_count(), 42);
    }

    #[test]
    fn spherized_vertices_sit_on_the_sphere_with_radial_normals() {
        let mut mesh = subdivide(&icosahedron(), 1);
        spherize(&mut mesh, 2.5);
        for i in 0..mesh.vertex_count() {
            let p = mesh.position(i);
            assert!((p.length() - 2.5).abs() < 1e-5);
            let n = mesh.normal(i);
            assert!((n - p.normalize_or_zero()).length() < 1e-5);
        }
    }

    #[test]
    fn anchor_sphere_level_one_has_42_anchors() {
        let mesh = build_anchor_sphere(1, 1.0);
        assert_eq!(mesh.vertex_count(), 42);
    }
}
