use foundation::math::Vec3;

/// Mesh data as flat numeric arrays, ready for vertex/index buffer upload.
///
/// `positions`/`normals` are xyz triples, `uvs` are uv pairs (may be empty
/// for meshes that are never textured, like the instance-anchor icosphere).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<f32>,
    pub normals: Vec<f32>,
    pub uvs: Vec<f32>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn position(&self, i: usize) -> Vec3 {
        Vec3::new(
            f64::from(self.positions[i * 3]),
            f64::from(self.positions[i * 3 + 1]),
            f64::from(self.positions[i * 3 + 2]),
        )
    }

    pub fn set_position(&mut self, i: usize, p: Vec3) {
        self.positions[i * 3] = p.x as f32;
        self.positions[i * 3 + 1] = p.y as f32;
        self.positions[i * 3 + 2] = p.z as f32;
    }

    pub fn normal(&self, i: usize) -> Vec3 {
        Vec3::new(
            f64::from(self.normals[i * 3]),
            f64::from(self.normals[i * 3 + 1]),
            f64::from(self.normals[i * 3 + 2]),
        )
    }

    pub fn set_normal(&mut self, i: usize, n: Vec3) {
        if self.normals.len() < self.positions.len() {
            self.normals.resize(self.positions.len(), 0.0);
        }
        self.normals[i * 3] = n.x as f32;
        self.normals[i * 3 + 1] = n.y as f32;
        self.normals[i * 3 + 2] = n.z as f32;
    }

    pub fn push_vertex(&mut self, p: Vec3) -> u32 {
        let index = self.vertex_count() as u32;
        self.positions.push(p.x as f32);
        self.positions.push(p.y as f32);
        self.positions.push(p.z as f32);
        index
    }
}

/// Accumulates per-face normals into adjacent vertices and renormalizes.
///
/// Correct for arbitrary meshes; spherized meshes get their normals set
/// directly from the (normalized) position instead.
pub fn compute_normals(mesh: &mut MeshData) {
    let count = mesh.vertex_count();
    let mut acc = vec![Vec3::ZERO; count];

    for tri in mesh.indices.chunks_exact(3) {
        let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let pa = mesh.position(a);
        let pb = mesh.position(b);
        let pc = mesh.position(c);
        let face = (pb - pa).cross(pc - pa);
        acc[a] = acc[a] + face;
        acc[b] = acc[b] + face;
        acc[c] = acc[c] + face;
    }

    mesh.normals.resize(count * 3, 0.0);
    for (i, n) in acc.into_iter().enumerate() {
        mesh.set_normal(i, n.normalize_or_zero());
    }
}
