use super::{Quat, Vec3};

/// Column-major 4×4 matrix: `cols[col][row]`, matching GPU upload layout.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Mat4 {
    pub cols: [[f64; 4]; 4],
}

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4 {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    pub fn from_cols(cols: [[f64; 4]; 4]) -> Self {
        Self { cols }
    }

    /// Rotation matrix from a unit quaternion.
    pub fn from_quat(q: Quat) -> Self {
        let (x, y, z, w) = (q.x, q.y, q.z, q.w);
        let (x2, y2, z2) = (x + x, y + y, z + z);
        let (xx, yy, zz) = (x * x2, y * y2, z * z2);
        let (xy, xz, yz) = (x * y2, x * z2, y * z2);
        let (wx, wy, wz) = (w * x2, w * y2, w * z2);

        Self::from_cols([
            [1.0 - (yy + zz), xy + wz, xz - wy, 0.0],
            [xy - wz, 1.0 - (xx + zz), yz + wx, 0.0],
            [xz + wy, yz - wx, 1.0 - (xx + yy), 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    pub fn look_at_rh(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        let f = (target - eye).normalize_or_zero();
        let s = f.cross(up).normalize_or_zero();
        let u = s.cross(f);

        Self::from_cols([
            [s.x, u.x, -f.x, 0.0],
            [s.y, u.y, -f.y, 0.0],
            [s.z, u.z, -f.z, 0.0],
            [-s.dot(eye), -u.dot(eye), f.dot(eye), 1.0],
        ])
    }

    /// Right-handed perspective with a `[0, 1]` clip-space depth range.
    pub fn perspective_rh_z0(fov_y_rad: f64, aspect: f64, near: f64, far: f64) -> Self {
        let f = 1.0 / (0.5 * fov_y_rad).tan();
        Self::from_cols([
            [f / aspect, 0.0, 0.0, 0.0],
            [0.0, f, 0.0, 0.0],
            [0.0, 0.0, far / (near - far), -1.0],
            [0.0, 0.0, (near * far) / (near - far), 0.0],
        ])
    }

    /// Matrix row `i` as `[m_i0, m_i1, m_i2, m_i3]` (used for plane extraction).
    pub fn row(&self, i: usize) -> [f64; 4] {
        [self.cols[0][i], self.cols[1][i], self.cols[2][i], self.cols[3][i]]
    }

    /// Transform a point (w = 1), applying the perspective divide.
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        let m = &self.cols;
        let x = m[0][0] * p.x + m[1][0] * p.y + m[2][0] * p.z + m[3][0];
        let y = m[0][1] * p.x + m[1][1] * p.y + m[2][1] * p.z + m[3][1];
        let z = m[0][2] * p.x + m[1][2] * p.y + m[2][2] * p.z + m[3][2];
        let w = m[0][3] * p.x + m[1][3] * p.y + m[2][3] * p.z + m[3][3];
        if w.abs() > 1e-12 && (w - 1.0).abs() > 1e-12 {
            Vec3::new(x / w, y / w, z / w)
        } else {
            Vec3::new(x, y, z)
        }
    }

    /// Transform a direction (w = 0).
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        let m = &self.cols;
        Vec3::new(
            m[0][0] * v.x + m[1][0] * v.y + m[2][0] * v.z,
            m[0][1] * v.x + m[1][1] * v.y + m[2][1] * v.z,
            m[0][2] * v.x + m[1][2] * v.y + m[2][2] * v.z,
        )
    }

    /// `f32` columns for GPU upload.
    pub fn to_f32_cols(&self) -> [[f32; 4]; 4] {
        let mut out = [[0.0f32; 4]; 4];
        for (c, col) in self.cols.iter().enumerate() {
            for (r, v) in col.iter().enumerate() {
                out[c][r] = *v as f32;
            }
        }
        out
    }
}

impl std::ops::Mul for Mat4 {
    type Output = Self;

    fn mul(self, b: Self) -> Self::Output {
        let a = &self.cols;
        let b = &b.cols;
        let mut c = [[0.0f64; 4]; 4];
        for col in 0..4 {
            for row in 0..4 {
                c[col][row] = a[0][row] * b[col][0]
                    + a[1][row] * b[col][1]
                    + a[2][row] * b[col][2]
                    + a[3][row] * b[col][3];
            }
        }
        Self::from_cols(c)
    }
}

#[cfg(test)]
mod tests {
    use super::{Mat4, Quat, Vec3};

    #[test]
    fn identity_multiplication() {
        let q = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 0.4);
        let m = Mat4::from_quat(q);
        let i = Mat4::IDENTITY * m;
        for c in 0..4 {
            for r in 0..4 {
                assert!((i.cols[c][r] - m.cols[c][r]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn rotation_matrix_matches_quaternion_rotation() {
        let q = Quat::from_axis_angle(Vec3::new(0.2, 1.0, -0.5), 1.1);
        let m = Mat4::from_quat(q);
        let v = Vec3::new(0.3, -2.0, 1.5);
        let via_quat = q.rotate(v);
        let via_mat = m.transform_vector(v);
        assert!((via_quat - via_mat).length() < 1e-10);
    }

    #[test]
    fn look_at_sends_target_in_front_of_camera() {
        let view = Mat4::look_at_rh(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::new(0.0, 1.0, 0.0),
        );
        let p = view.transform_point(Vec3::ZERO);
        // Camera looks down -Z in view space.
        assert!(p.z < 0.0);
        assert!(p.x.abs() < 1e-12 && p.y.abs() < 1e-12);
    }

    #[test]
    fn perspective_maps_near_plane_to_zero_depth() {
        let proj = Mat4::perspective_rh_z0(1.0, 1.5, 0.1, 100.0);
        let on_near = proj.transform_point(Vec3::new(0.0, 0.0, -0.1));
        assert!(on_near.z.abs() < 1e-9);
        let on_far = proj.transform_point(Vec3::new(0.0, 0.0, -100.0));
        assert!((on_far.z - 1.0).abs() < 1e-9);
    }
}
