use foundation::math::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub fov_y_rad: f64,
    pub near: f64,
    pub far: f64,
    /// Distance multiplier applied while the pointer is down (< 1 pulls the
    /// camera closer for a tactile grab).
    pub drag_distance_factor: f64,
    /// Exponential ease rate toward the drag target (per second).
    pub drag_smoothing: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_rad: 50f64.to_radians(),
            near: 0.1,
            far: 100.0,
            drag_distance_factor: 0.85,
            drag_smoothing: 6.0,
        }
    }
}

/// Camera fixed on the sphere center.
///
/// Only the distance animates: the wheel-controlled base distance comes
/// from the controller, and a drag blend eases the camera closer while the
/// user is rotating.
#[derive(Debug, Clone)]
pub struct SphereCamera {
    config: CameraConfig,
    aspect: f64,
    base_distance: f64,
    drag_blend: f64,
    dragging: bool,
}

impl SphereCamera {
    pub fn new(config: CameraConfig, base_distance: f64) -> Self {
        Self {
            config,
            aspect: 16.0 / 9.0,
            base_distance,
            drag_blend: 0.0,
            dragging: false,
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn resize(&mut self, width: f64, height: f64) {
        self.aspect = (width.max(1.0)) / (height.max(1.0));
    }

    pub fn set_base_distance(&mut self, distance: f64) {
        self.base_distance = distance.max(self.config.near * 2.0);
    }

    pub fn set_dragging(&mut self, dragging: bool) {
        self.dragging = dragging;
    }

    pub fn update(&mut self, dt_s: f64) {
        let target = if self.dragging { 1.0 } else { 0.0 };
        let alpha = 1.0 - (-self.config.drag_smoothing * dt_s.max(0.0)).exp();
        self.drag_blend += (target - self.drag_blend) * alpha;
    }

    pub fn distance(&self) -> f64 {
        let factor = 1.0 + (self.config.drag_distance_factor - 1.0) * self.drag_blend;
        self.base_distance * factor
    }

    /// Camera position on the +Z axis; the sphere rotates, not the camera.
    pub fn eye(&self) -> Vec3 {
        Vec3::new(0.0, 0.0, self.distance())
    }

    /// Unit vector from the eye toward the sphere center.
    pub fn forward(&self) -> Vec3 {
        Vec3::new(0.0, 0.0, -1.0)
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye(), Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0))
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh_z0(self.config.fov_y_rad, self.aspect, self.config.near, self.config.far)
    }

    pub fn view_proj(&self) -> Mat4 {
        self.projection() * self.view()
    }

    /// Closed-form inverse of the perspective matrix (clip → view space).
    pub fn inverse_projection(&self) -> Mat4 {
        let p = self.projection();
        let m00 = p.cols[0][0];
        let m11 = p.cols[1][1];
        let m22 = p.cols[2][2];
        let m23 = p.cols[3][2];
        Mat4::from_cols([
            [1.0 / m00, 0.0, 0.0, 0.0],
            [0.0, 1.0 / m11, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0 / m23],
            [0.0, 0.0, -1.0, m22 / m23],
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::{CameraConfig, SphereCamera};
    use foundation::math::{Mat4, Vec3};

    #[test]
    fn drag_eases_the_camera_closer_and_back() {
        let mut cam = SphereCamera::new(CameraConfig::default(), 4.0);
        assert!((cam.distance() - 4.0).abs() < 1e-12);

        cam.set_dragging(true);
        for _ in 0..600 {
            cam.update(0.016);
        }
        assert!((cam.distance() - 4.0 * 0.85).abs() < 1e-3);

        cam.set_dragging(false);
        for _ in 0..600 {
            cam.update(0.016);
        }
        assert!((cam.distance() - 4.0).abs() < 1e-3);
    }

    #[test]
    fn view_places_the_sphere_center_in_front() {
        let cam = SphereCamera::new(CameraConfig::default(), 4.0);
        let center_view = cam.view().transform_point(Vec3::ZERO);
        assert!(center_view.z < 0.0);
        assert!(center_view.x.abs() < 1e-12 && center_view.y.abs() < 1e-12);
    }

    #[test]
    fn inverse_projection_inverts_the_projection() {
        let mut cam = SphereCamera::new(CameraConfig::default(), 4.0);
        cam.resize(1024.0, 768.0);
        let identity = cam.projection() * cam.inverse_projection();
        for c in 0..4 {
            for r in 0..4 {
                let expected = Mat4::IDENTITY.cols[c][r];
                assert!(
                    (identity.cols[c][r] - expected).abs() < 1e-9,
                    "mismatch at col {c} row {r}: {}",
                    identity.cols[c][r]
                );
            }
        }
    }
}
