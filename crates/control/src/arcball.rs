//! Quaternion arcball controller with inertia, damping, and smooth zoom.
//!
//! Pointer positions are projected onto a virtual trackball; the per-frame
//! rotation delta is composed into a single orientation quaternion. After
//! release, the last delta decays toward identity (glide-to-stop). Arrow
//! keys compose a constant per-frame rotation as an accessibility path.
//!
//! Time is injected (`update(dt)`, move events carry a timestamp) so the
//! controller is deterministic and unit-testable. Platform event listeners
//! live in the embedder, which must remove them when it tears down.

use std::collections::VecDeque;

use foundation::math::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Maximum samples kept for release-velocity estimation.
const VELOCITY_HISTORY_SIZE: usize = 5;

/// Reference frame length for inertia normalization (seconds).
const REFERENCE_FRAME_S: f64 = 1.0 / 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArcballConfig {
    /// Scale applied to the arcball drag angle.
    pub rotate_speed: f64,
    /// Exponential decay rate for inertia after release (per second).
    pub damping: f64,
    /// Rotation rate while an arrow key is held (rad/s).
    pub keyboard_speed: f64,
    /// Exponential smoothing rate for the reported angular velocity.
    pub velocity_smoothing: f64,
    /// Angular velocity below which inertia stops (rad/s).
    pub rest_threshold: f64,
    /// Camera distance limits and smoothing for wheel zoom.
    pub min_distance: f64,
    pub max_distance: f64,
    pub initial_distance: f64,
    pub zoom_smoothing: f64,
}

impl Default for ArcballConfig {
    fn default() -> Self {
        Self {
            rotate_speed: 1.0,
            damping: 4.0,
            keyboard_speed: 1.2,
            velocity_smoothing: 12.0,
            rest_threshold: 0.001,
            min_distance: 2.0,
            max_distance: 8.0,
            initial_distance: 3.5,
            zoom_smoothing: 8.0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrowKey {
    Left,
    Right,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
struct VelocitySample {
    delta: Quat,
    dt: f64,
}

#[derive(Debug, Clone)]
pub struct ArcballControl {
    config: ArcballConfig,

    orientation: Quat,
    viewport: Vec2,

    pointer_down: bool,
    last_unit: Option<Vec3>,
    last_move_time_s: f64,
    velocity_history: VecDeque<VelocitySample>,

    /// Per-reference-frame rotation delta decaying toward identity.
    inertia: Quat,
    inertia_active: bool,

    keys: [bool; 4],

    /// Orientation at the start of the previous `update`, for velocity.
    prev_orientation: Quat,
    rotation_axis: Vec3,
    rotation_velocity: f64,

    distance: f64,
    target_distance: f64,
}

impl ArcballControl {
    pub fn new(config: ArcballConfig) -> Self {
        Self {
            config,
            orientation: Quat::IDENTITY,
            viewport: Vec2::new(1280.0, 720.0),
            pointer_down: false,
            last_unit: None,
            last_move_time_s: 0.0,
            velocity_history: VecDeque::with_capacity(VELOCITY_HISTORY_SIZE),
            inertia: Quat::IDENTITY,
            inertia_active: false,
            keys: [false; 4],
            prev_orientation: Quat::IDENTITY,
            rotation_axis: Vec3::ZERO,
            rotation_velocity: 0.0,
            distance: config.initial_distance,
            target_distance: config.initial_distance,
        }
    }

    pub fn config(&self) -> &ArcballConfig {
        &self.config
    }

    pub fn set_viewport(&mut self, width: f64, height: f64) {
        self.viewport = Vec2::new(width.max(1.0), height.max(1.0));
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    /// Current rotation axis (unit), `Vec3::ZERO` while at rest.
    pub fn rotation_axis(&self) -> Vec3 {
        self.rotation_axis
    }

    /// Smoothed angular velocity in rad/s.
    pub fn rotation_velocity(&self) -> f64 {
        self.rotation_velocity
    }

    pub fn is_pointer_down(&self) -> bool {
        self.pointer_down
    }

    /// Wheel-smoothed camera distance to the sphere center.
    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn on_pointer_down(&mut self, pos_px: Vec2, time_s: f64) {
        // New interaction stops any glide in progress.
        self.inertia_active = false;
        self.inertia = Quat::IDENTITY;
        self.velocity_history.clear();

        self.pointer_down = true;
        self.last_move_time_s = time_s;
        self.last_unit = Some(self.project_to_sphere(pos_px));
    }

    pub fn on_pointer_move(&mut self, pos_px: Vec2, time_s: f64) {
        if !self.pointer_down {
            return;
        }

        let dt = (time_s - self.last_move_time_s).max(1e-6);
        self.last_move_time_s = time_s;

        let next_unit = self.project_to_sphere(pos_px);
        if let Some(prev_unit) = self.last_unit {
            let delta = drag_rotation(prev_unit, next_unit, self.config.rotate_speed);
            self.orientation = (delta * self.orientation).normalize();

            self.velocity_history.push_back(VelocitySample { delta, dt });
            if self.velocity_history.len() > VELOCITY_HISTORY_SIZE {
                self.velocity_history.pop_front();
            }
        }
        self.last_unit = Some(next_unit);
    }

    pub fn on_pointer_up(&mut self) {
        if !self.pointer_down {
            return;
        }

        self.inertia = self.estimate_release_delta();
        self.inertia_active = self.inertia.angle() / REFERENCE_FRAME_S > self.config.rest_threshold;

        self.pointer_down = false;
        self.last_unit = None;
        self.velocity_history.clear();
    }

    /// Wheel delta: positive zooms out, negative zooms in (exponential).
    pub fn on_wheel(&mut self, delta: f64) {
        let factor = (delta * 0.002).exp();
        self.target_distance = (self.target_distance * factor)
            .clamp(self.config.min_distance, self.config.max_distance);
    }

    pub fn on_key_down(&mut self, key: ArrowKey) {
        self.keys[key_index(key)] = true;
    }

    pub fn on_key_up(&mut self, key: ArrowKey) {
        self.keys[key_index(key)] = false;
    }

    /// Advances the controller by `dt_s`. Call exactly once per frame.
    pub fn update(&mut self, dt_s: f64) {
        let dt = dt_s.clamp(0.0, 0.1); // Cap to avoid large jumps.

        self.apply_keyboard(dt);
        self.apply_inertia(dt);
        // Velocity is measured against the end of the previous update so
        // pointer-move rotations applied between frames are included.
        self.update_velocity(dt);
        self.prev_orientation = self.orientation;

        // Smooth wheel zoom.
        let alpha = 1.0 - (-self.config.zoom_smoothing * dt).exp();
        self.distance += (self.target_distance - self.distance) * alpha;
        self.distance = self
            .distance
            .clamp(self.config.min_distance, self.config.max_distance);
    }

    pub fn reset(&mut self) {
        let viewport = self.viewport;
        *self = Self::new(self.config);
        self.viewport = viewport;
    }

    /// Projects a pointer position onto the virtual trackball.
    ///
    /// Inside the unit circle the point maps to the hemisphere
    /// `z = sqrt(1 - r²)`; outside it maps to the hyperbolic sheet
    /// `z = 1 / (2·|p|)`, so drags past the canvas edge stay well-defined.
    /// The result is always a unit vector.
    pub fn project_to_sphere(&self, pos_px: Vec2) -> Vec3 {
        let min_dim = self.viewport.x.min(self.viewport.y).max(1.0);
        let nx = (2.0 * pos_px.x - self.viewport.x) / min_dim;
        let ny = (self.viewport.y - 2.0 * pos_px.y) / min_dim;

        let r2 = nx * nx + ny * ny;
        let z = if r2 <= 1.0 {
            (1.0 - r2).sqrt()
        } else {
            1.0 / (2.0 * r2.sqrt())
        };
        Vec3::new(nx, ny, z).normalize_or_zero()
    }

    fn apply_keyboard(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let step = self.config.keyboard_speed * dt;
        let mut composed = false;
        for (key, axis) in [
            (ArrowKey::Left, Vec3::new(0.0, 1.0, 0.0)),
            (ArrowKey::Right, Vec3::new(0.0, -1.0, 0.0)),
            (ArrowKey::Up, Vec3::new(1.0, 0.0, 0.0)),
            (ArrowKey::Down, Vec3::new(-1.0, 0.0, 0.0)),
        ] {
            if self.keys[key_index(key)] {
                let delta = Quat::from_axis_angle(axis, step);
                self.orientation = delta * self.orientation;
                composed = true;
            }
        }
        if composed {
            self.orientation = self.orientation.normalize();
        }
    }

    fn apply_inertia(&mut self, dt: f64) {
        if !self.inertia_active || self.pointer_down || dt <= 0.0 {
            return;
        }

        // Scale the per-reference-frame delta to this frame's dt.
        let step = Quat::IDENTITY.slerp(self.inertia, dt / REFERENCE_FRAME_S);
        self.orientation = (step * self.orientation).normalize();

        let decay = (-self.config.damping * dt).exp();
        self.inertia = Quat::IDENTITY.slerp(self.inertia, decay);

        if self.inertia.angle() / REFERENCE_FRAME_S < self.config.rest_threshold {
            self.inertia_active = false;
            self.inertia = Quat::IDENTITY;
        }
    }

    fn update_velocity(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }

        let delta = (self.orientation * self.prev_orientation.conjugate()).normalize();
        let mut angle = delta.angle();
        // angle() reports in [0, 2π]; fold onto the short arc.
        if angle > std::f64::consts::PI {
            angle = std::f64::consts::TAU - angle;
        }
        let instantaneous = angle / dt;

        let alpha = 1.0 - (-self.config.velocity_smoothing * dt).exp();
        self.rotation_velocity += (instantaneous - self.rotation_velocity) * alpha;

        if angle > 1e-9 {
            self.rotation_axis = delta.axis();
        } else if self.rotation_velocity < self.config.rest_threshold {
            self.rotation_axis = Vec3::ZERO;
        }
    }

    /// Averages the recent drag samples into one per-reference-frame delta.
    fn estimate_release_delta(&self) -> Quat {
        let mut acc = Quat::IDENTITY;
        let mut n = 0u32;
        for sample in &self.velocity_history {
            if sample.dt <= 1e-6 {
                continue;
            }
            // Renormalize the sample to a per-reference-frame rotation,
            // capping the extrapolation of very short samples.
            let t = (REFERENCE_FRAME_S / sample.dt).min(4.0);
            acc = Quat::IDENTITY.slerp(sample.delta, t) * acc;
            n += 1;
        }
        if n == 0 {
            return Quat::IDENTITY;
        }
        Quat::IDENTITY.slerp(acc, 1.0 / f64::from(n))
    }
}

fn key_index(key: ArrowKey) -> usize {
    match key {
        ArrowKey::Left => 0,
        ArrowKey::Right => 1,
        ArrowKey::Up => 2,
        ArrowKey::Down => 3,
    }
}

/// Rotation between two trackball points, with the drag angle scaled by
/// `rotate_speed`.
fn drag_rotation(prev: Vec3, next: Vec3, rotate_speed: f64) -> Quat {
    let base = Quat::from_unit_vectors(prev, next);
    if (rotate_speed - 1.0).abs() < 1e-12 {
        return base;
    }
    let axis = base.axis();
    if axis == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    Quat::from_axis_angle(axis, base.angle() * rotate_speed)
}
