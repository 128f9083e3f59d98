use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use tracing::warn;

use control::arcball::{ArcballConfig, ArcballControl};
use foundation::math::{Mat4, Vec3};
use geometry::disc::DiscGeometry;
use geometry::icosphere::build_anchor_sphere;
use runtime::budget::FrameBudget;
use runtime::event_bus::EventBus;
use runtime::frame::Frame;
use runtime::metrics::Metrics;
use scene::camera::{CameraConfig, SphereCamera};
use scene::items::{CyclingOffset, SphereItem, item_for_instance};
use scene::visibility::{Frustum, visible_item_indices};
use streaming::atlas::{Atlas, AtlasConfig, AtlasError, ImagePixels};
use streaming::cache::{
    CacheBudget, CacheError, EvictionPolicy, TextureCache, TextureHandle, TextureKey,
};
use streaming::loader::{ImageRequest, LoaderConfig, ProgressiveLoader};

use crate::resources::{ResourceKind, ResourceRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    pub sphere_radius: f64,
    /// Icosahedron subdivision level; level 1 gives the 42-anchor sphere.
    pub subdivisions: u32,
    pub disc_segments: u32,
    pub disc_radius: f64,
    /// Temporal-cycling advance per radian of rotation. A UX tuning knob,
    /// validated by playtesting rather than derived.
    pub cycle_rate: f64,
    /// Angular velocity above which the sphere counts as "moving" (rad/s).
    pub movement_threshold: f64,
    /// Maps angular velocity onto shader blur strength.
    pub blur_scale: f64,
    /// Extra radius around each anchor for the load-visibility test.
    pub visibility_margin: f64,
    /// Image-fetch work units handed to the loader per frame.
    pub upload_budget: u32,
    /// Frames between re-prioritizations of the pending load queue.
    pub promote_interval_frames: u64,
    pub arcball: ArcballConfig,
    pub camera: CameraConfig,
    pub atlas: AtlasConfig,
    pub cache_budget: CacheBudget,
    pub eviction_policy: EvictionPolicy,
    pub loader: LoaderConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            sphere_radius: 1.0,
            subdivisions: 1,
            disc_segments: 24,
            disc_radius: 0.12,
            cycle_rate: 6.0,
            movement_threshold: 0.05,
            blur_scale: 0.12,
            visibility_margin: 0.18,
            upload_budget: 8,
            promote_interval_frames: 30,
            arcball: ArcballConfig::default(),
            camera: CameraConfig::default(),
            atlas: AtlasConfig::default(),
            cache_budget: CacheBudget::new(16, 256 * 1024 * 1024),
            eviction_policy: EvictionPolicy::Lru,
            loader: LoaderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderError {
    Unsupported(String),
    NotInitialized,
    ContextLost,
    Disposed,
    Atlas(AtlasError),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Unsupported(what) => write!(f, "renderer unsupported: {what}"),
            RenderError::NotInitialized => write!(f, "renderer not initialized"),
            RenderError::ContextLost => write!(f, "graphics context lost"),
            RenderError::Disposed => write!(f, "renderer disposed"),
            RenderError::Atlas(err) => write!(f, "atlas error: {err}"),
        }
    }
}

impl std::error::Error for RenderError {}

impl From<AtlasError> for RenderError {
    fn from(err: AtlasError) -> Self {
        RenderError::Atlas(err)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RendererState {
    Uninitialized,
    Running,
    ContextLost,
    Disposed,
}

/// Per-frame uniform block. Byte-compatible with the WGSL `Globals` struct
/// in `shaders.rs`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Globals {
    pub world: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub rotation_axis: [f32; 3],
    pub blur_strength: f32,
    pub sphere_radius: f32,
    pub cells_per_row: f32,
    pub cells_per_page: f32,
    pub _pad: f32,
}

/// Per-instance vertex data. `item_slot` is the atlas cell index, or a
/// negative value for instances with no item bound.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct InstanceRaw {
    pub anchor: [f32; 3],
    pub item_slot: f32,
}

/// Everything the platform layer needs to draw one frame.
#[derive(Debug)]
pub struct FrameOutput {
    pub frame: Frame,
    pub globals: Globals,
    pub instances: Vec<InstanceRaw>,
    /// Atlas pages repainted since the last frame; re-upload each in full.
    pub dirty_pages: Vec<u32>,
    /// Images to fetch and decode out-of-band.
    pub image_requests: Vec<ImageRequest>,
    /// In-flight fetches that timed out; abort them if possible.
    pub expired_requests: Vec<ImageRequest>,
    pub active_item: Option<usize>,
    pub is_moving: bool,
}

#[derive(Default)]
struct RendererCallbacks {
    on_active_item: Option<Box<dyn FnMut(usize)>>,
    on_movement: Option<Box<dyn FnMut(bool)>>,
    on_error: Option<Box<dyn FnMut(&RenderError)>>,
}

/// Renderer-agnostic view contract.
///
/// Callers pick an implementation via `is_supported()` without changing
/// call sites; `SphereRenderer` is the shared core behind each.
pub trait SphereView {
    fn is_supported() -> bool
    where
        Self: Sized;
    fn initialize(&mut self) -> Result<(), RenderError>;
    fn update_items(&mut self, items: &[SphereItem]) -> Result<(), RenderError>;
    fn resize(&mut self, width: f64, height: f64);
    fn render(&mut self, dt_s: f64) -> Result<(), RenderError>;
    fn dispose(&mut self);
}

/// Core item-sphere renderer.
///
/// Owns the control, camera, geometry, cache, and loader, and produces one
/// `FrameOutput` per tick. Never suspends: image fetches happen in the
/// embedder between frames, and results are folded back in through
/// `complete_image`/`fail_image`.
///
/// State machine: Uninitialized → Running → (ContextLost ⇄ Running) →
/// Disposed.
pub struct SphereRenderer {
    config: RendererConfig,
    state: RendererState,
    callbacks: RendererCallbacks,

    control: ArcballControl,
    camera: SphereCamera,
    anchors: Vec<Vec3>,
    disc: DiscGeometry,

    items: Vec<SphereItem>,
    cycling: CyclingOffset,
    loader: ProgressiveLoader,
    cache: TextureCache,
    registry: ResourceRegistry,

    frame: Frame,
    bus: EventBus,
    metrics: Metrics,
    active_item: Option<usize>,
    moving: bool,
}

impl SphereRenderer {
    pub fn new(config: RendererConfig) -> Self {
        let control = ArcballControl::new(config.arcball);
        let camera = SphereCamera::new(config.camera, config.arcball.initial_distance);
        let loader = ProgressiveLoader::new(config.loader, Atlas::new(config.atlas));
        let cache = TextureCache::new(config.cache_budget, config.eviction_policy);
        let disc = DiscGeometry::new(config.disc_segments, config.disc_radius);
        Self {
            config,
            state: RendererState::Uninitialized,
            callbacks: RendererCallbacks::default(),
            control,
            camera,
            anchors: Vec::new(),
            disc,
            items: Vec::new(),
            cycling: CyclingOffset::new(),
            loader,
            cache,
            registry: ResourceRegistry::new(),
            frame: Frame::first(),
            bus: EventBus::new(),
            metrics: Metrics::new(),
            active_item: None,
            moving: false,
        }
    }

    pub fn set_on_active_item(&mut self, callback: impl FnMut(usize) + 'static) {
        self.callbacks.on_active_item = Some(Box::new(callback));
    }

    pub fn set_on_movement(&mut self, callback: impl FnMut(bool) + 'static) {
        self.callbacks.on_movement = Some(Box::new(callback));
    }

    pub fn set_on_error(&mut self, callback: impl FnMut(&RenderError) + 'static) {
        self.callbacks.on_error = Some(Box::new(callback));
    }

    pub fn state(&self) -> RendererState {
        self.state
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn control_mut(&mut self) -> &mut ArcballControl {
        &mut self.control
    }

    pub fn active_item(&self) -> Option<usize> {
        self.active_item
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    pub fn anchors(&self) -> &[Vec3] {
        &self.anchors
    }

    pub fn disc(&self) -> &DiscGeometry {
        &self.disc
    }

    pub fn loader(&self) -> &ProgressiveLoader {
        &self.loader
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    pub fn drain_events(&mut self) -> Vec<runtime::event_bus::Event> {
        self.bus.drain()
    }

    /// Builds geometry and logical resources and enters `Running`.
    pub fn initialize(&mut self) -> Result<(), RenderError> {
        match self.state {
            RendererState::Disposed => return Err(RenderError::Disposed),
            RendererState::Running => return Ok(()),
            RendererState::Uninitialized | RendererState::ContextLost => {}
        }

        let mesh = build_anchor_sphere(self.config.subdivisions, self.config.sphere_radius);
        self.anchors = (0..mesh.vertex_count()).map(|i| mesh.position(i)).collect();
        self.disc = DiscGeometry::new(self.config.disc_segments, self.config.disc_radius);

        self.register_core_resources();
        self.state = RendererState::Running;
        self.bus.emit(self.frame, "renderer", "initialized");
        Ok(())
    }

    /// Replaces the item set wholesale.
    ///
    /// Cancels the in-flight load, drops every cached texture of the old
    /// set, repaints placeholders, and restarts progressive loading with
    /// the currently visible anchors as the priority set.
    pub fn update_items(&mut self, items: &[SphereItem]) -> Result<(), RenderError> {
        match self.state {
            RendererState::Running => {}
            RendererState::Disposed => return Err(RenderError::Disposed),
            RendererState::ContextLost => return Err(RenderError::ContextLost),
            RendererState::Uninitialized => return Err(RenderError::NotInitialized),
        }

        self.loader.cancel();
        for key in self.cache.clear() {
            self.dispose_texture(&key);
        }

        self.items = items.to_vec();
        self.cycling.reset();
        self.active_item = None;

        let visible = self.current_visible_indices();
        self.loader.begin(&self.items, &visible)?;
        self.bus
            .emit(self.frame, "items", format!("replaced: {}", items.len()));
        self.metrics.inc_counter("item_set_replacements", 1);
        Ok(())
    }

    /// Recomputes viewport-dependent state. Call on every canvas size
    /// change, with backing-store (device-pixel-ratio-scaled) dimensions.
    pub fn resize(&mut self, width: f64, height: f64) {
        self.control.set_viewport(width, height);
        self.camera.resize(width, height);
    }

    /// Advances one frame. Synchronous: never awaits, never blocks on I/O.
    pub fn advance(&mut self, dt_s: f64) -> Result<FrameOutput, RenderError> {
        match self.state {
            RendererState::Running => {}
            RendererState::Disposed => return Err(RenderError::Disposed),
            RendererState::ContextLost => return Err(RenderError::ContextLost),
            RendererState::Uninitialized => return Err(RenderError::NotInitialized),
        }

        self.frame = self.frame.advanced_by(dt_s);
        let dt = self.frame.dt_s;
        let now = self.frame.time.seconds();

        // 1. Input and orientation.
        self.control.update(dt);
        let orientation = self.control.orientation();
        let velocity = self.control.rotation_velocity();

        // 2-3. World matrix and camera easing.
        let world = Mat4::from_quat(orientation);
        self.camera.set_dragging(self.control.is_pointer_down());
        self.camera.set_base_distance(self.control.distance());
        self.camera.update(dt);

        // 4. Temporal cycling and active-item resolution.
        self.cycling
            .advance(velocity, dt, self.config.cycle_rate, self.items.len());
        let active = self.frontmost_item(orientation);
        if active != self.active_item {
            self.active_item = active;
            self.metrics.inc_counter("active_item_changes", 1);
            if let Some(index) = active
                && let Some(callback) = &mut self.callbacks.on_active_item
            {
                callback(index);
            }
        }

        // 5. Movement reporting, with the settle hook for full-res.
        let moving_now =
            self.control.is_pointer_down() || velocity > self.config.movement_threshold;
        if moving_now != self.moving {
            self.moving = moving_now;
            if let Some(callback) = &mut self.callbacks.on_movement {
                callback(moving_now);
            }
            if !moving_now && let Some(index) = self.active_item {
                self.loader.request_full(index);
            }
        }

        // Streaming: re-prioritize occasionally, expire deadlines, hand out
        // the next batch.
        if self.frame.index % self.config.promote_interval_frames.max(1) == 0 {
            let visible = self.current_visible_indices();
            self.loader.promote_visible(&visible);
        }
        let expired_requests = self.loader.expire(now);
        let mut budget = FrameBudget::new(self.config.upload_budget);
        let image_requests = self.loader.next_requests(&mut budget, now);
        let dirty_pages = self.loader.atlas_mut().take_dirty();
        if !dirty_pages.is_empty() {
            self.metrics
                .inc_counter("atlas_page_uploads", dirty_pages.len() as u64);
        }

        // 6. Frame assembly for the instanced draw.
        let instances = self.build_instances();
        let globals = self.build_globals(&world, velocity);

        self.metrics.inc_counter("frames", 1);
        self.metrics
            .set_gauge("resident_bytes", self.cache.used_bytes() as i64);

        Ok(FrameOutput {
            frame: self.frame,
            globals,
            instances,
            dirty_pages,
            image_requests,
            expired_requests,
            active_item: self.active_item,
            is_moving: self.moving,
        })
    }

    /// Folds a decoded image back into the atlas (no-op for stale sets).
    pub fn complete_image(&mut self, request: &ImageRequest, pixels: &ImagePixels) {
        self.loader.complete_image(request, pixels);
    }

    pub fn fail_image(&mut self, request: &ImageRequest, reason: &str) {
        self.loader.fail_image(request, reason);
    }

    /// Records an uploaded atlas page in the texture cache, pinned so page
    /// textures are never evicted while the atlas lives.
    pub fn note_page_uploaded(
        &mut self,
        page: u32,
        handle: TextureHandle,
        bytes: usize,
    ) -> Result<(), CacheError> {
        let key = atlas_page_key(page);
        self.cache.request(key.clone(), || {});
        match self.cache.complete(&key, handle, bytes) {
            Ok(evicted) => {
                for evicted_key in &evicted {
                    self.dispose_texture(evicted_key);
                }
            }
            Err(err) => return Err(err),
        }
        self.cache.add_ref(&key)
    }

    /// Records an uploaded full-resolution texture; evicted entries are
    /// disposed through the registry.
    pub fn note_full_res_uploaded(
        &mut self,
        item_index: usize,
        handle: TextureHandle,
        bytes: usize,
    ) -> Result<(), CacheError> {
        let key = full_res_key(item_index);
        self.cache.request(key.clone(), || {});
        let evicted = self.cache.complete(&key, handle, bytes)?;
        for evicted_key in &evicted {
            self.dispose_texture(evicted_key);
        }
        Ok(())
    }

    pub fn full_res_handle(&mut self, item_index: usize) -> Option<TextureHandle> {
        self.cache.get(&full_res_key(item_index))
    }

    /// Context loss: stop producing frames, drop all GPU state, surface the
    /// error. Recoverable via `context_restored`.
    pub fn context_lost(&mut self) {
        if self.state != RendererState::Running {
            return;
        }
        self.state = RendererState::ContextLost;
        self.loader.cancel();
        self.cache.clear();
        self.registry.dispose_all();
        self.bus.emit(self.frame, "renderer", "context lost");
        let error = RenderError::ContextLost;
        if let Some(callback) = &mut self.callbacks.on_error {
            callback(&error);
        }
    }

    /// Rebuilds geometry and resources from the retained item set and
    /// resumes frame production. No remount required.
    pub fn context_restored(&mut self) -> Result<(), RenderError> {
        if self.state != RendererState::ContextLost {
            return Ok(());
        }

        self.registry = ResourceRegistry::new();
        self.cache = TextureCache::new(self.config.cache_budget, self.config.eviction_policy);
        self.state = RendererState::Uninitialized;
        self.initialize()?;

        // Restart loading for the in-flight item set.
        self.cycling.reset();
        self.active_item = None;
        let visible = self.current_visible_indices();
        self.loader.begin(&self.items, &visible)?;

        self.bus.emit(self.frame, "renderer", "context restored");
        Ok(())
    }

    /// Idempotent teardown: cancels loading, clears the cache, disposes all
    /// registered resources in reverse order.
    pub fn dispose(&mut self) {
        if self.state == RendererState::Disposed {
            return;
        }
        self.loader.cancel();
        for key in self.cache.clear() {
            self.dispose_texture(&key);
        }
        self.registry.dispose_all();
        self.state = RendererState::Disposed;
        self.bus.emit(self.frame, "renderer", "disposed");
    }

    fn register_core_resources(&mut self) {
        let vertex_bytes = self.disc.mesh.positions.len() * 4 + self.disc.mesh.uvs.len() * 4;
        let index_bytes = self.disc.mesh.indices.len() * 4;
        let instance_bytes = self.anchors.len() * std::mem::size_of::<InstanceRaw>();

        let entries = [
            ("disc-vertex-buffer", ResourceKind::Buffer, vertex_bytes),
            ("disc-index-buffer", ResourceKind::Buffer, index_bytes),
            ("instance-buffer", ResourceKind::Buffer, instance_bytes),
            ("sphere-program", ResourceKind::Program, 0),
            ("sphere-vertex-array", ResourceKind::VertexArray, 0),
        ];
        for (id, kind, bytes) in entries {
            if let Err(err) = self.registry.register(id, kind, bytes, || Ok(())) {
                warn!(error = %err, "core resource registration failed");
            }
        }
    }

    /// Frontmost item: the anchor whose direction best aligns with the
    /// camera-forward axis pulled into sphere-local space. Instances with
    /// no item bound are skipped, so the result is always a live index.
    /// Deterministic: ties keep the lowest instance index.
    fn frontmost_item(&self, orientation: foundation::math::Quat) -> Option<usize> {
        if self.items.is_empty() || self.anchors.is_empty() {
            return None;
        }

        let target = orientation.conjugate().rotate(Vec3::new(0.0, 0.0, 1.0));
        let offset = self.cycling.offset();

        let mut best: Option<(f64, usize)> = None;
        for (instance, anchor) in self.anchors.iter().enumerate() {
            let Some(item) =
                item_for_instance(instance, self.anchors.len(), self.items.len(), offset)
            else {
                continue;
            };
            let alignment = anchor.normalize_or_zero().dot(target);
            match best {
                Some((best_alignment, _)) if alignment <= best_alignment => {}
                _ => best = Some((alignment, item)),
            }
        }
        best.map(|(_, item)| item)
    }

    fn current_visible_indices(&self) -> Vec<usize> {
        if self.items.is_empty() {
            return Vec::new();
        }
        let world = Mat4::from_quat(self.control.orientation());
        let frustum = Frustum::from_view_proj(&self.camera.view_proj());
        visible_item_indices(
            &world,
            &self.anchors,
            self.config.disc_radius + self.config.visibility_margin,
            &frustum,
            self.items.len(),
            self.cycling.offset(),
            self.camera.eye(),
        )
    }

    fn build_instances(&self) -> Vec<InstanceRaw> {
        let offset = self.cycling.offset();
        self.anchors
            .iter()
            .enumerate()
            .map(|(instance, anchor)| {
                let slot =
                    item_for_instance(instance, self.anchors.len(), self.items.len(), offset)
                        .map(|item| item as f32)
                        .unwrap_or(-1.0);
                InstanceRaw {
                    anchor: [anchor.x as f32, anchor.y as f32, anchor.z as f32],
                    item_slot: slot,
                }
            })
            .collect()
    }

    fn build_globals(&self, world: &Mat4, velocity: f64) -> Globals {
        let axis = self.control.rotation_axis();
        let atlas = self.loader.atlas();
        Globals {
            world: world.to_f32_cols(),
            view_proj: self.camera.view_proj().to_f32_cols(),
            rotation_axis: [axis.x as f32, axis.y as f32, axis.z as f32],
            blur_strength: (velocity * self.config.blur_scale).clamp(0.0, 1.0) as f32,
            sphere_radius: self.config.sphere_radius as f32,
            cells_per_row: atlas.config().cells_per_row as f32,
            cells_per_page: atlas.cells_per_page() as f32,
            _pad: 0.0,
        }
    }

    fn dispose_texture(&mut self, key: &TextureKey) {
        let id = texture_resource_id(key);
        if self.registry.contains(&id)
            && let Err(err) = self.registry.dispose(&id)
        {
            warn!(error = %err, "texture disposal failed");
        }
    }
}

pub fn atlas_page_key(page: u32) -> TextureKey {
    TextureKey::new("atlas", format!("page-{page}"))
}

pub fn full_res_key(item_index: usize) -> TextureKey {
    TextureKey::new("full", format!("item-{item_index}"))
}

pub fn texture_resource_id(key: &TextureKey) -> String {
    format!("tex:{}:{}", key.group, key.name)
}
