//! Software fallback renderer.
//!
//! Same external contract as the GPU path, for environments without a
//! usable graphics context: the shared core produces the frame, and this
//! module rasterizes it on the CPU as depth-sorted composited circles in an
//! RGBA framebuffer. Item cells render as their placeholder colors; the
//! point set is the same icosahedron-derived anchor set the GPU path uses.

use foundation::math::stable_total_cmp_f64;
use scene::items::SphereItem;
use streaming::atlas::placeholder_color;

use crate::renderer::{FrameOutput, RenderError, RendererConfig, SphereRenderer, SphereView};

const BACKGROUND: [u8; 4] = [8, 10, 16, 255];

pub struct SoftwareSphereRenderer {
    core: SphereRenderer,
    width: usize,
    height: usize,
    framebuffer: Vec<u8>,
}

impl SoftwareSphereRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            core: SphereRenderer::new(config),
            width: 0,
            height: 0,
            framebuffer: Vec::new(),
        }
    }

    pub fn core_mut(&mut self) -> &mut SphereRenderer {
        &mut self.core
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// RGBA8 pixels of the last rendered frame, row-major, top-left origin.
    pub fn framebuffer(&self) -> &[u8] {
        &self.framebuffer
    }

    fn rasterize(&mut self, out: &FrameOutput) {
        for px in self.framebuffer.chunks_exact_mut(4) {
            px.copy_from_slice(&BACKGROUND);
        }
        if self.width == 0 || self.height == 0 {
            return;
        }

        // Project every bound instance, then paint back-to-front.
        struct Sprite {
            x: f64,
            y: f64,
            radius: f64,
            depth: f64,
            alpha: f64,
            color: [u8; 4],
        }

        let world = &out.globals.world;
        let view_proj = &out.globals.view_proj;
        let proj_scale = f64::from(out.globals.view_proj[1][1]);
        let disc_radius = self.core.config().disc_radius;

        let mut sprites: Vec<Sprite> = Vec::new();
        for instance in &out.instances {
            if instance.item_slot < 0.0 {
                continue;
            }
            let anchor = [
                f64::from(instance.anchor[0]),
                f64::from(instance.anchor[1]),
                f64::from(instance.anchor[2]),
            ];
            let world_pos = transform(world, anchor);
            let clip = transform4(view_proj, [world_pos[0], world_pos[1], world_pos[2]]);
            if clip[3] <= 1e-6 {
                continue;
            }
            let ndc_x = clip[0] / clip[3];
            let ndc_y = clip[1] / clip[3];

            // Far-side fade on the rotated anchor direction, matching the
            // GPU shader's smoothstep.
            let dir = normalize3(world_pos);
            let fade = smoothstep(-0.35, 0.45, dir[2]);

            sprites.push(Sprite {
                x: (ndc_x * 0.5 + 0.5) * self.width as f64,
                y: (0.5 - ndc_y * 0.5) * self.height as f64,
                radius: disc_radius * proj_scale / clip[3] * self.height as f64 * 0.5,
                depth: clip[3],
                alpha: 0.12 + 0.88 * fade,
                color: placeholder_color(instance.item_slot as usize),
            });
        }

        // Back-to-front so near discs composite over far ones.
        sprites.sort_by(|a, b| stable_total_cmp_f64(b.depth, a.depth));

        for sprite in &sprites {
            self.fill_circle(sprite.x, sprite.y, sprite.radius, sprite.color, sprite.alpha);
        }
    }

    fn fill_circle(&mut self, cx: f64, cy: f64, radius: f64, color: [u8; 4], alpha: f64) {
        if radius <= 0.0 {
            return;
        }
        let x0 = ((cx - radius).floor().max(0.0)) as usize;
        let y0 = ((cy - radius).floor().max(0.0)) as usize;
        let x1 = ((cx + radius).ceil().min(self.width as f64 - 1.0)) as usize;
        let y1 = ((cy + radius).ceil().min(self.height as f64 - 1.0)) as usize;
        let r2 = radius * radius;

        for y in y0..=y1 {
            for x in x0..=x1 {
                let dx = x as f64 + 0.5 - cx;
                let dy = y as f64 + 0.5 - cy;
                if dx * dx + dy * dy > r2 {
                    continue;
                }
                let offset = (y * self.width + x) * 4;
                for c in 0..3 {
                    let dst = f64::from(self.framebuffer[offset + c]);
                    let src = f64::from(color[c]);
                    self.framebuffer[offset + c] = (dst + (src - dst) * alpha).round() as u8;
                }
                self.framebuffer[offset + 3] = 255;
            }
        }
    }
}

impl SphereView for SoftwareSphereRenderer {
    /// The CPU path has no platform requirements.
    fn is_supported() -> bool {
        true
    }

    fn initialize(&mut self) -> Result<(), RenderError> {
        self.core.initialize()
    }

    fn update_items(&mut self, items: &[SphereItem]) -> Result<(), RenderError> {
        self.core.update_items(items)
    }

    fn resize(&mut self, width: f64, height: f64) {
        self.core.resize(width, height);
        self.width = width.max(0.0) as usize;
        self.height = height.max(0.0) as usize;
        self.framebuffer = vec![0u8; self.width * self.height * 4];
    }

    fn render(&mut self, dt_s: f64) -> Result<(), RenderError> {
        let out = self.core.advance(dt_s)?;
        self.rasterize(&out);
        Ok(())
    }

    fn dispose(&mut self) {
        self.core.dispose();
        self.framebuffer.clear();
    }
}

fn transform(m: &[[f32; 4]; 4], p: [f64; 3]) -> [f64; 3] {
    let t = transform4(m, p);
    [t[0], t[1], t[2]]
}

fn transform4(m: &[[f32; 4]; 4], p: [f64; 3]) -> [f64; 4] {
    let mut out = [0.0f64; 4];
    for (row, slot) in out.iter_mut().enumerate() {
        *slot = f64::from(m[0][row]) * p[0]
            + f64::from(m[1][row]) * p[1]
            + f64::from(m[2][row]) * p[2]
            + f64::from(m[3][row]);
    }
    out
}

fn normalize3(v: [f64; 3]) -> [f64; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len > 1e-12 {
        [v[0] / len, v[1] / len, v[2] / len]
    } else {
        [0.0, 0.0, 0.0]
    }
}

fn smoothstep(edge0: f64, edge1: f64, x: f64) -> f64 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::{BACKGROUND, SoftwareSphereRenderer};
    use crate::renderer::{RendererConfig, SphereView};
    use scene::items::SphereItem;
    use streaming::atlas::{AtlasConfig, placeholder_color};

    fn items(n: usize) -> Vec<SphereItem> {
        (0..n)
            .map(|i| SphereItem {
                id: i as u64,
                image: format!("https://img.test/{i}.jpg"),
                image_high_res: None,
                title: format!("item {i}"),
                description: String::new(),
                link: String::new(),
            })
            .collect()
    }

    fn view() -> SoftwareSphereRenderer {
        let config = RendererConfig {
            atlas: AtlasConfig {
                cell_px: 4,
                cells_per_row: 4,
                max_pages: 16,
            },
            ..RendererConfig::default()
        };
        let mut v = SoftwareSphereRenderer::new(config);
        v.initialize().unwrap();
        v.resize(160.0, 120.0);
        v
    }

    #[test]
    fn software_path_is_always_supported() {
        assert!(SoftwareSphereRenderer::is_supported());
    }

    #[test]
    fn renders_discs_over_the_background() {
        let mut v = view();
        v.update_items(&items(42)).unwrap();
        v.render(1.0 / 60.0).unwrap();

        let fb = v.framebuffer();
        assert_eq!(fb.len(), 160 * 120 * 4);
        let non_background = fb
            .chunks_exact(4)
            .filter(|px| px[0..3] != BACKGROUND[0..3])
            .count();
        assert!(non_background > 0, "some discs must rasterize");
    }

    #[test]
    fn frontmost_disc_paints_the_center_with_its_placeholder_color() {
        let mut v = view();
        v.update_items(&items(42)).unwrap();
        v.render(1.0 / 60.0).unwrap();

        let active = v.core_mut().active_item().unwrap();
        let expected = placeholder_color(active);
        let (w, h) = v.dimensions();
        let center = ((h / 2) * w + w / 2) * 4;
        let px = &v.framebuffer()[center..center + 4];
        assert_eq!(&px[0..3], &expected[0..3]);
    }

    #[test]
    fn disposing_clears_the_frame_and_stops_rendering() {
        let mut v = view();
        v.update_items(&items(8)).unwrap();
        v.render(1.0 / 60.0).unwrap();
        v.dispose();
        assert!(v.framebuffer().is_empty());
        assert!(v.render(1.0 / 60.0).is_err());
    }
}
