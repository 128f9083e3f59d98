use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasConfig {
    /// Cell edge length in pixels (cells are square).
    pub cell_px: u32,
    /// Cells per row; a page holds `cells_per_row²` cells.
    pub cells_per_row: u32,
    /// Hard page cap. Item counts beyond `max_pages · cells_per_row²` are
    /// rejected at `begin` time — never silently wrapped.
    pub max_pages: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            cell_px: 256,
            cells_per_row: 8,
            max_pages: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtlasError {
    CapacityExceeded { items: usize, capacity: usize },
}

impl std::fmt::Display for AtlasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtlasError::CapacityExceeded { items, capacity } => {
                write!(f, "atlas capacity exceeded: items={items} capacity={capacity}")
            }
        }
    }
}

impl std::error::Error for AtlasError {}

/// Pixel rectangle of a cell within its page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CellRect {
    pub page: u32,
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// Normalized UV rectangle of a cell (for the shader-side lookup).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CellUv {
    pub page: u32,
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

/// Decoded RGBA8 image handed in by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePixels {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl ImagePixels {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || rgba.len() != (width * height * 4) as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            rgba,
        })
    }

    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [self.rgba[i], self.rgba[i + 1], self.rgba[i + 2], self.rgba[i + 3]]
    }
}

#[derive(Debug, Clone)]
struct AtlasPage {
    pixels: Vec<u8>,
    dirty: bool,
}

/// CPU-side paged texture atlas.
///
/// The loader paints placeholder colors and cover-fit thumbnails into these
/// RGBA buffers; the embedder re-uploads each dirty page as one atomic
/// whole-page texture write, so the GPU never samples a torn page.
#[derive(Debug)]
pub struct Atlas {
    config: AtlasConfig,
    item_count: usize,
    pages: Vec<AtlasPage>,
}

impl Atlas {
    pub fn new(config: AtlasConfig) -> Self {
        Self {
            config,
            item_count: 0,
            pages: Vec::new(),
        }
    }

    pub fn config(&self) -> AtlasConfig {
        self.config
    }

    pub fn cells_per_page(&self) -> usize {
        (self.config.cells_per_row * self.config.cells_per_row) as usize
    }

    /// Total item capacity across all permitted pages.
    pub fn capacity(&self) -> usize {
        self.cells_per_page() * self.config.max_pages as usize
    }

    /// Page edge length in pixels.
    pub fn page_px(&self) -> u32 {
        self.config.cell_px * self.config.cells_per_row
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Allocates pages for `item_count` items, resetting all cells.
    pub fn begin(&mut self, item_count: usize) -> Result<(), AtlasError> {
        if item_count > self.capacity() {
            return Err(AtlasError::CapacityExceeded {
                items: item_count,
                capacity: self.capacity(),
            });
        }
        let pages_needed = item_count.div_ceil(self.cells_per_page()).max(1);
        let page_bytes = (self.page_px() * self.page_px() * 4) as usize;
        self.pages = (0..pages_needed)
            .map(|_| AtlasPage {
                pixels: vec![0u8; page_bytes],
                dirty: true,
            })
            .collect();
        self.item_count = item_count;
        Ok(())
    }

    pub fn cell_rect(&self, index: usize) -> CellRect {
        let per_page = self.cells_per_page();
        let page = (index / per_page) as u32;
        let cell = index % per_page;
        let cx = (cell as u32) % self.config.cells_per_row;
        let cy = (cell as u32) / self.config.cells_per_row;
        CellRect {
            page,
            x: cx * self.config.cell_px,
            y: cy * self.config.cell_px,
            size: self.config.cell_px,
        }
    }

    pub fn cell_uv(&self, index: usize) -> CellUv {
        let rect = self.cell_rect(index);
        let page_px = self.page_px() as f32;
        CellUv {
            page: rect.page,
            u0: rect.x as f32 / page_px,
            v0: rect.y as f32 / page_px,
            u1: (rect.x + rect.size) as f32 / page_px,
            v1: (rect.y + rect.size) as f32 / page_px,
        }
    }

    /// Fills the cell with the item's deterministic placeholder color.
    pub fn paint_placeholder(&mut self, index: usize) {
        let color = placeholder_color(index);
        let rect = self.cell_rect(index);
        self.fill_rect(rect, color);
    }

    /// Paints `src` into the cell with cover-fit semantics: scaled to fill,
    /// aspect preserved, overflow cropped symmetrically (the effect of CSS
    /// `object-fit: cover`). Nearest sampling.
    pub fn paint_cover(&mut self, index: usize, src: &ImagePixels) {
        let rect = self.cell_rect(index);
        let Some(page) = self.pages.get_mut(rect.page as usize) else {
            return;
        };

        let cell = rect.size as f64;
        let scale = (cell / f64::from(src.width)).max(cell / f64::from(src.height));
        let src_w = cell / scale;
        let src_h = cell / scale;
        let src_x0 = (f64::from(src.width) - src_w) * 0.5;
        let src_y0 = (f64::from(src.height) - src_h) * 0.5;

        let stride = (self.config.cell_px * self.config.cells_per_row * 4) as usize;
        for dy in 0..rect.size {
            let sy = src_y0 + (f64::from(dy) + 0.5) / cell * src_h;
            let sy = (sy as u32).min(src.height - 1);
            for dx in 0..rect.size {
                let sx = src_x0 + (f64::from(dx) + 0.5) / cell * src_w;
                let sx = (sx as u32).min(src.width - 1);
                let texel = src.pixel(sx, sy);
                let offset = (rect.y + dy) as usize * stride + (rect.x + dx) as usize * 4;
                page.pixels[offset..offset + 4].copy_from_slice(&texel);
            }
        }
        page.dirty = true;
    }

    /// Drains the set of dirty page ids. Each returned page should be
    /// re-uploaded in full before the next frame samples it.
    pub fn take_dirty(&mut self) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, page) in self.pages.iter_mut().enumerate() {
            if page.dirty {
                page.dirty = false;
                out.push(i as u32);
            }
        }
        out
    }

    pub fn page_pixels(&self, page: u32) -> Option<&[u8]> {
        self.pages.get(page as usize).map(|p| p.pixels.as_slice())
    }

    /// Estimated GPU footprint of all allocated pages.
    pub fn estimated_bytes(&self) -> usize {
        self.pages.len() * (self.page_px() * self.page_px() * 4) as usize
    }

    fn fill_rect(&mut self, rect: CellRect, color: [u8; 4]) {
        let stride = (self.config.cell_px * self.config.cells_per_row * 4) as usize;
        let Some(page) = self.pages.get_mut(rect.page as usize) else {
            return;
        };
        for dy in 0..rect.size {
            let row = (rect.y + dy) as usize * stride + rect.x as usize * 4;
            for dx in 0..rect.size as usize {
                page.pixels[row + dx * 4..row + dx * 4 + 4].copy_from_slice(&color);
            }
        }
        page.dirty = true;
    }
}

/// Deterministic unique placeholder color per item.
///
/// The hue walks the golden angle so neighboring indices land far apart on
/// the color wheel.
pub fn placeholder_color(index: usize) -> [u8; 4] {
    let hue = (index as f64 * 137.508) % 360.0;
    let (r, g, b) = hsv_to_rgb(hue, 0.55, 0.70);
    [r, g, b, 255]
}

fn hsv_to_rgb(h_deg: f64, s: f64, v: f64) -> (u8, u8, u8) {
    let c = v * s;
    let h = h_deg / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::{Atlas, AtlasConfig, AtlasError, ImagePixels, placeholder_color};

    fn small_atlas() -> Atlas {
        Atlas::new(AtlasConfig {
            cell_px: 4,
            cells_per_row: 2,
            max_pages: 2,
        })
    }

    #[test]
    fn capacity_is_an_explicit_invariant() {
        let mut atlas = small_atlas();
        assert_eq!(atlas.capacity(), 8);
        assert!(atlas.begin(8).is_ok());
        assert_eq!(atlas.page_count(), 2);

        let err = atlas.begin(9).unwrap_err();
        assert_eq!(
            err,
            AtlasError::CapacityExceeded {
                items: 9,
                capacity: 8
            }
        );
    }

    #[test]
    fn cell_layout_follows_the_grid_formula() {
        let mut atlas = small_atlas();
        atlas.begin(8).unwrap();

        let r0 = atlas.cell_rect(0);
        assert_eq!((r0.page, r0.x, r0.y), (0, 0, 0));
        let r3 = atlas.cell_rect(3);
        assert_eq!((r3.page, r3.x, r3.y), (0, 4, 4));
        let r4 = atlas.cell_rect(4);
        assert_eq!((r4.page, r4.x, r4.y), (1, 0, 0));

        let uv = atlas.cell_uv(3);
        assert!((uv.u0 - 0.5).abs() < 1e-6 && (uv.v0 - 0.5).abs() < 1e-6);
        assert!((uv.u1 - 1.0).abs() < 1e-6 && (uv.v1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn placeholder_colors_are_deterministic_and_distinct() {
        assert_eq!(placeholder_color(5), placeholder_color(5));
        for i in 0..16 {
            assert_ne!(placeholder_color(i), placeholder_color(i + 1));
        }
    }

    #[test]
    fn placeholder_paint_fills_only_its_cell() {
        let mut atlas = small_atlas();
        atlas.begin(4).unwrap();
        atlas.take_dirty();

        atlas.paint_placeholder(0);
        let pixels = atlas.page_pixels(0).unwrap();
        let expected = placeholder_color(0);
        // Top-left texel belongs to cell 0.
        assert_eq!(&pixels[0..4], &expected);
        // A texel in cell 1 (x >= 4) is untouched.
        let off = 4usize * 4;
        assert_eq!(&pixels[off..off + 4], &[0, 0, 0, 0]);
        assert_eq!(atlas.take_dirty(), vec![0]);
    }

    #[test]
    fn cover_fit_crops_the_long_axis_symmetrically() {
        let mut atlas = small_atlas();
        atlas.begin(1).unwrap();

        // 8×4 source: left half red, right half blue. Cover into a 4×4 cell
        // crops 2 columns from each side, so the seam stays centered.
        let mut rgba = Vec::new();
        for _y in 0..4 {
            for x in 0..8 {
                if x < 4 {
                    rgba.extend_from_slice(&[255, 0, 0, 255]);
                } else {
                    rgba.extend_from_slice(&[0, 0, 255, 255]);
                }
            }
        }
        let src = ImagePixels::new(8, 4, rgba).unwrap();
        atlas.paint_cover(0, &src);

        let pixels = atlas.page_pixels(0).unwrap();
        let stride = atlas.page_px() as usize * 4;
        let texel = |x: usize, y: usize| &pixels[y * stride + x * 4..y * stride + x * 4 + 4];
        assert_eq!(texel(0, 0), &[255, 0, 0, 255]);
        assert_eq!(texel(1, 0), &[255, 0, 0, 255]);
        assert_eq!(texel(2, 0), &[0, 0, 255, 255]);
        assert_eq!(texel(3, 0), &[0, 0, 255, 255]);
    }

    #[test]
    fn dirty_pages_drain_once() {
        let mut atlas = small_atlas();
        atlas.begin(8).unwrap();
        // begin marks every page dirty for the initial upload.
        assert_eq!(atlas.take_dirty(), vec![0, 1]);
        assert!(atlas.take_dirty().is_empty());

        atlas.paint_placeholder(5); // cell 5 lives on page 1
        assert_eq!(atlas.take_dirty(), vec![1]);
    }

    #[test]
    fn rejects_malformed_pixel_buffers() {
        assert!(ImagePixels::new(2, 2, vec![0; 16]).is_some());
        assert!(ImagePixels::new(2, 2, vec![0; 15]).is_none());
        assert!(ImagePixels::new(0, 2, vec![]).is_none());
    }
}
