use std::collections::{BTreeMap, BTreeSet};

use runtime::budget::FrameBudget;
use runtime::work_queue::{WorkId, WorkQueue};
use scene::items::SphereItem;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::atlas::{Atlas, AtlasError, ImagePixels};

/// Queue priority for items currently in the frustum.
const PRIORITY_VISIBLE: i32 = 0;
/// Queue priority for off-screen items.
const PRIORITY_BACKGROUND: i32 = 1;
/// Queue priority for on-demand full-resolution upgrades.
const PRIORITY_FULL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Batch size while visible-priority work is pending. Smaller batches
    /// keep the main thread responsive during the first visible paint.
    pub priority_batch_size: usize,
    /// Batch size for background (off-screen) work.
    pub batch_size: usize,
    /// Per-image deadline; an image still in flight after this long is
    /// treated as failed (its cell keeps the placeholder).
    pub timeout_s: f64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            priority_batch_size: 4,
            batch_size: 12,
            timeout_s: 10.0,
        }
    }
}

/// Loading phases, strictly ordered: every cell carries its placeholder
/// before any network request is issued; full resolution is an on-demand
/// per-item upgrade, never automatic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadPhase {
    Placeholder,
    Thumbnail,
    Full,
}

/// One image the embedder should fetch and decode.
///
/// `generation` ties the request to the item set that produced it; results
/// for a superseded set are ignored on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub item_index: usize,
    pub url: String,
    pub phase: LoadPhase,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadProgress {
    pub phase: LoadPhase,
    pub loaded: usize,
    pub total: usize,
    pub visible_loaded: usize,
    pub visible_total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    item_index: usize,
    phase: LoadPhase,
}

#[derive(Debug, Clone)]
struct InFlight {
    item_index: usize,
    phase: LoadPhase,
    generation: u64,
    url: String,
    issued_at_s: f64,
}

/// Phased texture loader feeding the shared atlas.
///
/// Sans-IO: the loader decides *what* to load in *which* order and paints
/// completed pixels; the embedder performs the actual fetch/decode between
/// `next_requests` and `complete_image`/`fail_image`. Time is injected so
/// deadlines are testable.
#[derive(Debug)]
pub struct ProgressiveLoader {
    config: LoaderConfig,
    atlas: Atlas,
    generation: u64,
    cancelled: bool,
    phase: LoadPhase,
    queue: WorkQueue<Pending>,
    queued_thumbs: BTreeMap<usize, WorkId>,
    in_flight: Vec<InFlight>,
    thumb_urls: Vec<String>,
    full_urls: Vec<String>,
    visible: BTreeSet<usize>,
    loaded: BTreeSet<usize>,
    failed: BTreeSet<usize>,
    total: usize,
    events: Vec<LoadProgress>,
}

impl ProgressiveLoader {
    pub fn new(config: LoaderConfig, atlas: Atlas) -> Self {
        Self {
            config,
            atlas,
            generation: 0,
            cancelled: false,
            phase: LoadPhase::Placeholder,
            queue: WorkQueue::new(),
            queued_thumbs: BTreeMap::new(),
            in_flight: Vec::new(),
            thumb_urls: Vec::new(),
            full_urls: Vec::new(),
            visible: BTreeSet::new(),
            loaded: BTreeSet::new(),
            failed: BTreeSet::new(),
            total: 0,
            events: Vec::new(),
        }
    }

    pub fn atlas(&self) -> &Atlas {
        &self.atlas
    }

    pub fn atlas_mut(&mut self) -> &mut Atlas {
        &mut self.atlas
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True once no request is pending or in flight.
    pub fn is_complete(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// Restarts loading for a new item set.
    ///
    /// Bumps the generation (invalidating every outstanding request of the
    /// previous set), paints every placeholder synchronously, then enqueues
    /// the thumbnail phase with `visible` items at the front.
    pub fn begin(&mut self, items: &[SphereItem], visible: &[usize]) -> Result<(), AtlasError> {
        self.atlas.begin(items.len())?;

        self.generation += 1;
        self.cancelled = false;
        self.phase = LoadPhase::Placeholder;
        self.queue.clear();
        self.queued_thumbs.clear();
        self.in_flight.clear();
        self.loaded.clear();
        self.failed.clear();
        self.total = items.len();
        self.thumb_urls = items.iter().map(|i| i.image.clone()).collect();
        self.full_urls = items.iter().map(|i| i.full_res_url().to_string()).collect();
        self.visible = visible.iter().copied().filter(|&i| i < items.len()).collect();

        for i in 0..items.len() {
            self.atlas.paint_placeholder(i);
        }

        self.phase = LoadPhase::Thumbnail;
        for i in 0..items.len() {
            let priority = if self.visible.contains(&i) {
                PRIORITY_VISIBLE
            } else {
                PRIORITY_BACKGROUND
            };
            let id = self.queue.push(
                priority,
                Pending {
                    item_index: i,
                    phase: LoadPhase::Thumbnail,
                },
            );
            self.queued_thumbs.insert(i, id);
        }

        self.emit_progress();
        Ok(())
    }

    /// Updates the visible set and moves still-pending visible items to the
    /// front of the queue.
    pub fn promote_visible(&mut self, visible: &[usize]) {
        self.visible = visible.iter().copied().filter(|&i| i < self.total).collect();
        for &i in visible {
            if let Some(&id) = self.queued_thumbs.get(&i)
                && self.queue.cancel(id)
            {
                let new_id = self.queue.push(
                    PRIORITY_VISIBLE,
                    Pending {
                        item_index: i,
                        phase: LoadPhase::Thumbnail,
                    },
                );
                self.queued_thumbs.insert(i, new_id);
            }
        }
    }

    /// Requests an on-demand full-resolution upgrade for one item.
    ///
    /// The URL comes from the same record as the thumbnail (falling back to
    /// the thumbnail URL), so both phases always show the same asset.
    pub fn request_full(&mut self, item_index: usize) {
        if self.cancelled || item_index >= self.total {
            return;
        }
        self.queue.push(
            PRIORITY_FULL,
            Pending {
                item_index,
                phase: LoadPhase::Full,
            },
        );
    }

    /// Pops the next batch of image requests for the embedder to fetch.
    ///
    /// The batch is capped at `priority_batch_size` while the front of the
    /// queue is visible-priority work, `batch_size` otherwise, and further
    /// bounded by the per-frame budget.
    pub fn next_requests(&mut self, budget: &mut FrameBudget, now_s: f64) -> Vec<ImageRequest> {
        if self.cancelled {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut cap = self.config.batch_size;
        while out.len() < cap {
            let Some((_, priority, pending)) = self.queue.pop_next_with_budget(budget) else {
                break;
            };
            if out.is_empty() && priority <= PRIORITY_VISIBLE {
                cap = self.config.priority_batch_size;
            }
            if pending.phase == LoadPhase::Thumbnail {
                self.queued_thumbs.remove(&pending.item_index);
            }

            let url = match pending.phase {
                LoadPhase::Full => self.full_urls[pending.item_index].clone(),
                _ => self.thumb_urls[pending.item_index].clone(),
            };
            let request = ImageRequest {
                item_index: pending.item_index,
                url: url.clone(),
                phase: pending.phase,
                generation: self.generation,
            };
            self.in_flight.push(InFlight {
                item_index: pending.item_index,
                phase: pending.phase,
                generation: self.generation,
                url,
                issued_at_s: now_s,
            });
            out.push(request);
        }
        out
    }

    /// Integrates a decoded image. Stale (superseded-generation) and
    /// post-cancel completions are dropped without touching the atlas.
    pub fn complete_image(&mut self, request: &ImageRequest, pixels: &ImagePixels) {
        if self.cancelled || request.generation != self.generation {
            return;
        }
        if !self.remove_in_flight(request) {
            // Already expired or never issued; do not repaint.
            return;
        }

        self.atlas.paint_cover(request.item_index, pixels);
        self.loaded.insert(request.item_index);
        self.emit_progress();
    }

    /// Records a per-image failure. The cell keeps its placeholder and the
    /// batch carries on; one bad asset never aborts the session.
    pub fn fail_image(&mut self, request: &ImageRequest, reason: &str) {
        if self.cancelled || request.generation != self.generation {
            return;
        }
        if !self.remove_in_flight(request) {
            return;
        }

        warn!(
            item = request.item_index,
            url = request.url.as_str(),
            reason,
            "image load failed; keeping placeholder"
        );
        self.failed.insert(request.item_index);
        self.emit_progress();
    }

    /// Fails every in-flight request older than the configured timeout and
    /// returns them so the embedder can abort the fetches.
    pub fn expire(&mut self, now_s: f64) -> Vec<ImageRequest> {
        let timeout = self.config.timeout_s;
        let (expired, keep): (Vec<InFlight>, Vec<InFlight>) = self
            .in_flight
            .drain(..)
            .partition(|f| now_s - f.issued_at_s > timeout);
        self.in_flight = keep;

        let mut out = Vec::new();
        for f in expired {
            warn!(
                item = f.item_index,
                url = f.url.as_str(),
                "image load timed out; keeping placeholder"
            );
            self.failed.insert(f.item_index);
            out.push(ImageRequest {
                item_index: f.item_index,
                url: f.url,
                phase: f.phase,
                generation: f.generation,
            });
        }
        if !out.is_empty() {
            self.emit_progress();
        }
        out
    }

    /// Cooperative cancellation: no further requests are handed out and
    /// late completions are dropped. Already-issued fetches finish in the
    /// embedder but never touch the atlas.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.queue.clear();
        self.queued_thumbs.clear();
        self.in_flight.clear();
    }

    pub fn progress(&self) -> LoadProgress {
        LoadProgress {
            phase: self.phase,
            loaded: self.loaded.len(),
            total: self.total,
            visible_loaded: self.loaded.intersection(&self.visible).count(),
            visible_total: self.visible.len(),
        }
    }

    /// Drains progress events accumulated since the last call.
    pub fn drain_progress(&mut self) -> Vec<LoadProgress> {
        std::mem::take(&mut self.events)
    }

    fn emit_progress(&mut self) {
        let progress = self.progress();
        self.events.push(progress);
    }

    fn remove_in_flight(&mut self, request: &ImageRequest) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|f| {
            !(f.item_index == request.item_index
                && f.phase == request.phase
                && f.generation == request.generation)
        });
        self.in_flight.len() < before
    }
}

#[cfg(test)]
mod tests {
    use super::{ImageRequest, LoadPhase, LoaderConfig, ProgressiveLoader};
    use crate::atlas::{Atlas, AtlasConfig, ImagePixels, placeholder_color};
    use runtime::budget::FrameBudget;
    use scene::items::SphereItem;

    fn items(n: usize) -> Vec<SphereItem> {
        (0..n)
            .map(|i| SphereItem {
                id: i as u64,
                image: format!("https://img.test/{i}.jpg"),
                image_high_res: (i % 2 == 0).then(|| format!("https://img.test/{i}@2x.jpg")),
                title: format!("item {i}"),
                description: String::new(),
                link: String::new(),
            })
            .collect()
    }

    fn loader() -> ProgressiveLoader {
        let atlas = Atlas::new(AtlasConfig {
            cell_px: 4,
            cells_per_row: 4,
            max_pages: 4,
        });
        ProgressiveLoader::new(LoaderConfig::default(), atlas)
    }

    fn solid(w: u32, h: u32, color: [u8; 4]) -> ImagePixels {
        let mut rgba = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..w * h {
            rgba.extend_from_slice(&color);
        }
        ImagePixels::new(w, h, rgba).unwrap()
    }

    #[test]
    fn placeholders_paint_before_any_request_is_issued() {
        let mut l = loader();
        l.begin(&items(6), &[]).unwrap();

        // Every cell already carries its placeholder color.
        let pixels = l.atlas().page_pixels(0).unwrap().to_vec();
        let expected = placeholder_color(1);
        // Cell 1 starts at x = 4 on page 0.
        assert_eq!(&pixels[4 * 4..4 * 4 + 4], &expected);

        // And only then does thumbnail work become available.
        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 0.0);
        assert!(!batch.is_empty());
        assert!(batch.iter().all(|r| r.phase == LoadPhase::Thumbnail));
    }

    #[test]
    fn visible_items_come_first_in_smaller_batches() {
        let mut l = loader();
        l.begin(&items(20), &[7, 3]).unwrap();

        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 0.0);
        // Visible-priority front → priority batch size.
        assert_eq!(batch.len(), LoaderConfig::default().priority_batch_size);
        let first_two: Vec<usize> = batch.iter().take(2).map(|r| r.item_index).collect();
        assert!(first_two.contains(&3) && first_two.contains(&7));

        // Once the visible set is done, background batches are larger.
        let batch = l.next_requests(&mut budget, 0.0);
        assert_eq!(batch.len(), LoaderConfig::default().batch_size);
    }

    #[test]
    fn completion_paints_the_cell_and_counts_progress() {
        let mut l = loader();
        l.begin(&items(4), &[0]).unwrap();
        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 0.0);
        let req = batch[0].clone();

        l.drain_progress();
        l.complete_image(&req, &solid(8, 8, [9, 9, 9, 255]));

        let progress = l.progress();
        assert_eq!(progress.loaded, 1);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.visible_loaded, 1);
        assert_eq!(progress.visible_total, 1);
        assert_eq!(l.drain_progress().len(), 1);

        // The painted cell shows the image, not the placeholder.
        let pixels = l.atlas().page_pixels(0).unwrap();
        assert_eq!(&pixels[0..4], &[9, 9, 9, 255]);
    }

    #[test]
    fn stale_generation_completions_are_ignored() {
        let mut l = loader();
        l.begin(&items(4), &[]).unwrap();
        let mut budget = FrameBudget::unlimited();
        let stale = l.next_requests(&mut budget, 0.0)[0].clone();

        // New item set supersedes the old one mid-load.
        l.begin(&items(4), &[]).unwrap();
        let before = l.atlas().page_pixels(0).unwrap().to_vec();

        l.complete_image(&stale, &solid(8, 8, [1, 2, 3, 255]));

        // No repaint, no progress for the stale set.
        assert_eq!(l.atlas().page_pixels(0).unwrap(), before.as_slice());
        assert_eq!(l.progress().loaded, 0);
    }

    #[test]
    fn cancel_is_cooperative_and_final() {
        let mut l = loader();
        l.begin(&items(8), &[]).unwrap();
        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 0.0);

        l.cancel();
        assert!(l.is_cancelled());
        assert!(l.next_requests(&mut budget, 1.0).is_empty());

        let before = l.atlas().page_pixels(0).unwrap().to_vec();
        l.complete_image(&batch[0], &solid(8, 8, [5, 5, 5, 255]));
        assert_eq!(l.atlas().page_pixels(0).unwrap(), before.as_slice());
    }

    #[test]
    fn per_image_failure_never_aborts_the_batch() {
        let mut l = loader();
        l.begin(&items(4), &[]).unwrap();
        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 0.0);

        l.fail_image(&batch[0], "404");
        l.complete_image(&batch[1], &solid(8, 8, [7, 7, 7, 255]));

        let progress = l.progress();
        assert_eq!(progress.loaded, 1);
        // The failed cell keeps its placeholder color.
        let rect = l.atlas().cell_rect(batch[0].item_index);
        let stride = l.atlas().page_px() as usize * 4;
        let off = rect.y as usize * stride + rect.x as usize * 4;
        let pixels = l.atlas().page_pixels(rect.page).unwrap();
        assert_eq!(
            &pixels[off..off + 4],
            &placeholder_color(batch[0].item_index)
        );
    }

    #[test]
    fn timeouts_expire_in_flight_requests() {
        let mut l = loader();
        l.begin(&items(4), &[]).unwrap();
        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 100.0);
        assert!(!batch.is_empty());

        assert!(l.expire(105.0).is_empty());
        let expired = l.expire(111.0);
        assert_eq!(expired.len(), batch.len());

        // A late completion after expiry is dropped.
        let before = l.atlas().page_pixels(0).unwrap().to_vec();
        l.complete_image(&batch[0], &solid(8, 8, [1, 1, 1, 255]));
        assert_eq!(l.atlas().page_pixels(0).unwrap(), before.as_slice());
    }

    #[test]
    fn full_phase_reads_from_the_same_record() {
        let mut l = loader();
        l.begin(&items(4), &[]).unwrap();
        let mut budget = FrameBudget::unlimited();
        // Drain the thumbnail queue first.
        while !l.next_requests(&mut budget, 0.0).is_empty() {}

        // Item 0 has a high-res URL, item 1 falls back to its thumbnail.
        l.request_full(0);
        l.request_full(1);
        let batch = l.next_requests(&mut budget, 0.0);
        let by_item: Vec<(usize, &str, LoadPhase)> = batch
            .iter()
            .map(|r| (r.item_index, r.url.as_str(), r.phase))
            .collect();
        assert!(by_item.contains(&(0, "https://img.test/0@2x.jpg", LoadPhase::Full)));
        assert!(by_item.contains(&(1, "https://img.test/1.jpg", LoadPhase::Full)));
    }

    #[test]
    fn promote_visible_reorders_pending_work() {
        let mut l = loader();
        l.begin(&items(20), &[]).unwrap();

        l.promote_visible(&[15, 16]);
        let mut budget = FrameBudget::unlimited();
        let batch = l.next_requests(&mut budget, 0.0);
        let front: Vec<usize> = batch.iter().take(2).map(|r| r.item_index).collect();
        assert!(front.contains(&15) && front.contains(&16));
    }

    #[test]
    fn completion_tracking_reaches_is_complete() {
        let mut l = loader();
        l.begin(&items(3), &[]).unwrap();
        assert!(!l.is_complete());

        let mut budget = FrameBudget::unlimited();
        loop {
            let batch = l.next_requests(&mut budget, 0.0);
            if batch.is_empty() {
                break;
            }
            for req in &batch {
                l.complete_image(req, &solid(4, 4, [2, 2, 2, 255]));
            }
        }
        assert!(l.is_complete());
        assert_eq!(l.progress().loaded, 3);
    }

    #[test]
    fn progress_serializes_for_diagnostics() {
        let mut l = loader();
        l.begin(&items(2), &[0]).unwrap();
        let json = serde_json::to_string(&l.progress()).unwrap();
        assert!(json.contains("\"total\":2"));
        assert!(json.contains("\"visible_total\":1"));
    }

    #[test]
    fn requests_carry_the_current_generation() {
        let mut l = loader();
        l.begin(&items(2), &[]).unwrap();
        let g1 = l.generation();
        l.begin(&items(2), &[]).unwrap();
        let g2 = l.generation();
        assert!(g2 > g1);

        let mut budget = FrameBudget::unlimited();
        let batch: Vec<ImageRequest> = l.next_requests(&mut budget, 0.0);
        assert!(batch.iter().all(|r| r.generation == g2));
    }
}
