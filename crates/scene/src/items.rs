use serde::{Deserialize, Serialize};

/// Caller-supplied record for one sphere tile.
///
/// Owned by the caller and replaced wholesale on every `update_items`; the
/// renderer never mutates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SphereItem {
    pub id: u64,
    pub image: String,
    #[serde(default)]
    pub image_high_res: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
}

impl SphereItem {
    /// URL for the full-resolution phase.
    ///
    /// Falls back to the thumbnail URL so both loading phases always read
    /// from the same record; the atlas and the high-res upgrade can never
    /// show two different assets for one item.
    pub fn full_res_url(&self) -> &str {
        self.image_high_res.as_deref().unwrap_or(&self.image)
    }
}

/// Maps an instance slot to the item it currently displays.
///
/// Identity while `item_count <= instance_count` (surplus instances are
/// hidden); above the budget, the rolling `rotation_offset` cycles items
/// through the fixed instance set.
pub fn item_for_instance(
    instance: usize,
    instance_count: usize,
    item_count: usize,
    rotation_offset: usize,
) -> Option<usize> {
    if item_count == 0 || instance >= instance_count {
        return None;
    }
    if item_count <= instance_count {
        (instance < item_count).then_some(instance)
    } else {
        Some((instance + rotation_offset) % item_count)
    }
}

/// Rolling temporal-cycling offset.
///
/// Advances proportionally to rotation velocity so sustained rotation keeps
/// cycling new items into the fixed instance set. The proportionality
/// constant (`cycle_rate`, offset steps per radian of rotation) is a UX
/// tuning knob, not a derived quantity.
#[derive(Debug, Clone, Copy, Default)]
pub struct CyclingOffset {
    accum: f64,
}

impl CyclingOffset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, velocity_rad_s: f64, dt_s: f64, cycle_rate: f64, item_count: usize) {
        if item_count == 0 {
            self.accum = 0.0;
            return;
        }
        let step = velocity_rad_s.abs() * dt_s.max(0.0) * cycle_rate;
        self.accum = (self.accum + step).rem_euclid(item_count as f64);
    }

    pub fn offset(&self) -> usize {
        self.accum as usize
    }

    pub fn reset(&mut self) {
        self.accum = 0.0;
    }
}
