//! WGSL sources for the instanced item-sphere pipeline.
//!
//! Uniform and vertex layouts must stay byte-compatible with the
//! `Globals` and `InstanceRaw` structs in `renderer.rs`.

/// Instanced disc shader.
///
/// Vertex stage: orients each disc tangent to the sphere at its anchor,
/// applies the motion-blur stretch along `cross(radial, rotation_axis)`
/// (magnitude saturated with a cubic), and re-projects the displaced vertex
/// back onto the sphere shell so blur never lifts geometry off the sphere.
/// Far-side instances fade out via a smoothstep on the world-space z of the
/// normalized anchor direction instead of being hard-clipped.
///
/// Fragment stage: resolves the atlas page and grid cell from the
/// per-instance item slot (`cell = slot % cells_per_page`,
/// `cellX = cell % cellsPerRow`, `cellY = cell / cellsPerRow`) and samples
/// the `texture_2d_array` of pages. Aspect handling happens at paint time
/// (cover-fit into square cells), so cell UVs sample 1:1. Atlas capacity is
/// bounded by `max_pages`; the CPU side rejects item sets beyond it, so the
/// shader never sees an out-of-range page index.
pub const SPHERE_SHADER: &str = r#"
struct Globals {
    world: mat4x4<f32>,
    view_proj: mat4x4<f32>,
    rotation_axis: vec3<f32>,
    blur_strength: f32,
    sphere_radius: f32,
    cells_per_row: f32,
    cells_per_page: f32,
    _pad: f32,
};

@group(0) @binding(0)
var<uniform> globals: Globals;

@group(0) @binding(1)
var atlas_pages: texture_2d_array<f32>;

@group(0) @binding(2)
var atlas_sampler: sampler;

struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) alpha: f32,
    @location(2) item_slot: f32,
};

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) anchor: vec3<f32>,
    @location(3) item_slot: f32,
) -> VsOut {
    let radial = normalize(anchor);

    // Tangent frame at the anchor; fall back when radial ~ +Y.
    var t = cross(vec3<f32>(0.0, 1.0, 0.0), radial);
    if (dot(t, t) < 1e-6) {
        t = cross(vec3<f32>(1.0, 0.0, 0.0), radial);
    }
    t = normalize(t);
    let b = cross(radial, t);

    var local = anchor + t * position.x + b * position.y;

    // Motion-blur stretch, saturated with a cubic, re-projected onto the
    // sphere shell.
    let s = clamp(globals.blur_strength, 0.0, 1.0);
    let sat = s * s * (3.0 - 2.0 * s);
    let blur_dir = cross(radial, globals.rotation_axis);
    local = local + blur_dir * (sat * 0.35 * position.x);
    local = normalize(local) * length(anchor + t * position.x + b * position.y);

    let world_pos = (globals.world * vec4<f32>(local, 1.0)).xyz;

    // Far-side fade on the rotated anchor direction.
    let world_dir = normalize((globals.world * vec4<f32>(radial, 0.0)).xyz);
    let fade = smoothstep(-0.35, 0.45, world_dir.z);
    var alpha = mix(0.12, 1.0, fade);
    if (item_slot < 0.0) {
        alpha = 0.0;
    }

    return VsOut(
        globals.view_proj * vec4<f32>(world_pos, 1.0),
        uv,
        alpha,
        item_slot,
    );
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    if (in.alpha <= 0.001) {
        discard;
    }

    let slot = u32(max(in.item_slot, 0.0));
    let per_page = u32(globals.cells_per_page);
    let per_row = u32(globals.cells_per_row);
    let page = slot / per_page;
    let cell = slot % per_page;
    let cell_x = cell % per_row;
    let cell_y = cell / per_row;

    let inv_row = 1.0 / globals.cells_per_row;
    let cell_uv = (vec2<f32>(f32(cell_x), f32(cell_y)) + in.uv) * inv_row;

    let texel = textureSample(atlas_pages, atlas_sampler, cell_uv, i32(page));
    return vec4<f32>(texel.rgb, texel.a * in.alpha);
}
"#;

#[cfg(test)]
mod tests {
    use super::SPHERE_SHADER;

    #[test]
    fn shader_declares_both_entry_points() {
        assert!(SPHERE_SHADER.contains("fn vs_main"));
        assert!(SPHERE_SHADER.contains("fn fs_main"));
    }

    #[test]
    fn shader_uniform_block_matches_the_globals_layout() {
        // Field order is load-bearing: it must match `Globals` in
        // renderer.rs byte for byte.
        let world = SPHERE_SHADER.find("world: mat4x4<f32>").unwrap();
        let view_proj = SPHERE_SHADER.find("view_proj: mat4x4<f32>").unwrap();
        let axis = SPHERE_SHADER.find("rotation_axis: vec3<f32>").unwrap();
        let blur = SPHERE_SHADER.find("blur_strength: f32").unwrap();
        assert!(world < view_proj && view_proj < axis && axis < blur);
    }

    #[test]
    fn atlas_lookup_uses_a_texture_array() {
        assert!(SPHERE_SHADER.contains("texture_2d_array<f32>"));
    }
}
