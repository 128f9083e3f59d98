pub mod fallback;
pub mod renderer;
pub mod resources;
pub mod shaders;

pub use fallback::*;
pub use renderer::*;
pub use resources::*;
