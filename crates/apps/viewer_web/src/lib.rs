//! Browser embedding of the item-sphere renderer.
//!
//! The core (`gpu::SphereRenderer`) is platform-free; this crate supplies
//! the wasm32 surroundings: a wgpu surface on a canvas, DOM input wiring,
//! image fetch + decode, and the requestAnimationFrame loop. On native
//! targets the module compiles to a capability stub so the workspace builds
//! and tests everywhere.

#[cfg(target_arch = "wasm32")]
mod imp {
    use std::cell::RefCell;
    use std::rc::Rc;

    use wasm_bindgen::JsCast;
    use wasm_bindgen::prelude::*;
    use wasm_bindgen_futures::spawn_local;

    use control::arcball::ArrowKey;
    use foundation::math::Vec2;
    use gpu::renderer::{FrameOutput, RendererConfig, SphereRenderer};
    use gpu::shaders::SPHERE_SHADER;
    use scene::items::SphereItem;
    use streaming::atlas::ImagePixels;
    use streaming::cache::TextureHandle;
    use streaming::loader::ImageRequest;

    /// Capability check callers use to pick this renderer or the software
    /// fallback without changing call sites.
    pub fn is_supported() -> bool {
        let Some(window) = web_sys::window() else {
            return false;
        };
        let navigator = window.navigator();
        if js_sys::Reflect::has(navigator.as_ref(), &JsValue::from_str("gpu")).unwrap_or(false) {
            return true;
        }
        // WebGL2 is enough for the wgpu GL backend.
        let Some(document) = window.document() else {
            return false;
        };
        let Ok(element) = document.create_element("canvas") else {
            return false;
        };
        let canvas: web_sys::HtmlCanvasElement = element.unchecked_into();
        matches!(canvas.get_context("webgl2"), Ok(Some(_)))
    }

    pub struct WgpuContext {
        pub _instance: &'static wgpu::Instance,
        pub surface: wgpu::Surface<'static>,
        pub device: wgpu::Device,
        pub queue: wgpu::Queue,
        pub config: wgpu::SurfaceConfiguration,
        pub pipeline: wgpu::RenderPipeline,
        pub uniform_buffer: wgpu::Buffer,
        pub bind_group: wgpu::BindGroup,
        pub vertex_buffer: wgpu::Buffer,
        pub index_buffer: wgpu::Buffer,
        pub index_count: u32,
        pub instance_buffer: wgpu::Buffer,
        pub instance_capacity: u32,
        pub atlas_texture: wgpu::Texture,
        pub atlas_page_px: u32,
    }

    async fn init_wgpu(
        canvas: &web_sys::HtmlCanvasElement,
        renderer: &SphereRenderer,
    ) -> Result<WgpuContext, JsValue> {
        use wgpu::util::DeviceExt;

        let width = canvas.width().max(1);
        let height = canvas.height().max(1);

        // IMPORTANT: `wgpu::Surface` must not outlive its `wgpu::Instance`.
        // To avoid UB, we leak the instance for the lifetime of the app.
        let instance: &'static wgpu::Instance = Box::leak(Box::new(wgpu::Instance::new(
            &wgpu::InstanceDescriptor {
                backends: wgpu::Backends::BROWSER_WEBGPU | wgpu::Backends::GL,
                ..Default::default()
            },
        )));

        let surface = instance
            .create_surface(wgpu::SurfaceTarget::Canvas(canvas.clone()))
            .map_err(|e| JsValue::from_str(&format!("surface error: {e}")))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| JsValue::from_str(&format!("adapter error: {e}")))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("item-sphere-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_webgl2_defaults(),
                ..Default::default()
            })
            .await
            .map_err(|e| JsValue::from_str(&format!("device error: {e}")))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .iter()
            .cloned()
            .find(|f| f.is_srgb())
            .unwrap_or(surface_caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            desired_maximum_frame_latency: 2,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("item-sphere-shader"),
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(SPHERE_SHADER)),
        });

        // Interleaved disc mesh: position (xyz) + uv.
        let disc = renderer.disc();
        let mut vertex_data: Vec<f32> = Vec::with_capacity(disc.mesh.vertex_count() * 5);
        for i in 0..disc.mesh.vertex_count() {
            vertex_data.extend_from_slice(&disc.mesh.positions[i * 3..i * 3 + 3]);
            vertex_data.extend_from_slice(&disc.mesh.uvs[i * 2..i * 2 + 2]);
        }
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("item-sphere-disc-vertices"),
            contents: bytemuck::cast_slice(&vertex_data),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("item-sphere-disc-indices"),
            contents: bytemuck::cast_slice(&disc.mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let instance_capacity = renderer.anchors().len().max(1) as u32;
        let instance_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("item-sphere-instances"),
            size: u64::from(instance_capacity)
                * std::mem::size_of::<gpu::renderer::InstanceRaw>() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("item-sphere-globals"),
            size: std::mem::size_of::<gpu::renderer::Globals>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let atlas_config = renderer.loader().atlas().config();
        let atlas_page_px = renderer.loader().atlas().page_px();
        let atlas_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("item-sphere-atlas"),
            size: wgpu::Extent3d {
                width: atlas_page_px,
                height: atlas_page_px,
                depth_or_array_layers: atlas_config.max_pages.max(1),
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let atlas_view = atlas_texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });
        let atlas_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("item-sphere-atlas-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("item-sphere-bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2Array,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("item-sphere-bg"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&atlas_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&atlas_sampler),
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("item-sphere-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("item-sphere-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: 20,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[
                            wgpu::VertexAttribute {
                                format: wgpu::VertexFormat::Float32x3,
                                offset: 0,
                                shader_location: 0,
                            },
                            wgpu::VertexAttribute {
                                format: wgpu::VertexFormat::Float32x2,
                                offset: 12,
                                shader_location: 1,
                            },
                        ],
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: 16,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: &[
                            wgpu::VertexAttribute {
                                format: wgpu::VertexFormat::Float32x3,
                                offset: 0,
                                shader_location: 2,
                            },
                            wgpu::VertexAttribute {
                                format: wgpu::VertexFormat::Float32,
                                offset: 12,
                                shader_location: 3,
                            },
                        ],
                    },
                ],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: config.format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        Ok(WgpuContext {
            _instance: instance,
            surface,
            device,
            queue,
            config,
            pipeline,
            uniform_buffer,
            bind_group,
            vertex_buffer,
            index_buffer,
            index_count: disc.mesh.indices.len() as u32,
            instance_buffer,
            instance_capacity,
            atlas_texture,
            atlas_page_px,
        })
    }

    impl WgpuContext {
        fn resize(&mut self, width: u32, height: u32) {
            self.config.width = width.max(1);
            self.config.height = height.max(1);
            self.surface.configure(&self.device, &self.config);
        }

        fn upload_page(&self, page: u32, pixels: &[u8]) {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &self.atlas_texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: page,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                pixels,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * self.atlas_page_px),
                    rows_per_image: Some(self.atlas_page_px),
                },
                wgpu::Extent3d {
                    width: self.atlas_page_px,
                    height: self.atlas_page_px,
                    depth_or_array_layers: 1,
                },
            );
        }

        fn render(&self, out: &FrameOutput) -> Result<(), JsValue> {
            self.queue
                .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&out.globals));
            let count = (out.instances.len() as u32).min(self.instance_capacity);
            self.queue.write_buffer(
                &self.instance_buffer,
                0,
                bytemuck::cast_slice(&out.instances[..count as usize]),
            );

            let frame = self
                .surface
                .get_current_texture()
                .map_err(|e| JsValue::from_str(&format!("surface acquire failed: {e}")))?;
            let view = frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("item-sphere-encoder"),
                });
            {
                let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("item-sphere-pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &view,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color {
                                r: 0.004,
                                g: 0.008,
                                b: 0.016,
                                a: 1.0,
                            }),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    occlusion_query_set: None,
                    timestamp_writes: None,
                    multiview_mask: None,
                });

                rpass.set_pipeline(&self.pipeline);
                rpass.set_bind_group(0, &self.bind_group, &[]);
                rpass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                rpass.set_vertex_buffer(1, self.instance_buffer.slice(..));
                rpass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                rpass.draw_indexed(0..self.index_count, 0, 0..count);
            }

            self.queue.submit(std::iter::once(encoder.finish()));
            frame.present();
            Ok(())
        }
    }

    struct AppInner {
        renderer: SphereRenderer,
        ctx: Option<WgpuContext>,
        canvas: web_sys::HtmlCanvasElement,
        last_timestamp_ms: Option<f64>,
        running: bool,
        disposed: bool,
    }

    impl AppInner {
        /// One animation-frame tick. Returns false once the loop must stop.
        fn tick(inner: &Rc<RefCell<AppInner>>, timestamp_ms: f64) -> bool {
            let output = {
                let mut app = inner.borrow_mut();
                if app.disposed || !app.running {
                    return false;
                }
                let dt = match app.last_timestamp_ms {
                    Some(last) => ((timestamp_ms - last) / 1000.0).max(0.0),
                    None => 0.0,
                };
                app.last_timestamp_ms = Some(timestamp_ms);

                match app.renderer.advance(dt) {
                    Ok(output) => output,
                    Err(err) => {
                        // Context loss and disposal stop the loop; the
                        // error was already surfaced via the callback.
                        web_sys::console::warn_1(&JsValue::from_str(&format!(
                            "render loop stopped: {err}"
                        )));
                        app.running = false;
                        return false;
                    }
                }
            };

            {
                let app = inner.borrow();
                if let Some(ctx) = &app.ctx {
                    for page in &output.dirty_pages {
                        if let Some(pixels) = app.renderer.loader().atlas().page_pixels(*page) {
                            ctx.upload_page(*page, pixels);
                        }
                    }
                    if let Err(err) = ctx.render(&output) {
                        web_sys::console::warn_1(&err);
                    }
                }
            }

            // Atlas pages that changed this frame are now resident.
            {
                let mut app = inner.borrow_mut();
                for page in &output.dirty_pages {
                    let bytes = app
                        .renderer
                        .loader()
                        .atlas()
                        .page_pixels(*page)
                        .map(|p| p.len())
                        .unwrap_or(0);
                    let _ = app
                        .renderer
                        .note_page_uploaded(*page, TextureHandle(u64::from(*page)), bytes);
                }
            }

            for request in output.image_requests {
                start_image_fetch(Rc::clone(inner), request);
            }
            true
        }
    }

    /// Fire-and-forget image load via the platform's image element.
    ///
    /// Decoded pixels are read back through a scratch canvas and folded
    /// into the loader; failures and timeouts degrade to the placeholder.
    fn start_image_fetch(inner: Rc<RefCell<AppInner>>, request: ImageRequest) {
        let Some(document) = web_sys::window().and_then(|w| w.document()) else {
            return;
        };
        let Ok(img) = web_sys::HtmlImageElement::new() else {
            return;
        };
        img.set_cross_origin(Some("anonymous"));

        let onload = {
            let inner = Rc::clone(&inner);
            let request = request.clone();
            let img = img.clone();
            Closure::once_into_js(move || {
                let mut app = inner.borrow_mut();
                match decode_image_pixels(&document, &img) {
                    Some(pixels) => app.renderer.complete_image(&request, &pixels),
                    None => app.renderer.fail_image(&request, "decode failed"),
                }
            })
        };
        img.set_onload(Some(onload.unchecked_ref()));

        let onerror = {
            let inner = Rc::clone(&inner);
            let request = request.clone();
            Closure::once_into_js(move || {
                inner
                    .borrow_mut()
                    .renderer
                    .fail_image(&request, "network error");
            })
        };
        img.set_onerror(Some(onerror.unchecked_ref()));

        img.set_src(&request.url);
    }

    fn decode_image_pixels(
        document: &web_sys::Document,
        img: &web_sys::HtmlImageElement,
    ) -> Option<ImagePixels> {
        let width = img.natural_width();
        let height = img.natural_height();
        if width == 0 || height == 0 {
            return None;
        }
        let canvas: web_sys::HtmlCanvasElement =
            document.create_element("canvas").ok()?.unchecked_into();
        canvas.set_width(width);
        canvas.set_height(height);
        let context: web_sys::CanvasRenderingContext2d =
            canvas.get_context("2d").ok()??.unchecked_into();
        context
            .draw_image_with_html_image_element(img, 0.0, 0.0)
            .ok()?;
        let data = context
            .get_image_data(0.0, 0.0, f64::from(width), f64::from(height))
            .ok()?;
        ImagePixels::new(width, height, data.data().0)
    }

    fn now_seconds() -> f64 {
        web_sys::window()
            .and_then(|w| w.performance())
            .map(|p| p.now() / 1000.0)
            .unwrap_or(0.0)
    }

    fn pointer_pos(event: &web_sys::PointerEvent) -> Vec2 {
        Vec2::new(f64::from(event.offset_x()), f64::from(event.offset_y()))
    }

    fn arrow_key(event: &web_sys::KeyboardEvent) -> Option<ArrowKey> {
        match event.key().as_str() {
            "ArrowLeft" => Some(ArrowKey::Left),
            "ArrowRight" => Some(ArrowKey::Right),
            "ArrowUp" => Some(ArrowKey::Up),
            "ArrowDown" => Some(ArrowKey::Down),
            _ => None,
        }
    }

    type Listener = (web_sys::EventTarget, &'static str, Closure<dyn FnMut(web_sys::Event)>);

    /// Browser app wrapping the core renderer.
    ///
    /// Active-item and movement changes are re-published as DOM events on
    /// the canvas (`sphere-active-item`, `sphere-movement`) so the page
    /// can consume them without a JS-side callback registry.
    #[wasm_bindgen]
    pub struct SphereApp {
        inner: Rc<RefCell<AppInner>>,
        listeners: Vec<Listener>,
    }

    #[wasm_bindgen]
    pub async fn create_sphere_app(
        canvas_id: String,
        config_json: Option<String>,
    ) -> Result<SphereApp, JsValue> {
        console_error_panic_hook::set_once();

        let window = web_sys::window().ok_or_else(|| JsValue::from_str("window missing"))?;
        let document = window
            .document()
            .ok_or_else(|| JsValue::from_str("document missing"))?;
        let canvas: web_sys::HtmlCanvasElement = document
            .get_element_by_id(&canvas_id)
            .ok_or_else(|| JsValue::from_str("canvas missing"))?
            .dyn_into()?;

        let config: RendererConfig = match config_json {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| JsValue::from_str(&format!("bad config: {e}")))?,
            None => RendererConfig::default(),
        };

        let mut renderer = SphereRenderer::new(config);
        renderer
            .initialize()
            .map_err(|e| JsValue::from_str(&e.to_string()))?;

        {
            let canvas = canvas.clone();
            renderer.set_on_active_item(move |index| {
                dispatch_detail_event(&canvas, "sphere-active-item", index as f64);
            });
        }
        {
            let canvas = canvas.clone();
            renderer.set_on_movement(move |moving| {
                dispatch_detail_event(&canvas, "sphere-movement", if moving { 1.0 } else { 0.0 });
            });
        }
        {
            let canvas = canvas.clone();
            renderer.set_on_error(move |err| {
                web_sys::console::error_1(&JsValue::from_str(&err.to_string()));
                dispatch_detail_event(&canvas, "sphere-error", 0.0);
            });
        }

        let dpr = window.device_pixel_ratio().max(0.5);
        let width = (f64::from(canvas.client_width()).max(1.0) * dpr) as u32;
        let height = (f64::from(canvas.client_height()).max(1.0) * dpr) as u32;
        canvas.set_width(width);
        canvas.set_height(height);
        renderer.resize(f64::from(width), f64::from(height));

        let ctx = init_wgpu(&canvas, &renderer).await?;

        let inner = Rc::new(RefCell::new(AppInner {
            renderer,
            ctx: Some(ctx),
            canvas: canvas.clone(),
            last_timestamp_ms: None,
            running: false,
            disposed: false,
        }));

        let mut app = SphereApp {
            inner,
            listeners: Vec::new(),
        };
        app.attach_event_listeners()?;
        Ok(app)
    }

    fn dispatch_detail_event(canvas: &web_sys::HtmlCanvasElement, name: &str, detail: f64) {
        let init = web_sys::CustomEventInit::new();
        init.set_detail(&JsValue::from_f64(detail));
        if let Ok(event) = web_sys::CustomEvent::new_with_event_init_dict(name, &init) {
            let _ = canvas.dispatch_event(&event);
        }
    }

    #[wasm_bindgen]
    impl SphereApp {
        /// Replaces the item set from a JSON array of item records.
        pub fn set_items_json(&self, items_json: &str) -> Result<(), JsValue> {
            let items: Vec<SphereItem> = serde_json::from_str(items_json)
                .map_err(|e| JsValue::from_str(&format!("bad items: {e}")))?;
            self.inner
                .borrow_mut()
                .renderer
                .update_items(&items)
                .map_err(|e| JsValue::from_str(&e.to_string()))
        }

        /// Fetches an item manifest (JSON array) and installs it.
        pub fn load_items_from_url(&self, url: String) {
            let inner = Rc::clone(&self.inner);
            spawn_local(async move {
                let response = match gloo_net::http::Request::get(&url).send().await {
                    Ok(response) => response,
                    Err(err) => {
                        web_sys::console::error_1(&JsValue::from_str(&format!(
                            "item manifest fetch failed: {err}"
                        )));
                        return;
                    }
                };
                let items: Vec<SphereItem> = match response.json().await {
                    Ok(items) => items,
                    Err(err) => {
                        web_sys::console::error_1(&JsValue::from_str(&format!(
                            "item manifest parse failed: {err}"
                        )));
                        return;
                    }
                };
                if let Err(err) = inner.borrow_mut().renderer.update_items(&items) {
                    web_sys::console::error_1(&JsValue::from_str(&err.to_string()));
                }
            });
        }

        /// Starts the requestAnimationFrame loop.
        pub fn start(&self) {
            {
                let mut app = self.inner.borrow_mut();
                if app.disposed || app.running {
                    return;
                }
                app.running = true;
                app.last_timestamp_ms = None;
            }

            let inner = Rc::clone(&self.inner);
            let handle: Rc<RefCell<Option<Closure<dyn FnMut(f64)>>>> =
                Rc::new(RefCell::new(None));
            let first = Rc::clone(&handle);
            *handle.borrow_mut() = Some(Closure::new(move |timestamp_ms: f64| {
                if AppInner::tick(&inner, timestamp_ms) {
                    request_animation_frame(first.borrow().as_ref().unwrap());
                } else {
                    first.borrow_mut().take();
                }
            }));
            request_animation_frame(handle.borrow().as_ref().unwrap());
        }

        /// Recomputes the backing-store size; call when layout changes.
        pub fn resize(&self) {
            let mut app = self.inner.borrow_mut();
            let Some(window) = web_sys::window() else {
                return;
            };
            let dpr = window.device_pixel_ratio().max(0.5);
            let width = (f64::from(app.canvas.client_width()).max(1.0) * dpr) as u32;
            let height = (f64::from(app.canvas.client_height()).max(1.0) * dpr) as u32;
            app.canvas.set_width(width);
            app.canvas.set_height(height);
            app.renderer.resize(f64::from(width), f64::from(height));
            if let Some(ctx) = &mut app.ctx {
                ctx.resize(width, height);
            }
        }

        /// Stops the loop, removes every DOM listener this app attached,
        /// and tears down the renderer. Mandatory on unmount: keyboard
        /// listeners live on the document and would otherwise leak.
        pub fn dispose(&mut self) {
            {
                let mut app = self.inner.borrow_mut();
                if app.disposed {
                    return;
                }
                app.disposed = true;
                app.running = false;
                app.renderer.dispose();
                app.ctx = None;
            }
            for (target, name, closure) in self.listeners.drain(..) {
                let _ = target
                    .remove_event_listener_with_callback(name, closure.as_ref().unchecked_ref());
            }
        }
    }

    impl SphereApp {
        fn attach_event_listeners(&mut self) -> Result<(), JsValue> {
            let window = web_sys::window().ok_or_else(|| JsValue::from_str("window missing"))?;
            let document = window
                .document()
                .ok_or_else(|| JsValue::from_str("document missing"))?;
            let canvas_target: web_sys::EventTarget =
                self.inner.borrow().canvas.clone().unchecked_into();
            let document_target: web_sys::EventTarget = document.unchecked_into();

            let listen = |listeners: &mut Vec<Listener>,
                          target: &web_sys::EventTarget,
                          name: &'static str,
                          closure: Closure<dyn FnMut(web_sys::Event)>|
             -> Result<(), JsValue> {
                target.add_event_listener_with_callback(name, closure.as_ref().unchecked_ref())?;
                listeners.push((target.clone(), name, closure));
                Ok(())
            };

            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |event: web_sys::Event| {
                    if let Some(event) = event.dyn_ref::<web_sys::PointerEvent>() {
                        inner
                            .borrow_mut()
                            .renderer
                            .control_mut()
                            .on_pointer_down(pointer_pos(event), now_seconds());
                    }
                });
                listen(&mut self.listeners, &canvas_target, "pointerdown", closure)?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |event: web_sys::Event| {
                    if let Some(event) = event.dyn_ref::<web_sys::PointerEvent>() {
                        inner
                            .borrow_mut()
                            .renderer
                            .control_mut()
                            .on_pointer_move(pointer_pos(event), now_seconds());
                    }
                });
                listen(&mut self.listeners, &canvas_target, "pointermove", closure)?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |_event: web_sys::Event| {
                    inner.borrow_mut().renderer.control_mut().on_pointer_up();
                });
                listen(&mut self.listeners, &canvas_target, "pointerup", closure)?;
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |_event: web_sys::Event| {
                    inner.borrow_mut().renderer.control_mut().on_pointer_up();
                });
                listen(&mut self.listeners, &canvas_target, "pointercancel", closure)?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |event: web_sys::Event| {
                    if let Some(event) = event.dyn_ref::<web_sys::WheelEvent>() {
                        event.prevent_default();
                        inner
                            .borrow_mut()
                            .renderer
                            .control_mut()
                            .on_wheel(event.delta_y());
                    }
                });
                listen(&mut self.listeners, &canvas_target, "wheel", closure)?;
            }
            {
                let closure = Closure::new(move |event: web_sys::Event| {
                    event.prevent_default();
                });
                listen(&mut self.listeners, &canvas_target, "contextmenu", closure)?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |event: web_sys::Event| {
                    if let Some(event) = event.dyn_ref::<web_sys::KeyboardEvent>()
                        && let Some(key) = arrow_key(event)
                    {
                        inner.borrow_mut().renderer.control_mut().on_key_down(key);
                    }
                });
                listen(&mut self.listeners, &document_target, "keydown", closure)?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |event: web_sys::Event| {
                    if let Some(event) = event.dyn_ref::<web_sys::KeyboardEvent>()
                        && let Some(key) = arrow_key(event)
                    {
                        inner.borrow_mut().renderer.control_mut().on_key_up(key);
                    }
                });
                listen(&mut self.listeners, &document_target, "keyup", closure)?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |event: web_sys::Event| {
                    event.prevent_default();
                    inner.borrow_mut().renderer.context_lost();
                });
                listen(
                    &mut self.listeners,
                    &canvas_target,
                    "webglcontextlost",
                    closure,
                )?;
            }
            {
                let inner = Rc::clone(&self.inner);
                let closure = Closure::new(move |_event: web_sys::Event| {
                    let mut app = inner.borrow_mut();
                    if let Err(err) = app.renderer.context_restored() {
                        web_sys::console::error_1(&JsValue::from_str(&err.to_string()));
                    } else {
                        app.running = false; // restart via start()
                    }
                });
                listen(
                    &mut self.listeners,
                    &canvas_target,
                    "webglcontextrestored",
                    closure,
                )?;
            }

            Ok(())
        }
    }

    fn request_animation_frame(closure: &Closure<dyn FnMut(f64)>) {
        if let Some(window) = web_sys::window() {
            let _ = window.request_animation_frame(closure.as_ref().unchecked_ref());
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod imp {
    /// The browser embedding only exists on wasm32; native callers should
    /// use `gpu::SoftwareSphereRenderer` (or a native surface of their
    /// own) behind the same `SphereView` contract.
    pub fn is_supported() -> bool {
        false
    }
}

pub use imp::is_supported;

#[cfg(target_arch = "wasm32")]
pub use imp::{SphereApp, create_sphere_app};

#[cfg(test)]
mod tests {
    use gpu::renderer::RendererConfig;

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn browser_embedding_is_unsupported_off_wasm() {
        assert!(!super::is_supported());
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let config = RendererConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: RendererConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
