//! `wgpu` backend: one headless device per slot rendering into an offscreen
//! texture. Enabled with the `wgpu` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use wgpu::util::DeviceExt;

use crate::backend::{RenderBackend, EFFECT_PROGRAMS};
use crate::error::BackendError;
use crate::types::{SlotId, SurfaceParams};

const SURFACE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const NOISE_SIZE: u32 = 64;
const ROW_ALIGN: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

const EFFECT_SHADER: &str = r#"
struct EffectUniforms {
    pointer: vec2<f32>,
    time: f32,
    intensity: f32,
};

@group(0) @binding(0) var<uniform> u: EffectUniforms;
@group(0) @binding(1) var noise_tex: texture_2d<f32>;
@group(0) @binding(2) var noise_sampler: sampler;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) position: vec2<f32>) -> VsOut {
    var out: VsOut;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.uv = position * 0.5 + vec2<f32>(0.5, 0.5);
    return out;
}

fn noise(uv: vec2<f32>) -> f32 {
    return textureSample(noise_tex, noise_sampler, uv).r;
}

@fragment
fn fs_tilt(in: VsOut) -> @location(0) vec4<f32> {
    let shade = 0.5 + 0.5 * dot(in.uv - 0.5, u.pointer - 0.5);
    return vec4<f32>(vec3<f32>(shade), 1.0);
}

@fragment
fn fs_holographic(in: VsOut) -> @location(0) vec4<f32> {
    let phase = in.uv.x * 6.0 + in.uv.y * 4.0 + u.time + u.pointer.x * 3.0;
    let rainbow = 0.5 + 0.5 * cos(vec3<f32>(phase, phase + 2.094, phase + 4.188));
    return vec4<f32>(rainbow, 0.6 * u.intensity);
}

@fragment
fn fs_foil(in: VsOut) -> @location(0) vec4<f32> {
    let sparkle = step(0.92, noise(in.uv * 4.0 + u.pointer));
    return vec4<f32>(vec3<f32>(sparkle), sparkle * u.intensity);
}

@fragment
fn fs_parallax(in: VsOut) -> @location(0) vec4<f32> {
    let offset = (u.pointer - 0.5) * 0.05;
    let depth = noise(in.uv + offset);
    return vec4<f32>(vec3<f32>(depth), 1.0);
}

@fragment
fn fs_composite(in: VsOut) -> @location(0) vec4<f32> {
    let glare = exp(-8.0 * distance(in.uv, u.pointer));
    return vec4<f32>(vec3<f32>(glare), glare * u.intensity);
}
"#;

/// Per-draw parameters shared by every effect program.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct EffectUniforms {
    pub pointer: [f32; 2],
    pub time: f32,
    pub intensity: f32,
}

/// Device, queue and offscreen render target for one slot.
pub struct GpuContext {
    slot: SlotId,
    device: wgpu::Device,
    queue: wgpu::Queue,
    target: wgpu::Texture,
    view: wgpu::TextureView,
    size: (u32, u32),
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

/// Quad, compiled effect pipelines, noise texture and uniform buffer.
pub struct GpuShared {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    pipelines: BTreeMap<&'static str, wgpu::RenderPipeline>,
    _noise: wgpu::Texture,
}

impl GpuShared {
    pub fn has_effect(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }
}

/// Headless GPU backend. Every slot gets its own device so a lost device
/// only invalidates that slot.
#[derive(Debug, Default)]
pub struct GpuBackend {
    power_preference: wgpu::PowerPreference,
}

impl GpuBackend {
    pub fn new(power_preference: wgpu::PowerPreference) -> Self {
        Self { power_preference }
    }

    /// Draws `effect` into the slot's render target.
    pub fn draw_effect(
        &self,
        context: &mut GpuContext,
        shared: &GpuShared,
        effect: &str,
        uniforms: EffectUniforms,
    ) -> Result<(), BackendError> {
        if !self.is_alive(context) {
            return Err(BackendError::ContextLost(context.slot));
        }
        let pipeline = shared.pipelines.get(effect).ok_or_else(|| {
            BackendError::ResourceCreation(format!("no pipeline for effect {effect}"))
        })?;
        context
            .queue
            .write_buffer(&shared.uniforms, 0, bytemuck::bytes_of(&uniforms));

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("card effect encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("card effect pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &context.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &shared.bind_group, &[]);
            render_pass.set_vertex_buffer(0, shared.vertices.slice(..));
            render_pass.set_index_buffer(shared.indices.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..6, 0, 0..1);
        }
        context.queue.submit([encoder.finish()]);
        Ok(())
    }
}

impl RenderBackend for GpuBackend {
    type Context = GpuContext;
    type Shared = GpuShared;
    type Snapshot = RgbaImage;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_context(
        &self,
        slot: SlotId,
        params: &SurfaceParams,
    ) -> Result<Self::Context, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| BackendError::ContextCreation(format!("no GPU adapter: {err}")))?;

        let limits = adapter.limits();
        let max_dimension = limits.max_texture_dimension_2d;
        if params.width == 0
            || params.height == 0
            || params.width > max_dimension
            || params.height > max_dimension
        {
            return Err(BackendError::SurfaceCreation(format!(
                "{} requested {}x{}, GPU max texture dimension is {max_dimension}",
                params.label, params.width, params.height
            )));
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("cardwall slot device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(limits),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| BackendError::ContextCreation(err.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::warn!(%slot, ?reason, %message, "GPU device lost");
            flag.store(true, Ordering::Release);
        });

        let (target, view) = create_target(&device, params.width, params.height);
        tracing::debug!(%slot, width = params.width, height = params.height, "created GPU context");
        Ok(GpuContext {
            slot,
            device,
            queue,
            target,
            view,
            size: (params.width, params.height),
            lost,
        })
    }

    fn is_alive(&self, context: &Self::Context) -> bool {
        !context.lost.load(Ordering::Acquire)
    }

    fn build_shared(&self, context: &mut Self::Context) -> Result<Self::Shared, BackendError> {
        let device = &context.device;
        let vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("card quad vertices"),
            contents: bytemuck::cast_slice(&[[-1.0_f32, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]]),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("card quad indices"),
            contents: bytemuck::cast_slice(&[0_u16, 1, 2, 0, 2, 3]),
            usage: wgpu::BufferUsages::INDEX,
        });
        let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("effect uniforms"),
            contents: bytemuck::bytes_of(&EffectUniforms::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let noise = upload_noise(device, &context.queue, context.slot);
        let noise_view = noise.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("noise sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("effect layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
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
                        view_dimension: wgpu::TextureViewDimension::D2,
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
            label: Some("effect bind group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&noise_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("card effects"),
            source: wgpu::ShaderSource::Wgsl(EFFECT_SHADER.into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("effect pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipelines = EFFECT_PROGRAMS
            .into_iter()
            .map(|name| (name, effect_pipeline(device, &pipeline_layout, &module, name)))
            .collect();

        if !self.is_alive(context) {
            return Err(BackendError::ContextLost(context.slot));
        }
        Ok(GpuShared {
            vertices,
            indices,
            uniforms,
            bind_group,
            pipelines,
            _noise: noise,
        })
    }

    fn clear(&self, context: &mut Self::Context) {
        if !self.is_alive(context) {
            return;
        }
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("card clear encoder"),
            });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("card clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &context.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        context.queue.submit([encoder.finish()]);
    }

    fn resize(&self, context: &mut Self::Context, width: u32, height: u32) {
        if width == 0 || height == 0 || context.size == (width, height) {
            return;
        }
        let (target, view) = create_target(&context.device, width, height);
        context.target = target;
        context.view = view;
        context.size = (width, height);
    }

    fn snapshot(&self, context: &mut Self::Context) -> Result<Self::Snapshot, BackendError> {
        if !self.is_alive(context) {
            return Err(BackendError::ContextLost(context.slot));
        }
        let (width, height) = context.size;
        let row_bytes = width * 4;
        let padded_row = row_bytes.div_ceil(ROW_ALIGN) * ROW_ALIGN;
        let readback = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("card readback"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("card readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &context.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        context.queue.submit([encoder.finish()]);

        let slice = readback.slice(..);
        let (sender, receiver) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = context.device.poll(wgpu::PollType::Wait);
        receiver
            .recv()
            .map_err(|err| BackendError::Readback(err.to_string()))?
            .map_err(|err| BackendError::Readback(err.to_string()))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((row_bytes * height) as usize);
        for row in mapped.chunks(padded_row as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes as usize]);
        }
        drop(mapped);
        readback.unmap();

        RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| BackendError::Readback("readback buffer too small".into()))
    }

    fn destroy(&self, context: Self::Context, shared: Option<Self::Shared>) {
        drop(shared);
        context.target.destroy();
        context.device.destroy();
        tracing::debug!(slot = %context.slot, "destroyed GPU context");
    }
}

fn create_target(device: &wgpu::Device, width: u32, height: u32) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("card render target"),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: SURFACE_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn upload_noise(device: &wgpu::Device, queue: &wgpu::Queue, slot: SlotId) -> wgpu::Texture {
    let noise = crate::software::procedural_noise(NOISE_SIZE, slot.0 as u32);
    let extent = wgpu::Extent3d {
        width: NOISE_SIZE,
        height: NOISE_SIZE,
        depth_or_array_layers: 1,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("sparkle noise"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        noise.as_raw(),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(NOISE_SIZE),
            rows_per_image: Some(NOISE_SIZE),
        },
        extent,
    );
    texture
}

fn effect_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    effect: &str,
) -> wgpu::RenderPipeline {
    let entry_point = format!("fs_{effect}");
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(effect),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            buffers: &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 2]>() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &wgpu::vertex_attr_array![0 => Float32x2],
            }],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(&entry_point),
            targets: &[Some(wgpu::ColorTargetState {
                format: SURFACE_FORMAT,
                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}
