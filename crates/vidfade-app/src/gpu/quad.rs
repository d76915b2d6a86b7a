use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use wgpu::util::DeviceExt;
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindingResource, BindingType, BlendComponent, BlendFactor,
    BlendOperation, BlendState, Buffer, BufferBindingType, ColorTargetState, Device,
    FragmentState, PipelineCompilationOptions, PipelineLayoutDescriptor, PrimitiveState,
    PrimitiveTopology, Queue, RenderPass, RenderPipeline, SamplerBindingType, ShaderStages,
    TextureFormat, TextureSampleType, TextureViewDimension, VertexState,
};

use crate::media::image::SharedImage;

/// Half extent of the quad in model units.
const EXTENT: f32 = 10.0;
const NEAR: f32 = 40.0;
const FAR: f32 = 60.0;
/// Camera pull-back; puts the quad halfway between the clip planes.
const DEPTH: f32 = -50.0;

const QUAD_SHADER: &str = r#"
struct QuadUniforms {
    mvp: mat4x4f,
}

@group(0) @binding(0) var<uniform> uniforms: QuadUniforms;
@group(0) @binding(1) var frame_tex: texture_2d<f32>;
@group(0) @binding(2) var frame_sampler: sampler;

struct VertexInput {
    @location(0) position: vec3f,
    @location(1) uv: vec2f,
    @location(2) color: vec4f,
}

struct VertexOutput {
    @builtin(position) position: vec4f,
    @location(0) uv: vec2f,
    @location(1) color: vec4f,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.position = uniforms.mvp * vec4f(in.position, 1.0);
    out.uv = in.uv;
    out.color = in.color;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4f {
    return textureSample(frame_tex, frame_sampler, in.uv) * in.color;
}
"#;

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct QuadVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

/// Triangle-strip corners with the fade alpha baked into every vertex colour.
pub fn quad_vertices(alpha: f32) -> [QuadVertex; 4] {
    let color = [1.0, 1.0, 1.0, alpha];
    let corner = |x: f32, y: f32, u: f32, v: f32| QuadVertex {
        position: [x * EXTENT, y * EXTENT, 0.0],
        uv: [u, v],
        color,
    };
    [
        corner(-1.0, -1.0, 0.0, 1.0),
        corner(1.0, -1.0, 1.0, 1.0),
        corner(-1.0, 1.0, 0.0, 0.0),
        corner(1.0, 1.0, 1.0, 0.0),
    ]
}

/// Orthographic view of the quad pulled back between the clip planes.
pub fn model_view_projection() -> Mat4 {
    Mat4::orthographic_rh(-EXTENT, EXTENT, -EXTENT, EXTENT, NEAR, FAR)
        * Mat4::from_translation(Vec3::new(0.0, 0.0, DEPTH))
}

/// The fading textured quad: a vertex buffer rewritten when alpha changes and
/// a texture refreshed from the destination image when a new frame lands.
pub struct FadeQuad {
    pipeline: RenderPipeline,
    bind_group: BindGroup,
    vertices: Buffer,
    texture: Option<wgpu::Texture>,
    image_size: (u32, u32),
    uploaded_generation: u64,
    alpha: Option<f32>,
}

impl FadeQuad {
    pub fn new(device: &Device, target_format: TextureFormat, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vidfade-frame"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("vidfade-frame-sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        let mvp = model_view_projection().to_cols_array_2d();
        let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("vidfade-quad-uniforms"),
            contents: bytemuck::bytes_of(&mvp),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("vidfade-quad-vertices"),
            contents: bytemuck::cast_slice(&quad_vertices(1.0)),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        });

        // Bind group layout: uniform(0), texture(1), sampler(2)
        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("vidfade-quad-bgl"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::VERTEX,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: std::num::NonZeroU64::new(
                            std::mem::size_of::<[[f32; 4]; 4]>() as u64,
                        ),
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("vidfade-quad-bg"),
            layout: &bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::TextureView(&view),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: BindingResource::Sampler(&sampler),
                },
            ],
        });

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("vidfade-quad"),
            source: wgpu::ShaderSource::Wgsl(QUAD_SHADER.into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("vidfade-quad-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let over = BlendComponent {
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOperation::Add,
        };
        let vertex_attributes =
            wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x2, 2 => Float32x4];
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("vidfade-quad-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader_module,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<QuadVertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &vertex_attributes,
                }],
                compilation_options: PipelineCompilationOptions::default(),
            },
            fragment: Some(FragmentState {
                module: &shader_module,
                entry_point: Some("fs_main"),
                targets: &[Some(ColorTargetState {
                    format: target_format,
                    blend: Some(BlendState {
                        color: over,
                        alpha: over,
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: PipelineCompilationOptions::default(),
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleStrip,
                ..PrimitiveState::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        log::info!("Fade quad ready with {width}x{height} frame texture");

        Self {
            pipeline,
            bind_group,
            vertices,
            texture: Some(texture),
            image_size: (width, height),
            uploaded_generation: 0,
            alpha: None,
        }
    }

    pub fn set_alpha(&mut self, queue: &Queue, alpha: f32) {
        if self.alpha == Some(alpha) {
            return;
        }
        queue.write_buffer(&self.vertices, 0, bytemuck::cast_slice(&quad_vertices(alpha)));
        self.alpha = Some(alpha);
    }

    /// Copy the image's latest frame into the texture if it moved on since
    /// the last upload.
    pub fn upload(&mut self, queue: &Queue, image: &SharedImage) {
        let Some(texture) = &self.texture else {
            return;
        };
        let (width, height) = self.image_size;
        if (image.width(), image.height()) != (width, height) {
            return;
        }
        let expected = (image.bytes_per_row() * height) as usize;
        let uploaded = image.read_if_newer(self.uploaded_generation, |pixels| {
            if pixels.len() != expected {
                return;
            }
            queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                pixels,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(image.bytes_per_row()),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        });
        if let Some(generation) = uploaded {
            self.uploaded_generation = generation;
        }
    }

    pub fn draw(&self, pass: &mut RenderPass<'_>) {
        if self.texture.is_none() {
            return;
        }
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.set_vertex_buffer(0, self.vertices.slice(..));
        pass.draw(0..4, 0..1);
    }

    /// Drop the frame texture. Returns false if it was already gone.
    pub fn release_texture(&mut self) -> bool {
        self.texture.take().is_some()
    }
}
