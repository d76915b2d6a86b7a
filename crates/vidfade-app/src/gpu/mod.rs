pub mod context;
pub mod quad;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use winit::window::Window;

pub use context::GpuContext;
pub use quad::FadeQuad;

use crate::media::image::SharedImage;
use crate::render::Presenter;

/// wgpu presenter. The window stands in for the display, the device and
/// queue for the rendering context.
pub struct WgpuPresenter {
    window: Option<Arc<Window>>,
    gpu: Option<GpuContext>,
    quad: Option<FadeQuad>,
}

impl WgpuPresenter {
    pub fn new(window: Arc<Window>, image: &SharedImage) -> Result<Self> {
        let gpu = GpuContext::new(window.clone())?;
        let quad = FadeQuad::new(&gpu.device, gpu.format, image.width(), image.height());
        Ok(Self {
            window: Some(window),
            gpu: Some(gpu),
            quad: Some(quad),
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if let Some(gpu) = self.gpu.as_mut() {
            gpu.resize(width, height);
        }
    }

    pub fn request_redraw(&self) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    /// Clear to black, optionally draw the quad, and present.
    fn render(&mut self, quad: Option<(f32, &SharedImage)>) -> Result<()> {
        let gpu = self.gpu.as_ref().context("rendering context already released")?;
        let Some(frame) = gpu.acquire_frame()? else {
            return Ok(());
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let draw_quad = match (quad, self.quad.as_mut()) {
            (Some((alpha, image)), Some(fade_quad)) => {
                fade_quad.upload(&gpu.queue, image);
                fade_quad.set_alpha(&gpu.queue, alpha);
                Some(&*fade_quad)
            }
            _ => None,
        };

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vidfade-frame"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("vidfade-quad"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if let Some(fade_quad) = draw_quad {
                fade_quad.draw(&mut pass);
            }
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }
}

impl Presenter for WgpuPresenter {
    fn draw(&mut self, alpha: f32, image: &SharedImage) -> Result<()> {
        self.render(Some((alpha, image)))
    }

    fn clear_and_present(&mut self) -> Result<()> {
        self.render(None)
    }

    fn release_image(&mut self, image: &SharedImage) -> Result<()> {
        if let Some(quad) = self.quad.as_mut() {
            quad.release_texture();
        }
        image.release()?;
        Ok(())
    }

    fn release_surface(&mut self) -> Result<()> {
        self.gpu
            .as_mut()
            .context("rendering context already released")?
            .release_surface()
    }

    fn release_context(&mut self) -> Result<()> {
        self.quad = None;
        self.gpu
            .take()
            .context("rendering context already released")?
            .destroy();
        Ok(())
    }

    fn release_display(&mut self) -> Result<()> {
        self.window
            .take()
            .map(|_| ())
            .context("display already released")
    }
}
