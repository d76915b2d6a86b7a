use anyhow::{Context as _, Result, bail};
use std::sync::Arc;
use wgpu::{
    Device, DeviceDescriptor, ExperimentalFeatures, Instance, InstanceDescriptor, MemoryHints,
    PowerPreference, Queue, RequestAdapterOptions, Surface, SurfaceConfiguration, SurfaceError,
    SurfaceTexture, TextureFormat, TextureUsages, Trace,
};
use winit::window::Window;

/// Device, queue and the window surface they present to. The surface can be
/// dropped ahead of the device.
pub struct GpuContext {
    pub device: Device,
    pub queue: Queue,
    surface: Option<Surface<'static>>,
    surface_config: SurfaceConfiguration,
    pub format: TextureFormat,
}

impl GpuContext {
    pub fn new(window: Arc<Window>) -> Result<Self> {
        let instance = Instance::new(&InstanceDescriptor::default());

        let surface = instance.create_surface(window.clone())?;

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&DeviceDescriptor {
            label: Some("vidfade-device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: MemoryHints::Performance,
            trace: Trace::Off,
        }))?;

        let size = window.inner_size();
        let capabilities = surface.get_capabilities(&adapter);
        let format = capabilities
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| capabilities.formats.first())
            .copied()
            .context("surface reports no texture formats")?;
        let alpha_mode = capabilities
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            desired_maximum_frame_latency: 2,
            alpha_mode,
            view_formats: vec![],
        };
        surface.configure(&device, &surface_config);

        log::info!(
            "GPU initialized: {} ({:?}), surface {}x{}",
            adapter.get_info().name,
            adapter.get_info().backend,
            surface_config.width,
            surface_config.height
        );

        Ok(Self {
            device,
            queue,
            surface: Some(surface),
            surface_config,
            format,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.reconfigure();
        }
    }

    fn reconfigure(&self) {
        if let Some(surface) = &self.surface {
            surface.configure(&self.device, &self.surface_config);
        }
    }

    /// Next swapchain texture. `None` when the surface had to be
    /// reconfigured and this frame should be skipped.
    pub fn acquire_frame(&self) -> Result<Option<SurfaceTexture>> {
        let Some(surface) = &self.surface else {
            bail!("surface already released");
        };
        match surface.get_current_texture() {
            Ok(frame) => Ok(Some(frame)),
            Err(SurfaceError::Lost | SurfaceError::Outdated) => {
                log::debug!("Surface lost or outdated, reconfiguring");
                self.reconfigure();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the window surface ahead of the device.
    pub fn release_surface(&mut self) -> Result<()> {
        if self.surface.take().is_none() {
            bail!("surface already released");
        }
        Ok(())
    }

    /// Tear down the device. Anything still built on it becomes invalid.
    pub fn destroy(self) {
        if self.surface.is_some() {
            log::warn!("Destroying the GPU device before its surface");
        }
        self.device.destroy();
    }
}
