use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use winit::window::Window;

use crate::error::AppError;
use crate::gpu::WgpuPresenter;
use crate::interrupt::InterruptFlag;
use crate::media::soft::SoftProbe;
use crate::media::{DecodeWorker, SharedImage, SoftFramework};
use crate::playback::{Command, PlaybackControl};
use crate::render::{FrameOutcome, ReleaseReport, RenderLoop};
use crate::settings::PlayerSettings;

/// Everything the window owns: the presenter, the decode worker and the loop
/// that ties them together.
pub struct App {
    render: Option<RenderLoop<WgpuPresenter>>,
    probe: SoftProbe,
}

impl App {
    pub fn new(
        window: Arc<Window>,
        settings: &PlayerSettings,
        source: &Path,
        interrupt: InterruptFlag,
    ) -> Result<Self> {
        let image = SharedImage::new(settings.image_width, settings.image_height);
        let presenter =
            WgpuPresenter::new(window.clone(), &image).map_err(|e| AppError::ResourceInit {
                resource: "display surface",
                reason: format!("{e:#}"),
            })?;
        log::info!(
            "Destination image {}x{} ready",
            image.width(),
            image.height()
        );

        let control = Arc::new(PlaybackControl::new(source, image, Command::Play));
        let framework = SoftFramework::new(settings.soft_decoder.clone());
        let probe = framework.probe();
        let worker = DecodeWorker::spawn(framework, control.clone(), settings.pipeline.clone())?;

        let render = RenderLoop::new(
            presenter,
            control,
            worker,
            interrupt,
            &settings.fade,
            settings.shutdown_poll(),
        );

        Ok(Self {
            render: Some(render),
            probe,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if let Some(render) = self.render.as_mut() {
            render.presenter_mut().resize(width, height);
        }
    }

    /// Draw one frame and queue the next. `Exit` once the interrupt is raised
    /// or after shutdown.
    pub fn frame(&mut self) -> FrameOutcome {
        let Some(render) = self.render.as_mut() else {
            return FrameOutcome::Exit;
        };
        let outcome = render.frame();
        if outcome == FrameOutcome::Continue {
            render.presenter_mut().request_redraw();
        }
        outcome
    }

    /// Stop playback and release everything. Only the first call does work.
    pub fn shutdown(&mut self) -> Option<ReleaseReport> {
        let report = self.render.take()?.shutdown();
        log::info!("Soft decoder totals: {}", self.probe.snapshot());
        Some(report)
    }
}
