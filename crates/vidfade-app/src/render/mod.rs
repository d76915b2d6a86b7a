//! Main-thread render loop: fade, draw, present, watch for the interrupt, and
//! on the way out stop the decode worker before giving back the display.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::fade::FadeAnimator;
use crate::interrupt::InterruptFlag;
use crate::media::image::SharedImage;
use crate::media::worker::{DecodeWorker, WorkerExit};
use crate::playback::{Command, PlaybackControl, PlaybackState};
use crate::settings::FadeSettings;

/// Output side of the player: draws the textured quad and owns the display
/// resources, which are handed back one at a time during shutdown.
pub trait Presenter {
    /// Draw the image on the quad at `alpha` and present it.
    fn draw(&mut self, alpha: f32, image: &SharedImage) -> anyhow::Result<()>;
    fn clear_and_present(&mut self) -> anyhow::Result<()>;

    fn release_image(&mut self, image: &SharedImage) -> anyhow::Result<()>;
    fn release_surface(&mut self) -> anyhow::Result<()>;
    fn release_context(&mut self) -> anyhow::Result<()>;
    fn release_display(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStep {
    Image,
    Surface,
    Context,
    Display,
}

impl fmt::Display for ReleaseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReleaseStep::Image => "image",
            ReleaseStep::Surface => "surface",
            ReleaseStep::Context => "context",
            ReleaseStep::Display => "display",
        })
    }
}

/// Outcome of [`RenderLoop::shutdown`].
#[derive(Debug)]
pub struct ReleaseReport {
    pub final_state: PlaybackState,
    pub worker_exit: Option<WorkerExit>,
    pub steps: Vec<(ReleaseStep, Result<(), String>)>,
}

impl ReleaseReport {
    pub fn released_everything(&self) -> bool {
        self.steps.iter().all(|(_, r)| r.is_ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Exit,
}

pub struct RenderLoop<P: Presenter> {
    presenter: P,
    control: Arc<PlaybackControl>,
    worker: DecodeWorker,
    interrupt: InterruptFlag,
    fade: FadeAnimator,
    alpha: f32,
    shutdown_poll: Duration,
    frames: u64,
}

impl<P: Presenter> RenderLoop<P> {
    pub fn new(
        presenter: P,
        control: Arc<PlaybackControl>,
        worker: DecodeWorker,
        interrupt: InterruptFlag,
        fade: &FadeSettings,
        shutdown_poll: Duration,
    ) -> Self {
        log::info!("Starting render loop");
        Self {
            presenter,
            control,
            worker,
            interrupt,
            fade: FadeAnimator::new(Instant::now(), fade.start_alpha, fade.target_alpha, fade.rate),
            alpha: fade.start_alpha,
            shutdown_poll,
            frames: 0,
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    /// One iteration: advance the fade, draw, present, then check the
    /// interrupt flag.
    pub fn frame(&mut self) -> FrameOutcome {
        self.fade.advance(Instant::now(), &mut self.alpha);
        if let Err(e) = self.presenter.draw(self.alpha, self.control.image()) {
            log::warn!("Draw failed: {e:#}");
        }
        self.frames += 1;

        if let Some(exit) = self.worker.poll_exit() {
            match &exit.error {
                None => log::info!("Decode worker finished with code {}", exit.code),
                Some(reason) => log::error!(
                    "Decode worker failed with code {} ({reason}); video output has stopped",
                    exit.code
                ),
            }
        }

        if self.interrupt.is_raised() {
            FrameOutcome::Exit
        } else {
            FrameOutcome::Continue
        }
    }

    /// Stop the worker, wait for it however long it takes, then release the
    /// image, surface, context and display in that order. A failed step is
    /// logged and the remaining steps still run.
    pub fn shutdown(mut self) -> ReleaseReport {
        log::info!("Finished render loop after {} frames", self.frames);
        if !self.worker.is_running() {
            log::debug!("Decode worker already stopped");
        }
        self.control.set_command(Command::Terminate);

        let poll = self.shutdown_poll;
        let final_state = self.control.wait_for_exit(poll, |polls| {
            if polls % 20 == 0 {
                log::info!("Waiting for decode worker ({:?})", poll * polls);
            }
        });
        log::info!("Decode worker reached {final_state}");
        let worker_exit = self.worker.join();

        if let Err(e) = self.presenter.clear_and_present() {
            log::warn!("Final clear failed: {e:#}");
        }

        let image = self.control.image().clone();
        let mut steps = Vec::with_capacity(4);
        for step in [
            ReleaseStep::Image,
            ReleaseStep::Surface,
            ReleaseStep::Context,
            ReleaseStep::Display,
        ] {
            let result = match step {
                ReleaseStep::Image => self.presenter.release_image(&image),
                ReleaseStep::Surface => self.presenter.release_surface(),
                ReleaseStep::Context => self.presenter.release_context(),
                ReleaseStep::Display => self.presenter.release_display(),
            };
            match &result {
                Ok(()) => log::info!("Released {step}"),
                Err(e) => log::error!("Releasing {step} failed: {e:#}"),
            }
            steps.push((step, result.map_err(|e| format!("{e:#}"))));
        }

        ReleaseReport {
            final_state,
            worker_exit,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::media::soft::{SoftFramework, annexb_clip};
    use crate::settings::{PipelineSettings, SoftDecoderSettings};

    #[derive(Default)]
    struct RecordingPresenter {
        calls: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        alphas: Vec<f32>,
        fail_surface: bool,
    }

    impl Presenter for RecordingPresenter {
        fn draw(&mut self, alpha: f32, _image: &SharedImage) -> anyhow::Result<()> {
            self.alphas.push(alpha);
            Ok(())
        }

        fn clear_and_present(&mut self) -> anyhow::Result<()> {
            self.calls.lock().push("clear");
            Ok(())
        }

        fn release_image(&mut self, image: &SharedImage) -> anyhow::Result<()> {
            self.calls.lock().push("image");
            image.release()?;
            Ok(())
        }

        fn release_surface(&mut self) -> anyhow::Result<()> {
            self.calls.lock().push("surface");
            if self.fail_surface {
                anyhow::bail!("surface is gone");
            }
            Ok(())
        }

        fn release_context(&mut self) -> anyhow::Result<()> {
            self.calls.lock().push("context");
            Ok(())
        }

        fn release_display(&mut self) -> anyhow::Result<()> {
            self.calls.lock().push("display");
            Ok(())
        }
    }

    fn soft() -> SoftDecoderSettings {
        SoftDecoderSettings {
            frame_rate: 0.0,
            input_buffers: 2,
            input_buffer_size: 32,
        }
    }

    fn quick() -> PipelineSettings {
        PipelineSettings {
            pause_poll_ms: 5,
            port_settings_timeout_ms: 50,
            renderer_tunnel_timeout_ms: 50,
            input_acquire_timeout_ms: 5,
        }
    }

    fn fast_fade() -> FadeSettings {
        FadeSettings {
            start_alpha: 1.0,
            target_alpha: 0.0,
            rate: 50.0,
        }
    }

    fn start(
        path: &std::path::Path,
        presenter: RecordingPresenter,
    ) -> (
        RenderLoop<RecordingPresenter>,
        InterruptFlag,
        Arc<PlaybackControl>,
    ) {
        let control = Arc::new(PlaybackControl::new(
            path,
            SharedImage::new(4, 4),
            Command::Play,
        ));
        let worker =
            DecodeWorker::spawn(SoftFramework::new(soft()), control.clone(), quick()).unwrap();
        let interrupt = InterruptFlag::new();
        let render = RenderLoop::new(
            presenter,
            control.clone(),
            worker,
            interrupt.clone(),
            &fast_fade(),
            Duration::from_millis(5),
        );
        (render, interrupt, control)
    }

    #[test]
    fn runs_until_interrupted_then_releases_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&annexb_clip(8)).unwrap();
        file.flush().unwrap();
        let presenter = RecordingPresenter::default();
        let calls = presenter.calls.clone();
        let (mut render, interrupt, control) = start(file.path(), presenter);

        for _ in 0..5 {
            assert_eq!(render.frame(), FrameOutcome::Continue);
            std::thread::sleep(Duration::from_millis(10));
        }
        interrupt.raise();
        assert_eq!(render.frame(), FrameOutcome::Exit);
        assert_eq!(render.alpha(), 0.0);
        let alphas = render.presenter_mut().alphas.clone();
        assert!(alphas.windows(2).all(|w| w[1] <= w[0]));

        let report = render.shutdown();
        assert_eq!(report.final_state, PlaybackState::Terminated);
        assert_eq!(control.command(), Command::Terminate);
        assert!(report.worker_exit.as_ref().unwrap().is_success());
        assert!(report.released_everything());
        assert!(control.image().is_released());
        assert_eq!(
            *calls.lock(),
            vec!["clear", "image", "surface", "context", "display"]
        );
    }

    #[test]
    fn failed_release_step_does_not_stop_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&annexb_clip(4)).unwrap();
        file.flush().unwrap();
        let presenter = RecordingPresenter {
            fail_surface: true,
            ..Default::default()
        };
        let (mut render, interrupt, _control) = start(file.path(), presenter);
        interrupt.raise();
        assert_eq!(render.frame(), FrameOutcome::Exit);

        let report = render.shutdown();
        let order: Vec<ReleaseStep> = report.steps.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            order,
            vec![
                ReleaseStep::Image,
                ReleaseStep::Surface,
                ReleaseStep::Context,
                ReleaseStep::Display
            ]
        );
        assert!(!report.released_everything());
        assert!(report.steps[1].1.is_err());
        assert!(report.steps[3].1.is_ok());
    }

    #[test]
    fn worker_failure_still_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (mut render, interrupt, _control) =
            start(&dir.path().join("absent.h264"), RecordingPresenter::default());

        let deadline = Instant::now() + Duration::from_secs(5);
        while render.worker.is_running() {
            assert!(Instant::now() < deadline);
            assert_eq!(render.frame(), FrameOutcome::Continue);
        }
        interrupt.raise();
        render.frame();

        let report = render.shutdown();
        assert_eq!(report.final_state, PlaybackState::Failed);
        assert_eq!(report.worker_exit.as_ref().unwrap().code, -2);
        assert!(report.released_everything());
    }
}
