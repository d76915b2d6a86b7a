mod app;
mod error;
mod fade;
mod gpu;
mod interrupt;
mod media;
mod playback;
mod render;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use app::App;
use error::AppError;
use interrupt::InterruptFlag;
use render::{FrameOutcome, ReleaseReport};
use settings::PlayerSettings;

struct VidfadeApp {
    app: Option<App>,
    window: Option<Arc<Window>>,
    settings: PlayerSettings,
    source: PathBuf,
    interrupt: InterruptFlag,
    failure: Option<AppError>,
    report: Option<ReleaseReport>,
}

impl VidfadeApp {
    fn new(settings: PlayerSettings, source: PathBuf, interrupt: InterruptFlag) -> Self {
        Self {
            app: None,
            window: None,
            settings,
            source,
            interrupt,
            failure: None,
            report: None,
        }
    }

    /// Stop the worker, release the display, leave the event loop.
    fn finish(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(report) = self.app.as_mut().and_then(App::shutdown) {
            self.report = Some(report);
        }
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: AppError) {
        self.failure = Some(error);
        event_loop.exit();
    }
}

impl ApplicationHandler for VidfadeApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Full screen on the primary display, like the reference player.
        let attrs = WindowAttributes::default()
            .with_title("vidfade")
            .with_fullscreen(Some(Fullscreen::Borderless(None)));
        let window = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(
                    event_loop,
                    AppError::ResourceInit {
                        resource: "window",
                        reason: e.to_string(),
                    },
                );
                return;
            }
        };
        self.window = Some(window.clone());

        match App::new(window.clone(), &self.settings, &self.source, self.interrupt.clone()) {
            Ok(app) => {
                self.app = Some(app);
                window.request_redraw();
            }
            Err(e) => {
                let error = e.downcast::<AppError>().unwrap_or_else(|e| AppError::ResourceInit {
                    resource: "decode worker",
                    reason: format!("{e:#}"),
                });
                self.fail(event_loop, error);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(app) = self.app.as_mut() else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                self.interrupt.raise();
            }
            WindowEvent::Resized(size) => {
                app.resize(size.width, size.height);
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                self.interrupt.raise();
            }
            WindowEvent::RedrawRequested => {
                if app.frame() == FrameOutcome::Exit {
                    self.finish(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        // SIGINT does not produce a window event.
        if self.interrupt.is_raised() && self.app.is_some() {
            self.finish(event_loop);
        }
    }
}

fn run() -> Result<(), AppError> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "vidfade".into());
    let Some(source) = args.next() else {
        return Err(AppError::Usage { program });
    };

    log::info!("Note: ensure sufficient GPU memory is available");
    let settings = PlayerSettings::load();

    let interrupt = InterruptFlag::new();
    interrupt
        .install_sigint()
        .map_err(|e| AppError::ResourceInit {
            resource: "SIGINT handler",
            reason: format!("{e:#}"),
        })?;

    let event_loop = EventLoop::new().map_err(|e| AppError::ResourceInit {
        resource: "event loop",
        reason: e.to_string(),
    })?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut handler = VidfadeApp::new(settings, PathBuf::from(source), interrupt);
    let loop_result = event_loop.run_app(&mut handler);

    // The loop can also end without going through `finish`.
    if let Some(report) = handler.app.as_mut().and_then(App::shutdown) {
        handler.report = Some(report);
    }
    if let Err(e) = loop_result {
        log::error!("Event loop ended with an error: {e}");
    }
    if let Some(error) = handler.failure.take() {
        return Err(error);
    }

    let Some(report) = handler.report else {
        return Ok(());
    };
    if !report.released_everything() {
        log::warn!("Not every display resource was released cleanly");
    }
    match report.worker_exit {
        Some(exit) if !exit.is_success() => Err(AppError::WorkerFailed {
            code: exit.code,
            reason: exit.error.unwrap_or_default(),
        }),
        _ => Ok(()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            if let AppError::Usage { .. } = e {
                eprintln!("{e}");
            } else {
                log::error!("{e}");
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}
