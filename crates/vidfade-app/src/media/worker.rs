use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, bounded};

use crate::media::framework::MediaFramework;
use crate::media::pipeline::{self, SessionSummary};
use crate::playback::{PlaybackControl, PlaybackState};
use crate::settings::PipelineSettings;

/// Exit code reported when the decode thread panicked.
pub const PANIC_CODE: i32 = -100;

/// Final report sent by the decode thread as it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// 0 on a clean stop, the negative pipeline status code otherwise.
    pub code: i32,
    pub summary: Option<SessionSummary>,
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Owns the decode thread for one playback session.
pub struct DecodeWorker {
    exit_rx: Receiver<WorkerExit>,
    exit: Option<WorkerExit>,
    thread: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    /// Start decoding `control.source_path()` on a dedicated thread. The
    /// worker always publishes a terminal state before it exits.
    pub fn spawn<F>(
        mut framework: F,
        control: Arc<PlaybackControl>,
        settings: PipelineSettings,
    ) -> anyhow::Result<Self>
    where
        F: MediaFramework + 'static,
    {
        let (exit_tx, exit_rx) = bounded(1);

        let thread = thread::Builder::new()
            .name("vidfade-decode".into())
            .spawn(move || {
                control.publish_state(PlaybackState::Stopped);
                log::info!("Decode worker started for {}", control.source_path().display());

                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    pipeline::decode(&mut framework, &control, &settings)
                }));
                let exit = match outcome {
                    Ok(Ok(summary)) => {
                        control.publish_state(PlaybackState::Terminated);
                        WorkerExit {
                            code: 0,
                            summary: Some(summary),
                            error: None,
                        }
                    }
                    Ok(Err(e)) => {
                        log::error!("Decode failed ({:?}, code {}): {e}", e.kind(), e.code());
                        control.publish_state(PlaybackState::Failed);
                        WorkerExit {
                            code: e.code(),
                            summary: None,
                            error: Some(e.to_string()),
                        }
                    }
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".into()
                        };
                        log::error!("Decode thread panicked: {msg}");
                        control.publish_state(PlaybackState::Failed);
                        WorkerExit {
                            code: PANIC_CODE,
                            summary: None,
                            error: Some(msg),
                        }
                    }
                };
                log::info!("Decode worker terminating with code {}", exit.code);
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn decode thread: {e}"))?;

        Ok(Self {
            exit_rx,
            exit: None,
            thread: Some(thread),
        })
    }

    /// Non-blocking check for the exit report. Returns it only once.
    pub fn poll_exit(&mut self) -> Option<&WorkerExit> {
        if self.exit.is_some() {
            return None;
        }
        self.exit = self.exit_rx.try_recv().ok();
        self.exit.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the thread to finish and hand back its exit report.
    pub fn join(&mut self) -> Option<WorkerExit> {
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            log::error!("Decode thread could not be joined");
        }
        self.exit.take().or_else(|| self.exit_rx.try_recv().ok())
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            log::warn!("Decode worker dropped without join");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{Duration, Instant};

    use crate::media::image::SharedImage;
    use crate::media::pipeline::StopReason;
    use crate::media::soft::{SoftFaults, SoftFramework, annexb_clip};
    use crate::playback::Command;
    use crate::settings::SoftDecoderSettings;

    fn soft() -> SoftDecoderSettings {
        SoftDecoderSettings {
            frame_rate: 240.0,
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

    fn clip() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&annexb_clip(8)).unwrap();
        file.flush().unwrap();
        file
    }

    fn control(path: &std::path::Path, initial: Command) -> Arc<PlaybackControl> {
        Arc::new(PlaybackControl::new(path, SharedImage::new(4, 4), initial))
    }

    fn start(ctl: &Arc<PlaybackControl>) -> DecodeWorker {
        DecodeWorker::spawn(SoftFramework::new(soft()), ctl.clone(), quick()).unwrap()
    }

    #[test]
    fn terminate_right_after_play_always_ends_terminated() {
        let file = clip();
        let ctl = control(file.path(), Command::Play);
        let mut worker = start(&ctl);
        ctl.set_command(Command::Terminate);

        let state = ctl.wait_for_exit(Duration::from_millis(5), |_| {});
        assert_eq!(state, PlaybackState::Terminated);
        let exit = worker.join().unwrap();
        assert!(exit.is_success());
        // Whether a buffer made it in before the command landed is a race.
        let summary = exit.summary.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Terminated);
    }

    #[test]
    fn terminate_during_pause_is_prompt() {
        let file = clip();
        let ctl = control(file.path(), Command::Pause);
        let mut worker = start(&ctl);

        let deadline = Instant::now() + Duration::from_secs(5);
        while ctl.state() != PlaybackState::Paused {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.is_running());

        let started = Instant::now();
        ctl.set_command(Command::Terminate);
        assert_eq!(
            ctl.wait_for_exit(Duration::from_millis(5), |_| {}),
            PlaybackState::Terminated
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(worker.join().unwrap().is_success());
    }

    #[test]
    fn failure_is_published_and_reported_once() {
        let file = clip();
        let ctl = control(file.path(), Command::Play);
        let framework = SoftFramework::with_faults(
            soft(),
            SoftFaults {
                fail_create: Some(crate::media::framework::StageKind::Clock),
                ..Default::default()
            },
        );
        let mut worker = DecodeWorker::spawn(framework, ctl.clone(), quick()).unwrap();

        assert_eq!(
            ctl.wait_for_exit(Duration::from_millis(5), |_| {}),
            PlaybackState::Failed
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        let code = loop {
            if let Some(exit) = worker.poll_exit() {
                break exit.code;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(code, -18);
        assert!(worker.poll_exit().is_none());

        let exit = worker.join().unwrap();
        assert_eq!(exit.code, -18);
        assert!(exit.error.unwrap().contains("clock"));
    }

    #[test]
    fn devamp_runs_to_a_clean_stop() {
        let file = clip();
        let ctl = control(file.path(), Command::Devamp);
        let mut worker = start(&ctl);

        assert_eq!(
            ctl.wait_for_exit(Duration::from_millis(5), |_| {}),
            PlaybackState::Terminated
        );
        let summary = worker.join().unwrap().summary.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Stopped);
        assert_eq!(ctl.command(), Command::Stop);
        assert!(ctl.image().generation() > 0);
    }
}
