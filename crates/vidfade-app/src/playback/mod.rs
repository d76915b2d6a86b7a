pub mod types;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::media::image::SharedImage;
pub use types::{Command, PlaybackState};

/// Command/state handshake shared by the controller and the decode worker.
///
/// `source_path` and `image` are fixed at construction, before the worker can
/// see the block. `command` is written by the controller, `state` by the
/// worker. Both are atomics so neither side can observe a torn value; the
/// condvar only shortens the wait of whoever is blocked on the other side.
pub struct PlaybackControl {
    source_path: PathBuf,
    image: SharedImage,
    command: AtomicU8,
    state: AtomicU8,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl PlaybackControl {
    pub fn new(source_path: impl Into<PathBuf>, image: SharedImage, initial: Command) -> Self {
        Self {
            source_path: source_path.into(),
            image,
            command: AtomicU8::new(initial as u8),
            state: AtomicU8::new(PlaybackState::Stopped as u8),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn image(&self) -> &SharedImage {
        &self.image
    }

    pub fn command(&self) -> Command {
        Command::from_u8(self.command.load(Ordering::Acquire))
    }

    /// Controller side: issue a new command and wake a waiting worker.
    pub fn set_command(&self, command: Command) {
        let _guard = self.wake_lock.lock();
        let previous = Command::from_u8(self.command.swap(command as u8, Ordering::AcqRel));
        if previous != command {
            log::debug!("Playback command {previous} -> {command}");
        }
        self.wake.notify_all();
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Worker side: publish a lifecycle state. Terminal states are sticky.
    pub fn publish_state(&self, state: PlaybackState) {
        let _guard = self.wake_lock.lock();
        let previous = self.state();
        if previous.is_terminal() || previous == state {
            return;
        }
        self.state.store(state as u8, Ordering::Release);
        log::debug!("Playback state {previous} -> {state}");
        self.wake.notify_all();
    }

    /// Worker side at end of stream: turn a pending DEVAMP into STOP.
    /// Leaves any command the controller wrote in the meantime untouched.
    pub fn downgrade_devamp(&self) -> bool {
        let _guard = self.wake_lock.lock();
        let swapped = self
            .command
            .compare_exchange(
                Command::Devamp as u8,
                Command::Stop as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.wake.notify_all();
        }
        swapped
    }

    /// Block while the command is PAUSE. Re-checks at least every `interval`.
    /// Returns the command that ended the pause.
    pub fn wait_while_paused(&self, interval: Duration) -> Command {
        let mut guard = self.wake_lock.lock();
        loop {
            let command = self.command();
            if command != Command::Pause {
                return command;
            }
            self.wake.wait_for(&mut guard, interval);
        }
    }

    /// Block until the worker publishes a terminal state, re-checking every
    /// `interval`. Calls `on_poll` after each interval that ended without one.
    pub fn wait_for_exit(&self, interval: Duration, mut on_poll: impl FnMut(u32)) -> PlaybackState {
        let mut polls = 0;
        let mut guard = self.wake_lock.lock();
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            if self.wake.wait_for(&mut guard, interval).timed_out() {
                polls += 1;
                on_poll(polls);
            }
        }
    }
}

impl std::fmt::Debug for PlaybackControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackControl")
            .field("source_path", &self.source_path)
            .field("command", &self.command())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn control(initial: Command) -> Arc<PlaybackControl> {
        Arc::new(PlaybackControl::new(
            "clip.h264",
            SharedImage::new(1, 1),
            initial,
        ))
    }

    #[test]
    fn starts_stopped_with_initial_command() {
        let ctl = control(Command::Play);
        assert_eq!(ctl.state(), PlaybackState::Stopped);
        assert_eq!(ctl.command(), Command::Play);
        assert_eq!(ctl.source_path(), Path::new("clip.h264"));
    }

    #[test]
    fn terminal_state_is_sticky() {
        let ctl = control(Command::Play);
        ctl.publish_state(PlaybackState::Playing);
        ctl.publish_state(PlaybackState::Terminated);
        ctl.publish_state(PlaybackState::Playing);
        assert_eq!(ctl.state(), PlaybackState::Terminated);
        ctl.publish_state(PlaybackState::Failed);
        assert_eq!(ctl.state(), PlaybackState::Terminated);
    }

    #[test]
    fn devamp_downgrade_only_applies_to_devamp() {
        let ctl = control(Command::Devamp);
        assert!(ctl.downgrade_devamp());
        assert_eq!(ctl.command(), Command::Stop);

        let ctl = control(Command::Terminate);
        assert!(!ctl.downgrade_devamp());
        assert_eq!(ctl.command(), Command::Terminate);
    }

    #[test]
    fn pause_wait_returns_without_pause() {
        let ctl = control(Command::Play);
        assert_eq!(ctl.wait_while_paused(Duration::from_millis(5)), Command::Play);
    }

    #[test]
    fn pause_wait_wakes_on_command_change() {
        let ctl = control(Command::Pause);
        let waiter = {
            let ctl = ctl.clone();
            thread::spawn(move || ctl.wait_while_paused(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        ctl.set_command(Command::Terminate);
        assert_eq!(waiter.join().unwrap(), Command::Terminate);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn exit_wait_sees_failure_as_terminal() {
        let ctl = control(Command::Play);
        let worker = {
            let ctl = ctl.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ctl.publish_state(PlaybackState::Failed);
            })
        };
        let state = ctl.wait_for_exit(Duration::from_millis(5), |_| {});
        assert_eq!(state, PlaybackState::Failed);
        worker.join().unwrap();
    }

    #[test]
    fn exit_wait_reports_polls() {
        let ctl = control(Command::Play);
        let worker = {
            let ctl = ctl.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                ctl.publish_state(PlaybackState::Terminated);
            })
        };
        let mut polls = 0;
        let state = ctl.wait_for_exit(Duration::from_millis(5), |n| polls = n);
        assert_eq!(state, PlaybackState::Terminated);
        assert!(polls >= 1);
        worker.join().unwrap();
    }
}
