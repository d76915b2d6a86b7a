use std::fmt;

/// Instruction written by the controller and polled by the decode worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// No instruction yet. The feed loop treats it like `Play`.
    None = 0,
    Play = 1,
    Pause = 2,
    Stop = 3,
    /// Finish the current pass, then stop at the next end of stream.
    Devamp = 4,
    Terminate = 5,
}

impl Command {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Command::Play,
            2 => Command::Pause,
            3 => Command::Stop,
            4 => Command::Devamp,
            5 => Command::Terminate,
            _ => Command::None,
        }
    }

    /// Whether the feed loop must leave on this command.
    pub fn halts_feed(self) -> bool {
        matches!(self, Command::Stop | Command::Terminate)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::None => "none",
            Command::Play => "play",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::Devamp => "devamp",
            Command::Terminate => "terminate",
        };
        f.write_str(name)
    }
}

/// Lifecycle state published by the decode worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    /// The worker finished cleanly.
    Terminated = 3,
    /// The worker's decode session ended with an error.
    Failed = 4,
}

impl PlaybackState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            3 => PlaybackState::Terminated,
            4 => PlaybackState::Failed,
            _ => PlaybackState::Stopped,
        }
    }

    /// Terminal states are never left once published.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlaybackState::Terminated | PlaybackState::Failed)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Terminated => "terminated",
            PlaybackState::Failed => "failed",
        };
        f.write_str(name)
    }
}
