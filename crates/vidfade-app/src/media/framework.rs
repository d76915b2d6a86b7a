//! Boundary to the hardware media framework.
//!
//! The pipeline driver only depends on this contract: stages created by kind,
//! moved through Loaded/Idle/Executing, wired with point-to-point tunnels, fed
//! with input buffers, and told to fill a bound output image.

use std::fmt;
use std::time::Duration;

use crate::error::FrameworkError;
use crate::media::image::SharedImage;

/// Decoder compressed-data input port.
pub const DECODER_IN: u32 = 130;
/// Decoder decoded-picture output port.
pub const DECODER_OUT: u32 = 131;
/// Scheduler picture input port.
pub const SCHEDULER_IN: u32 = 10;
/// Scheduler picture output port.
pub const SCHEDULER_OUT: u32 = 11;
/// Scheduler clock input port.
pub const SCHEDULER_CLOCK: u32 = 12;
/// Renderer picture input port.
pub const RENDERER_IN: u32 = 220;
/// Renderer image output port.
pub const RENDERER_OUT: u32 = 221;
/// Clock reference output port.
pub const CLOCK_OUT: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Decoder,
    Clock,
    Scheduler,
    Renderer,
}

impl StageKind {
    /// Component name the framework knows the stage by.
    pub fn component_name(self) -> &'static str {
        match self {
            StageKind::Decoder => "video_decode",
            StageKind::Clock => "clock",
            StageKind::Scheduler => "video_scheduler",
            StageKind::Renderer => "egl_render",
        }
    }

    /// Ports the stage exposes.
    pub fn ports(self) -> &'static [u32] {
        match self {
            StageKind::Decoder => &[DECODER_IN, DECODER_OUT],
            StageKind::Clock => &[CLOCK_OUT],
            StageKind::Scheduler => &[SCHEDULER_IN, SCHEDULER_OUT, SCHEDULER_CLOCK],
            StageKind::Renderer => &[RENDERER_IN, RENDERER_OUT],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component_name())
    }
}

/// Opaque handle to a created stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Loaded,
    Idle,
    Executing,
}

impl StageState {
    /// Whether the framework accepts a direct move from `self` to `to`.
    pub fn can_transition_to(self, to: StageState) -> bool {
        matches!(
            (self, to),
            (StageState::Loaded, StageState::Idle)
                | (StageState::Idle, StageState::Loaded)
                | (StageState::Idle, StageState::Executing)
                | (StageState::Executing, StageState::Idle)
        )
    }

    /// Next legal state on the way to `target`, or `None` when already there.
    pub fn step_toward(self, target: StageState) -> Option<StageState> {
        let rank = |s: StageState| match s {
            StageState::Loaded => 0,
            StageState::Idle => 1,
            StageState::Executing => 2,
        };
        match rank(self).cmp(&rank(target)) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Less if self == StageState::Loaded => Some(StageState::Idle),
            std::cmp::Ordering::Less => Some(StageState::Executing),
            std::cmp::Ordering::Greater if self == StageState::Executing => Some(StageState::Idle),
            std::cmp::Ordering::Greater => Some(StageState::Loaded),
        }
    }
}

/// Which ports get buffers or start disabled when a stage is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortSetup {
    pub disable_all: bool,
    pub input_buffers: bool,
    pub output_buffers: bool,
}

impl PortSetup {
    pub fn disabled() -> Self {
        Self {
            disable_all: true,
            ..Self::default()
        }
    }

    pub fn with_input_buffers(mut self) -> Self {
        self.input_buffers = true;
        self
    }

    pub fn with_output_buffers(mut self) -> Self {
        self.output_buffers = true;
        self
    }
}

/// Compressed formats the decoder can be told to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    Avc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    /// Hold media time until a buffer flagged START_TIME arrives.
    WaitingForStartTime { wait_mask: u32 },
}

/// Per-stage configuration applied before data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageConfig {
    ClockState(ClockState),
    PortFormat { port: u32, coding: Coding },
}

/// One side of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub stage: StageId,
    pub kind: StageKind,
    pub port: u32,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.port)
    }
}

/// Point-to-point connection carrying buffers without controller involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tunnel {
    pub source: Endpoint,
    pub sink: Endpoint,
}

impl Tunnel {
    pub fn new(
        (source_stage, source_kind, source_port): (StageId, StageKind, u32),
        (sink_stage, sink_kind, sink_port): (StageId, StageKind, u32),
    ) -> Self {
        Self {
            source: Endpoint {
                stage: source_stage,
                kind: source_kind,
                port: source_port,
            },
            sink: Endpoint {
                stage: sink_stage,
                kind: sink_kind,
                port: sink_port,
            },
        }
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.sink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// The decoder worked out stream parameters on the given output port.
    PortSettingsChanged { port: u32 },
}

/// Flags carried by an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const START_TIME: Self = Self(1 << 1);
    pub const TIME_UNKNOWN: Self = Self(1 << 8);
    pub const EOS: Self = Self(1 << 0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An input buffer on loan from the framework.
#[derive(Debug)]
pub struct InputBuffer {
    pub index: usize,
    pub data: Vec<u8>,
    pub filled: usize,
    pub flags: BufferFlags,
}

impl InputBuffer {
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            data: vec![0; capacity],
            filled: 0,
            flags: BufferFlags::NONE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.filled.min(self.data.len())]
    }
}

/// Output buffer that wraps a bound destination image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBuffer {
    pub stage: StageId,
    pub port: u32,
}

/// What the framework should do after it filled an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillAction {
    /// Queue the buffer again for the next picture.
    Refill,
    /// Keep the buffer until the driver asks for another fill.
    Hold,
}

/// Called on the framework's delivery path each time an output buffer is filled.
pub type FillDoneHandler = Box<dyn FnMut(OutputBuffer) -> FillAction + Send>;

/// Hardware media framework as seen by the pipeline driver.
pub trait MediaFramework: Send {
    fn init(&mut self) -> Result<(), FrameworkError>;
    fn deinit(&mut self);

    fn set_fill_done_handler(&mut self, handler: FillDoneHandler);

    fn create_stage(
        &mut self,
        kind: StageKind,
        ports: PortSetup,
    ) -> Result<StageId, FrameworkError>;
    fn configure(&mut self, stage: StageId, config: StageConfig) -> Result<(), FrameworkError>;
    fn transition(&mut self, stage: StageId, to: StageState) -> Result<(), FrameworkError>;
    fn state(&self, stage: StageId) -> Option<StageState>;
    fn destroy_stage(&mut self, stage: StageId);

    fn enable_port_buffers(&mut self, stage: StageId, port: u32) -> Result<(), FrameworkError>;
    fn disable_port_buffers(&mut self, stage: StageId, port: u32);
    /// Ask for a port to be enabled without waiting for completion.
    fn enable_port(&mut self, stage: StageId, port: u32) -> Result<(), FrameworkError>;

    fn setup_tunnel(&mut self, tunnel: &Tunnel, timeout: Duration) -> Result<(), FrameworkError>;
    fn flush_tunnel(&mut self, tunnel: &Tunnel);
    fn disable_tunnel(&mut self, tunnel: &Tunnel);
    fn teardown_tunnel(&mut self, tunnel: &Tunnel);

    /// Borrow a free input buffer, waiting at most `timeout`.
    fn acquire_input_buffer(
        &mut self,
        stage: StageId,
        port: u32,
        timeout: Duration,
    ) -> Result<Option<InputBuffer>, FrameworkError>;
    /// Hand a filled input buffer to the stage. The buffer returns to the pool.
    fn empty_buffer(&mut self, stage: StageId, buffer: InputBuffer) -> Result<(), FrameworkError>;

    /// Consume an already-signalled event without waiting.
    fn take_event(&mut self, stage: StageId, event: StageEvent) -> bool;
    fn wait_for_event(
        &mut self,
        stage: StageId,
        event: StageEvent,
        timeout: Duration,
    ) -> Result<(), FrameworkError>;

    /// Bind an externally allocated image as the stage's output buffer.
    fn use_image(
        &mut self,
        stage: StageId,
        port: u32,
        image: &SharedImage,
    ) -> Result<OutputBuffer, FrameworkError>;
    fn fill_buffer(&mut self, buffer: OutputBuffer) -> Result<(), FrameworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_follow_the_state_ladder() {
        use StageState::*;
        assert!(Loaded.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Loaded));
        assert!(!Loaded.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Loaded));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn step_toward_walks_one_rung_at_a_time() {
        use StageState::*;
        assert_eq!(Loaded.step_toward(Executing), Some(Idle));
        assert_eq!(Idle.step_toward(Executing), Some(Executing));
        assert_eq!(Executing.step_toward(Loaded), Some(Idle));
        assert_eq!(Idle.step_toward(Loaded), Some(Loaded));
        assert_eq!(Idle.step_toward(Idle), None);
    }

    #[test]
    fn buffer_flags_combine() {
        let flags = BufferFlags::TIME_UNKNOWN | BufferFlags::EOS;
        assert!(flags.contains(BufferFlags::EOS));
        assert!(flags.contains(BufferFlags::TIME_UNKNOWN));
        assert!(!flags.contains(BufferFlags::START_TIME));
    }

    #[test]
    fn tunnel_display_names_ports() {
        let tunnel = Tunnel::new(
            (StageId(0), StageKind::Decoder, DECODER_OUT),
            (StageId(3), StageKind::Scheduler, SCHEDULER_IN),
        );
        assert_eq!(tunnel.to_string(), "video_decode:131 -> video_scheduler:10");
    }
}
