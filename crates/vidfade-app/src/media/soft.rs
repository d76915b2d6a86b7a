//! In-process stand-in for the hardware media framework.
//!
//! Stages are emulated synchronously on the caller's thread: an input buffer
//! handed to the decoder is split into H.264 NAL units, every coded picture
//! travels through the decoder and scheduler tunnels, and the renderer paints a
//! pattern derived from the picture's bytes into the bound destination image.
//! Faults can be injected at every framework call the pipeline driver makes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{FrameworkError, ImageError};
use crate::media::framework::{
    BufferFlags, ClockState, Coding, DECODER_IN, DECODER_OUT, FillAction, FillDoneHandler,
    InputBuffer, MediaFramework, OutputBuffer, PortSetup, RENDERER_OUT, StageConfig, StageEvent,
    StageId, StageKind, StageState, Tunnel,
};
use crate::media::image::SharedImage;
use crate::settings::SoftDecoderSettings;

/// Decoded pictures the decoder keeps on its output port while nothing
/// downstream can take them. Older ones are dropped past this.
const HELD_PICTURES: usize = 16;

/// Failures to inject into a [`SoftFramework`].
#[derive(Debug, Clone, Default)]
pub struct SoftFaults {
    pub fail_init: bool,
    pub fail_create: Option<StageKind>,
    /// Refuse any tunnel whose downstream stage is of this kind.
    pub fail_tunnel_into: Option<StageKind>,
    pub reject_image: bool,
    /// Refuse input buffers once this many were accepted.
    pub fail_empty_after: Option<u64>,
    /// Never report decoded stream parameters.
    pub suppress_port_settings: bool,
}

/// Counters a test or the log can read while the framework runs elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub live_stages: usize,
    pub live_tunnels: usize,
    pub buffers_emptied: u64,
    pub bytes_emptied: u64,
    pub start_time_buffers: u64,
    pub eos_buffers: u64,
    pub port_settings_events: u64,
    pub images_bound: u64,
    pub fill_requests: u64,
    pub frames_decoded: u64,
    pub frames_rendered: u64,
    pub frames_dropped: u64,
    pub flushes: u64,
}

impl std::fmt::Display for SoftStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} buffers ({} bytes, {} start, {} eos), {} pictures decoded, {} rendered, {} dropped, \
             {} port events, {} image binds, {} fills, {} flushes, {} stages / {} tunnels live",
            self.buffers_emptied,
            self.bytes_emptied,
            self.start_time_buffers,
            self.eos_buffers,
            self.frames_decoded,
            self.frames_rendered,
            self.frames_dropped,
            self.port_settings_events,
            self.images_bound,
            self.fill_requests,
            self.flushes,
            self.live_stages,
            self.live_tunnels
        )
    }
}

/// Shared view of a framework's [`SoftStats`].
#[derive(Debug, Clone, Default)]
pub struct SoftProbe(Arc<Mutex<SoftStats>>);

impl SoftProbe {
    pub fn snapshot(&self) -> SoftStats {
        self.0.lock().clone()
    }

    fn update(&self, f: impl FnOnce(&mut SoftStats)) {
        f(&mut self.0.lock());
    }
}

struct SoftStage {
    kind: StageKind,
    state: StageState,
    coding: Option<Coding>,
    clock: ClockState,
    enabled_ports: HashSet<u32>,
}

impl SoftStage {
    fn check_port(&self, port: u32) -> Result<(), FrameworkError> {
        if self.kind.ports().contains(&port) {
            Ok(())
        } else {
            Err(FrameworkError::NoSuchPort {
                kind: self.kind,
                port,
            })
        }
    }
}

/// Incremental Annex-B splitter. Yields each NAL unit once the next start
/// code shows where it ends.
#[derive(Debug, Default)]
struct NalSplitter {
    pending: Vec<u8>,
}

impl NalSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let starts = start_codes(&self.pending);
        let mut units = Vec::new();
        for pair in starts.windows(2) {
            let unit = trim_trailing_zeros(&self.pending[pair[0] + 3..pair[1]]);
            if !unit.is_empty() {
                units.push(unit.to_vec());
            }
        }
        match starts.last() {
            Some(&last) => {
                self.pending.drain(..last);
            }
            // Keep two bytes in case a start code straddles the next push.
            None => {
                let keep = self.pending.len().min(2);
                self.pending.drain(..self.pending.len() - keep);
            }
        }
        units
    }

    /// Emit whatever follows the last start code.
    fn finish(&mut self) -> Option<Vec<u8>> {
        let pending = std::mem::take(&mut self.pending);
        let first = *start_codes(&pending).first()?;
        let unit = trim_trailing_zeros(&pending[first + 3..]);
        (!unit.is_empty()).then(|| unit.to_vec())
    }
}

fn start_codes(bytes: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= bytes.len() {
        if bytes[i] == 0 && bytes[i + 1] == 0 && bytes[i + 2] == 1 {
            starts.push(i);
            i += 3;
        } else {
            i += 1;
        }
    }
    starts
}

fn trim_trailing_zeros(unit: &[u8]) -> &[u8] {
    let end = unit.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &unit[..end]
}

/// Coded slice of a non-IDR (1) or IDR (5) picture.
fn is_picture(unit: &[u8]) -> bool {
    unit.first().is_some_and(|header| matches!(header & 0x1f, 1 | 5))
}

/// FNV-1a over the picture bytes.
fn picture_hash(unit: &[u8]) -> u32 {
    unit.iter().fold(0x811c_9dc5_u32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

/// Paint a gradient tinted by the picture hash with a bar that walks across
/// the image from one picture to the next.
fn paint(pixels: &mut [u8], width: u32, hash: u32, sequence: u64) {
    let width = width.max(1) as usize;
    let [r, g, b, _] = hash.to_le_bytes();
    let height = (pixels.len() / 4 / width).max(1);
    let bar = (sequence as usize * 8) % width;
    for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
        let (x, y) = (i % width, i / width);
        let shade = (y * 255 / height) as u8;
        if x.abs_diff(bar) < 4 {
            px.copy_from_slice(&[255, 255, 255, 255]);
        } else {
            px.copy_from_slice(&[r ^ shade, g, b.wrapping_add(shade / 2), 255]);
        }
    }
}

struct Renderer {
    stage: StageId,
    image: SharedImage,
    queued: Option<OutputBuffer>,
}

/// Software [`MediaFramework`].
pub struct SoftFramework {
    settings: SoftDecoderSettings,
    faults: SoftFaults,
    probe: SoftProbe,
    initialised: bool,
    next_id: u32,
    stages: HashMap<StageId, SoftStage>,
    /// Established tunnels and whether they still carry data.
    tunnels: Vec<(Tunnel, bool)>,
    free_inputs: Vec<InputBuffer>,
    input_pool: Option<StageId>,
    events: Vec<(StageId, StageEvent)>,
    port_settings_sent: bool,
    splitter: NalSplitter,
    held: VecDeque<Vec<u8>>,
    start_time: Option<Instant>,
    next_due: Option<Instant>,
    renderer: Option<Renderer>,
    fill_done: Option<FillDoneHandler>,
}

impl SoftFramework {
    pub fn new(settings: SoftDecoderSettings) -> Self {
        Self::with_faults(settings, SoftFaults::default())
    }

    pub fn with_faults(settings: SoftDecoderSettings, faults: SoftFaults) -> Self {
        Self {
            settings,
            faults,
            probe: SoftProbe::default(),
            initialised: false,
            next_id: 0,
            stages: HashMap::new(),
            tunnels: Vec::new(),
            free_inputs: Vec::new(),
            input_pool: None,
            events: Vec::new(),
            port_settings_sent: false,
            splitter: NalSplitter::default(),
            held: VecDeque::new(),
            start_time: None,
            next_due: None,
            renderer: None,
            fill_done: None,
        }
    }

    pub fn probe(&self) -> SoftProbe {
        self.probe.clone()
    }

    fn stage(&self, id: StageId) -> Result<&SoftStage, FrameworkError> {
        self.stages.get(&id).ok_or(FrameworkError::UnknownStage(id.0))
    }

    fn stage_mut(&mut self, id: StageId) -> Result<&mut SoftStage, FrameworkError> {
        self.stages
            .get_mut(&id)
            .ok_or(FrameworkError::UnknownStage(id.0))
    }

    fn executing(&self, kind: StageKind) -> bool {
        self.stages
            .values()
            .any(|s| s.kind == kind && s.state == StageState::Executing)
    }

    fn tunnel_open(&self, from: StageKind, to: StageKind) -> bool {
        self.tunnels
            .iter()
            .any(|(t, open)| *open && t.source.kind == from && t.sink.kind == to)
    }

    fn clock_running(&self) -> bool {
        self.stages.values().any(|s| {
            s.kind == StageKind::Clock
                && s.state == StageState::Executing
                && match s.clock {
                    ClockState::WaitingForStartTime { wait_mask } => {
                        wait_mask == 0 || self.start_time.is_some()
                    }
                    ClockState::Stopped => false,
                }
        })
    }

    /// Whether a picture leaving the decoder now reaches a queued renderer
    /// buffer.
    fn chain_ready(&self) -> bool {
        self.tunnel_open(StageKind::Decoder, StageKind::Scheduler)
            && self.executing(StageKind::Scheduler)
            && self.tunnel_open(StageKind::Clock, StageKind::Scheduler)
            && self.clock_running()
            && self.tunnel_open(StageKind::Scheduler, StageKind::Renderer)
            && self.executing(StageKind::Renderer)
            && self.renderer.as_ref().is_some_and(|r| r.queued.is_some())
    }

    /// Queue a decoded picture on the decoder output, then push out as many
    /// held pictures as the chain accepts.
    fn deliver(&mut self, picture: Vec<u8>) {
        self.probe.update(|s| s.frames_decoded += 1);
        if self.held.len() == HELD_PICTURES {
            self.held.pop_front();
            self.probe.update(|s| s.frames_dropped += 1);
        }
        self.held.push_back(picture);
        self.flush_held();
    }

    fn flush_held(&mut self) {
        while self.chain_ready() {
            let Some(picture) = self.held.pop_front() else {
                return;
            };
            self.render(&picture);
        }
    }

    /// Scheduler and renderer work for one picture.
    fn render(&mut self, picture: &[u8]) {
        self.pace();

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let Some(buffer) = renderer.queued else {
            return;
        };
        let sequence = renderer.image.generation();
        let width = renderer.image.width();
        let hash = picture_hash(picture);
        if let Err(e) = renderer
            .image
            .write_frame(|px| paint(px, width, hash, sequence))
        {
            log::warn!("Renderer lost its destination image: {e}");
            renderer.queued = None;
            self.probe.update(|s| s.frames_dropped += 1);
            return;
        }
        self.probe.update(|s| s.frames_rendered += 1);

        let action = match self.fill_done.as_mut() {
            Some(handler) => handler(buffer),
            None => FillAction::Hold,
        };
        if action == FillAction::Hold {
            renderer.queued = None;
        }
    }

    /// Forget everything one decode session left behind.
    fn reset_session(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.image.unbind();
        }
        self.events.clear();
        self.port_settings_sent = false;
        self.splitter = NalSplitter::default();
        self.held.clear();
        self.start_time = None;
        self.next_due = None;
    }

    /// Scheduler presentation pacing against the frame interval.
    fn pace(&mut self) {
        let interval = self.settings.frame_interval();
        if interval.is_zero() {
            return;
        }
        let now = Instant::now();
        let due = self.next_due.map_or(now, |due| due.max(now));
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due + interval);
    }
}

impl MediaFramework for SoftFramework {
    fn init(&mut self) -> Result<(), FrameworkError> {
        if self.faults.fail_init {
            return Err(FrameworkError::Init("injected failure".into()));
        }
        self.reset_session();
        self.initialised = true;
        log::debug!(
            "Soft media framework up ({} x {} byte input buffers, {:?} per frame)",
            self.settings.input_buffers,
            self.settings.input_buffer_size,
            self.settings.frame_interval()
        );
        Ok(())
    }

    fn deinit(&mut self) {
        if !self.stages.is_empty() || !self.tunnels.is_empty() {
            log::warn!(
                "Soft media framework deinit with {} stage(s) and {} tunnel(s) still live",
                self.stages.len(),
                self.tunnels.len()
            );
        }
        self.reset_session();
        self.fill_done = None;
        self.initialised = false;
    }

    fn set_fill_done_handler(&mut self, handler: FillDoneHandler) {
        self.fill_done = Some(handler);
    }

    fn create_stage(
        &mut self,
        kind: StageKind,
        ports: PortSetup,
    ) -> Result<StageId, FrameworkError> {
        if !self.initialised {
            return Err(FrameworkError::NotInitialised);
        }
        if self.faults.fail_create == Some(kind) {
            return Err(FrameworkError::CreateStage(kind));
        }
        let id = StageId(self.next_id);
        self.next_id += 1;
        let enabled_ports = if ports.disable_all {
            HashSet::new()
        } else {
            kind.ports().iter().copied().collect()
        };
        self.stages.insert(
            id,
            SoftStage {
                kind,
                state: StageState::Loaded,
                coding: None,
                clock: ClockState::Stopped,
                enabled_ports,
            },
        );
        self.probe.update(|s| s.live_stages += 1);
        log::trace!("Created {kind} as stage {}", id.0);
        Ok(id)
    }

    fn configure(&mut self, stage: StageId, config: StageConfig) -> Result<(), FrameworkError> {
        let st = self.stage_mut(stage)?;
        match (st.kind, config) {
            (StageKind::Clock, StageConfig::ClockState(clock)) => {
                st.clock = clock;
                Ok(())
            }
            (StageKind::Decoder, StageConfig::PortFormat { port, coding }) if port == DECODER_IN => {
                st.coding = Some(coding);
                Ok(())
            }
            (kind, config) => Err(FrameworkError::Configure {
                kind,
                reason: format!("unsupported {config:?}"),
            }),
        }
    }

    fn transition(&mut self, stage: StageId, to: StageState) -> Result<(), FrameworkError> {
        let st = self.stage_mut(stage)?;
        if !st.state.can_transition_to(to) {
            return Err(FrameworkError::IllegalTransition {
                kind: st.kind,
                from: st.state,
                to,
            });
        }
        if st.kind == StageKind::Decoder && to == StageState::Executing && st.coding.is_none() {
            return Err(FrameworkError::Configure {
                kind: st.kind,
                reason: "no input format set".into(),
            });
        }
        st.state = to;
        let kind = st.kind;
        if kind == StageKind::Scheduler && to != StageState::Executing {
            self.next_due = None;
        }
        log::trace!("{kind} -> {to:?}");
        Ok(())
    }

    fn state(&self, stage: StageId) -> Option<StageState> {
        self.stages.get(&stage).map(|s| s.state)
    }

    fn destroy_stage(&mut self, stage: StageId) {
        let Some(st) = self.stages.remove(&stage) else {
            return;
        };
        if st.state != StageState::Loaded {
            log::warn!("Destroying {} while {:?}", st.kind, st.state);
        }
        if self.input_pool == Some(stage) {
            self.input_pool = None;
            self.free_inputs.clear();
        }
        if self.renderer.as_ref().is_some_and(|r| r.stage == stage)
            && let Some(renderer) = self.renderer.take()
        {
            renderer.image.unbind();
        }
        self.probe.update(|s| s.live_stages -= 1);
    }

    fn enable_port_buffers(&mut self, stage: StageId, port: u32) -> Result<(), FrameworkError> {
        let st = self.stage_mut(stage)?;
        st.check_port(port)?;
        if st.kind != StageKind::Decoder || port != DECODER_IN {
            return Err(FrameworkError::PortBuffers {
                kind: st.kind,
                port,
            });
        }
        st.enabled_ports.insert(port);
        self.free_inputs = (0..self.settings.input_buffers.max(1))
            .map(|i| InputBuffer::new(i, self.settings.input_buffer_size.max(1)))
            .collect();
        self.input_pool = Some(stage);
        Ok(())
    }

    fn disable_port_buffers(&mut self, stage: StageId, port: u32) {
        if let Some(st) = self.stages.get_mut(&stage) {
            st.enabled_ports.remove(&port);
        }
        if self.input_pool == Some(stage) && port == DECODER_IN {
            self.input_pool = None;
            self.free_inputs.clear();
        }
    }

    fn enable_port(&mut self, stage: StageId, port: u32) -> Result<(), FrameworkError> {
        let st = self.stage_mut(stage)?;
        st.check_port(port)?;
        st.enabled_ports.insert(port);
        Ok(())
    }

    fn setup_tunnel(&mut self, tunnel: &Tunnel, _timeout: Duration) -> Result<(), FrameworkError> {
        self.stage(tunnel.source.stage)?.check_port(tunnel.source.port)?;
        self.stage(tunnel.sink.stage)?.check_port(tunnel.sink.port)?;
        if self.faults.fail_tunnel_into == Some(tunnel.sink.kind)
            || self.tunnels.iter().any(|(t, _)| t == tunnel)
        {
            return Err(FrameworkError::Tunnel {
                upstream: tunnel.source,
                downstream: tunnel.sink,
            });
        }
        for end in [tunnel.source, tunnel.sink] {
            self.stage_mut(end.stage)?.enabled_ports.insert(end.port);
        }
        self.tunnels.push((*tunnel, true));
        self.probe.update(|s| s.live_tunnels += 1);
        log::trace!("Tunnel {tunnel} up");
        Ok(())
    }

    fn flush_tunnel(&mut self, tunnel: &Tunnel) {
        if tunnel.source.kind == StageKind::Scheduler {
            self.next_due = None;
        }
        self.probe.update(|s| s.flushes += 1);
    }

    fn disable_tunnel(&mut self, tunnel: &Tunnel) {
        if let Some((_, open)) = self.tunnels.iter_mut().find(|(t, _)| t == tunnel) {
            *open = false;
        }
        for end in [tunnel.source, tunnel.sink] {
            if let Some(st) = self.stages.get_mut(&end.stage) {
                st.enabled_ports.remove(&end.port);
            }
        }
    }

    fn teardown_tunnel(&mut self, tunnel: &Tunnel) {
        let before = self.tunnels.len();
        self.tunnels.retain(|(t, _)| t != tunnel);
        if self.tunnels.len() < before {
            self.probe.update(|s| s.live_tunnels -= 1);
        }
    }

    fn acquire_input_buffer(
        &mut self,
        stage: StageId,
        port: u32,
        timeout: Duration,
    ) -> Result<Option<InputBuffer>, FrameworkError> {
        let kind = self.stage(stage)?.kind;
        if self.input_pool != Some(stage) || port != DECODER_IN {
            return Err(FrameworkError::PortBuffers { kind, port });
        }
        match self.free_inputs.pop() {
            Some(buffer) => Ok(Some(buffer)),
            None => {
                // Nothing is in flight asynchronously, so no buffer can come back.
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn empty_buffer(
        &mut self,
        stage: StageId,
        mut buffer: InputBuffer,
    ) -> Result<(), FrameworkError> {
        let st = self.stage(stage)?;
        let kind = st.kind;
        let refusal = if kind != StageKind::Decoder {
            Some("stage takes no input".to_string())
        } else if st.state != StageState::Executing {
            Some(format!("stage is {:?}", st.state))
        } else if self
            .faults
            .fail_empty_after
            .is_some_and(|limit| self.probe.snapshot().buffers_emptied >= limit)
        {
            Some("injected failure".to_string())
        } else {
            None
        };
        if let Some(reason) = refusal {
            if self.input_pool == Some(stage) {
                self.free_inputs.push(buffer);
            }
            return Err(FrameworkError::BufferExchange { kind, reason });
        }

        let flags = buffer.flags;
        let len = buffer.payload().len() as u64;
        self.probe.update(|s| {
            s.buffers_emptied += 1;
            s.bytes_emptied += len;
            if flags.contains(BufferFlags::START_TIME) {
                s.start_time_buffers += 1;
            }
            if flags.contains(BufferFlags::EOS) {
                s.eos_buffers += 1;
            }
        });
        if flags.contains(BufferFlags::START_TIME) && self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }

        if len > 0 && !self.port_settings_sent && !self.faults.suppress_port_settings {
            self.port_settings_sent = true;
            self.events.push((
                stage,
                StageEvent::PortSettingsChanged { port: DECODER_OUT },
            ));
            self.probe.update(|s| s.port_settings_events += 1);
        }

        let mut units = self.splitter.push(buffer.payload());
        if flags.contains(BufferFlags::EOS) {
            units.extend(self.splitter.finish());
        }
        for unit in units.into_iter().filter(|u| is_picture(u)) {
            self.deliver(unit);
        }

        buffer.filled = 0;
        buffer.flags = BufferFlags::NONE;
        self.free_inputs.push(buffer);
        Ok(())
    }

    fn take_event(&mut self, stage: StageId, event: StageEvent) -> bool {
        match self.events.iter().position(|e| *e == (stage, event)) {
            Some(i) => {
                self.events.remove(i);
                true
            }
            None => false,
        }
    }

    fn wait_for_event(
        &mut self,
        stage: StageId,
        event: StageEvent,
        timeout: Duration,
    ) -> Result<(), FrameworkError> {
        if self.take_event(stage, event) {
            return Ok(());
        }
        // Events are only raised while a buffer is being emptied, which cannot
        // happen during the wait.
        let kind = self.stage(stage)?.kind;
        Err(FrameworkError::EventTimeout {
            kind,
            event,
            timeout,
        })
    }

    fn use_image(
        &mut self,
        stage: StageId,
        port: u32,
        image: &SharedImage,
    ) -> Result<OutputBuffer, FrameworkError> {
        let st = self.stage(stage)?;
        let kind = st.kind;
        st.check_port(port)?;
        if kind != StageKind::Renderer || port != RENDERER_OUT {
            return Err(FrameworkError::PortBuffers { kind, port });
        }
        if !st.enabled_ports.contains(&port) {
            return Err(FrameworkError::PortBuffers { kind, port });
        }
        if self.faults.reject_image {
            return Err(FrameworkError::Image {
                kind,
                source: ImageError::AlreadyBound,
            });
        }
        image
            .bind()
            .map_err(|source| FrameworkError::Image { kind, source })?;
        self.renderer = Some(Renderer {
            stage,
            image: image.clone(),
            queued: None,
        });
        self.probe.update(|s| s.images_bound += 1);
        Ok(OutputBuffer { stage, port })
    }

    fn fill_buffer(&mut self, buffer: OutputBuffer) -> Result<(), FrameworkError> {
        let kind = self.stage(buffer.stage)?.kind;
        let executing = self.state(buffer.stage) == Some(StageState::Executing);
        let Some(renderer) = self.renderer.as_mut().filter(|r| r.stage == buffer.stage) else {
            return Err(FrameworkError::BufferExchange {
                kind,
                reason: "no image bound".into(),
            });
        };
        if !executing {
            return Err(FrameworkError::BufferExchange {
                kind,
                reason: "stage is not executing".into(),
            });
        }
        renderer.queued = Some(buffer);
        self.probe.update(|s| s.fill_requests += 1);
        self.flush_held();
        Ok(())
    }
}

/// Annex-B stream of `count` one-slice pictures after an SPS and PPS.
#[cfg(test)]
pub(crate) fn annexb_clip(count: usize) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
    for i in 0..count {
        let header = if i == 0 { 0x65 } else { 0x41 };
        out.extend_from_slice(&[0, 0, 1, header, 0x88, i as u8, 0x5a, 0xa5]);
    }
    out
}
