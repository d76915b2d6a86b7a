//! Decode session: builds the decoder / clock / scheduler / renderer graph,
//! streams the file through it under control of the playback command, and
//! takes everything down again in reverse on every exit path.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{FrameworkError, PipelineError};
use crate::media::framework::{
    BufferFlags, CLOCK_OUT, ClockState, Coding, DECODER_IN, DECODER_OUT, FillAction, InputBuffer,
    MediaFramework, PortSetup, RENDERER_IN, RENDERER_OUT, SCHEDULER_CLOCK, SCHEDULER_IN,
    SCHEDULER_OUT, StageConfig, StageEvent, StageId, StageKind, StageState, Tunnel,
};
use crate::media::stream::StreamReader;
use crate::playback::{Command, PlaybackControl, PlaybackState};
use crate::settings::PipelineSettings;

const PORT_SETTINGS: StageEvent = StageEvent::PortSettingsChanged { port: DECODER_OUT };

/// Why the feed loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Stopped,
    Terminated,
    /// The stream produced no data at all.
    Exhausted,
}

/// What a finished session did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub buffers_submitted: u64,
    pub bytes_submitted: u64,
    /// Times the stream was rewound under PLAY.
    pub loops: u32,
    pub negotiations: u32,
    pub frames_presented: u64,
    pub stop_reason: StopReason,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} after {} buffers ({} bytes), {} loop(s), {} frame(s) presented",
            self.stop_reason,
            self.buffers_submitted,
            self.bytes_submitted,
            self.loops,
            self.frames_presented
        )
    }
}

/// Handles acquired so far, released in reverse by [`Graph::teardown`].
#[derive(Default)]
struct Graph {
    decoder: Option<StageId>,
    renderer: Option<StageId>,
    clock: Option<StageId>,
    scheduler: Option<StageId>,
    tunnels: Vec<Tunnel>,
    input_enabled: bool,
}

impl Graph {
    fn create<F: MediaFramework + ?Sized>(
        fw: &mut F,
        slot: &mut Option<StageId>,
        kind: StageKind,
        ports: PortSetup,
    ) -> Result<StageId, PipelineError> {
        let id = fw
            .create_stage(kind, ports)
            .map_err(|e| PipelineError::stage_create(kind, e))?;
        *slot = Some(id);
        Ok(id)
    }

    fn connect<F: MediaFramework + ?Sized>(
        &mut self,
        fw: &mut F,
        tunnel: Tunnel,
        timeout: Duration,
    ) -> Result<(), FrameworkError> {
        fw.setup_tunnel(&tunnel, timeout)?;
        log::debug!("Tunnel {tunnel} established");
        self.tunnels.push(tunnel);
        Ok(())
    }

    fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        [self.clock, self.decoder, self.scheduler, self.renderer]
            .into_iter()
            .flatten()
    }

    fn flush<F: MediaFramework + ?Sized>(&self, fw: &mut F) {
        for tunnel in &self.tunnels {
            fw.flush_tunnel(tunnel);
        }
    }

    fn disable_input<F: MediaFramework + ?Sized>(&mut self, fw: &mut F) {
        if let (true, Some(decoder)) = (self.input_enabled, self.decoder) {
            fw.disable_port_buffers(decoder, DECODER_IN);
            self.input_enabled = false;
        }
    }

    fn teardown<F: MediaFramework + ?Sized>(&mut self, fw: &mut F) {
        self.disable_input(fw);
        for tunnel in &self.tunnels {
            fw.disable_tunnel(tunnel);
        }
        for tunnel in self.tunnels.drain(..).rev() {
            fw.teardown_tunnel(&tunnel);
        }
        let stages: Vec<StageId> = self.stages().collect();
        for &stage in &stages {
            if fw.state(stage) == Some(StageState::Executing)
                && let Err(e) = fw.transition(stage, StageState::Idle)
            {
                log::warn!("Teardown: {e}");
            }
        }
        for &stage in &stages {
            if let Err(e) = walk_to(fw, stage, StageState::Loaded) {
                log::warn!("Teardown: {e}");
            }
        }
        for stage in stages {
            fw.destroy_stage(stage);
        }
        *self = Graph::default();
    }
}

/// Move a stage one legal step at a time until it reaches `target`.
fn walk_to<F: MediaFramework + ?Sized>(
    fw: &mut F,
    stage: StageId,
    target: StageState,
) -> Result<(), FrameworkError> {
    loop {
        let current = fw
            .state(stage)
            .ok_or(FrameworkError::UnknownStage(stage.0))?;
        match current.step_toward(target) {
            Some(next) => fw.transition(stage, next)?,
            None => return Ok(()),
        }
    }
}

/// Run one decode session against `fw` until the command stops it or an
/// error ends it. Every stage, tunnel, and buffer acquired is released before
/// returning, on success and on failure alike.
pub fn decode<F: MediaFramework + ?Sized>(
    fw: &mut F,
    control: &PlaybackControl,
    settings: &PipelineSettings,
) -> Result<SessionSummary, PipelineError> {
    let path = control.source_path();
    let mut stream = StreamReader::open(path).map_err(|source| PipelineError::StreamOpen {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Decoding {} ({} bytes)", path.display(), stream.byte_len());

    fw.init().map_err(PipelineError::FrameworkInit)?;

    let presented = Arc::new(AtomicU64::new(0));
    {
        let presented = presented.clone();
        fw.set_fill_done_handler(Box::new(move |_buffer| {
            presented.fetch_add(1, Ordering::Relaxed);
            FillAction::Refill
        }));
    }

    let mut graph = Graph::default();
    let mut summary = SessionSummary::default();
    let result = build(fw, &mut graph, settings).and_then(|decoder| {
        run(
            fw,
            &mut graph,
            decoder,
            control,
            settings,
            &mut stream,
            &mut summary,
        )
    });

    drop(stream);
    graph.teardown(fw);
    fw.deinit();

    summary.frames_presented = presented.load(Ordering::Relaxed);
    result.map(|()| summary)
}

/// Create the four stages and bring everything up to the point where the
/// decoder accepts compressed input. Returns the decoder handle.
fn build<F: MediaFramework + ?Sized>(
    fw: &mut F,
    graph: &mut Graph,
    settings: &PipelineSettings,
) -> Result<StageId, PipelineError> {
    let decoder = Graph::create(
        fw,
        &mut graph.decoder,
        StageKind::Decoder,
        PortSetup::disabled().with_input_buffers(),
    )?;
    let renderer = Graph::create(
        fw,
        &mut graph.renderer,
        StageKind::Renderer,
        PortSetup::disabled().with_output_buffers(),
    )?;
    let clock = Graph::create(fw, &mut graph.clock, StageKind::Clock, PortSetup::disabled())?;
    let scheduler = Graph::create(
        fw,
        &mut graph.scheduler,
        StageKind::Scheduler,
        PortSetup::disabled(),
    )?;
    log::debug!(
        "Created stages: decoder {decoder:?}, renderer {renderer:?}, clock {clock:?}, scheduler {scheduler:?}"
    );

    // Media time starts with the first buffer flagged START_TIME.
    fw.configure(
        clock,
        StageConfig::ClockState(ClockState::WaitingForStartTime { wait_mask: 1 }),
    )
    .map_err(PipelineError::ClockConfig)?;
    fw.configure(
        decoder,
        StageConfig::PortFormat {
            port: DECODER_IN,
            coding: Coding::Avc,
        },
    )
    .map_err(PipelineError::DecoderInput)?;

    graph
        .connect(
            fw,
            Tunnel::new(
                (decoder, StageKind::Decoder, DECODER_OUT),
                (scheduler, StageKind::Scheduler, SCHEDULER_IN),
            ),
            Duration::ZERO,
        )
        .map_err(PipelineError::DecoderTunnel)?;
    graph
        .connect(
            fw,
            Tunnel::new(
                (clock, StageKind::Clock, CLOCK_OUT),
                (scheduler, StageKind::Scheduler, SCHEDULER_CLOCK),
            ),
            Duration::ZERO,
        )
        .map_err(PipelineError::ClockTunnel)?;

    walk_to(fw, clock, StageState::Executing).map_err(PipelineError::Transition)?;
    walk_to(fw, decoder, StageState::Idle).map_err(PipelineError::Transition)?;
    fw.enable_port_buffers(decoder, DECODER_IN)
        .map_err(PipelineError::DecoderInput)?;
    graph.input_enabled = true;
    walk_to(fw, decoder, StageState::Executing).map_err(PipelineError::Transition)?;

    Ok(decoder)
}

/// Finish the graph once the decoder knows the stream parameters: scheduler
/// running, renderer tunnelled and bound to the destination image, first fill
/// requested.
fn negotiate<F: MediaFramework + ?Sized>(
    fw: &mut F,
    graph: &mut Graph,
    control: &PlaybackControl,
    settings: &PipelineSettings,
) -> Result<(), PipelineError> {
    let (Some(scheduler), Some(renderer)) = (graph.scheduler, graph.renderer) else {
        return Err(PipelineError::RendererTunnel(FrameworkError::NotInitialised));
    };
    walk_to(fw, scheduler, StageState::Executing).map_err(PipelineError::Transition)?;
    graph
        .connect(
            fw,
            Tunnel::new(
                (scheduler, StageKind::Scheduler, SCHEDULER_OUT),
                (renderer, StageKind::Renderer, RENDERER_IN),
            ),
            settings.renderer_tunnel_timeout(),
        )
        .map_err(PipelineError::RendererTunnel)?;
    walk_to(fw, renderer, StageState::Idle).map_err(PipelineError::Transition)?;
    fw.enable_port(renderer, RENDERER_OUT)
        .map_err(PipelineError::PortEnable)?;
    let output = fw
        .use_image(renderer, RENDERER_OUT, control.image())
        .map_err(PipelineError::ImageBind)?;
    walk_to(fw, renderer, StageState::Executing).map_err(PipelineError::Transition)?;
    fw.fill_buffer(output).map_err(PipelineError::FillRequest)?;
    log::info!(
        "Decoder reported stream parameters; rendering into {}x{} image",
        control.image().width(),
        control.image().height()
    );
    Ok(())
}

/// Feed loop followed by the end-of-stream drain. A feed error wins over a
/// drain error. Port settings raised by the last buffers fed are still
/// negotiated before the drain so their pictures reach the renderer.
fn run<F: MediaFramework + ?Sized>(
    fw: &mut F,
    graph: &mut Graph,
    decoder: StageId,
    control: &PlaybackControl,
    settings: &PipelineSettings,
    stream: &mut StreamReader,
    summary: &mut SessionSummary,
) -> Result<(), PipelineError> {
    let mut held = None;
    let fed = feed(fw, graph, decoder, control, settings, stream, summary, &mut held)
        .and_then(|reason| {
            if summary.negotiations == 0 && fw.take_event(decoder, PORT_SETTINGS) {
                negotiate(fw, graph, control, settings)?;
                summary.negotiations += 1;
            }
            Ok(reason)
        });
    let drained = drain(fw, decoder, settings, held);
    graph.flush(fw);
    graph.disable_input(fw);

    let reason = fed?;
    drained?;
    summary.stop_reason = reason;
    log::info!("Decode session ended: {summary}");
    Ok(())
}

fn feed<F: MediaFramework + ?Sized>(
    fw: &mut F,
    graph: &mut Graph,
    decoder: StageId,
    control: &PlaybackControl,
    settings: &PipelineSettings,
    stream: &mut StreamReader,
    summary: &mut SessionSummary,
    held: &mut Option<InputBuffer>,
) -> Result<StopReason, PipelineError> {
    let mut first_packet = true;

    loop {
        let mut buffer = match held.take() {
            Some(buffer) => buffer,
            None => match fw
                .acquire_input_buffer(decoder, DECODER_IN, settings.input_acquire_timeout())
                .map_err(PipelineError::EmptyBuffer)?
            {
                Some(buffer) => buffer,
                None => {
                    if let Some(reason) = halted(control.command()) {
                        return Ok(reason);
                    }
                    continue;
                }
            },
        };

        if control.command() == Command::Pause {
            control.publish_state(PlaybackState::Paused);
            log::info!("Playback paused");
            let resumed_by = control.wait_while_paused(settings.pause_poll());
            log::info!("Pause ended by {resumed_by}");
        }

        if stream.is_eof() {
            if control.downgrade_devamp() {
                log::info!("End of stream after DEVAMP, stopping");
            } else if !control.command().halts_feed() {
                if let Err(e) = stream.rewind() {
                    *held = Some(buffer);
                    return Err(PipelineError::StreamRead(e));
                }
                summary.loops += 1;
                log::debug!(
                    "Looping {} (pass {})",
                    control.source_path().display(),
                    summary.loops + 1
                );
            }
        }

        if let Some(reason) = halted(control.command()) {
            *held = Some(buffer);
            return Ok(reason);
        }
        control.publish_state(PlaybackState::Playing);

        let read = match stream.fill(&mut buffer.data) {
            Ok(read) => read,
            Err(e) => {
                *held = Some(buffer);
                return Err(PipelineError::StreamRead(e));
            }
        };

        if summary.negotiations == 0 {
            let ready = if read > 0 {
                Ok(fw.take_event(decoder, PORT_SETTINGS))
            } else {
                fw.wait_for_event(decoder, PORT_SETTINGS, settings.port_settings_timeout())
                    .map(|()| true)
                    .map_err(PipelineError::PortSettingsTimeout)
            };
            let negotiated = match ready {
                Ok(true) => negotiate(fw, graph, control, settings).map(|()| true),
                other => other,
            };
            match negotiated {
                Ok(true) => summary.negotiations += 1,
                Ok(false) => {}
                Err(e) => {
                    *held = Some(buffer);
                    return Err(e);
                }
            }
        }

        if read == 0 {
            *held = Some(buffer);
            return Ok(StopReason::Exhausted);
        }

        buffer.filled = read;
        buffer.flags = if first_packet {
            BufferFlags::START_TIME
        } else {
            BufferFlags::TIME_UNKNOWN
        };
        first_packet = false;
        log::trace!(
            "Submitting buffer {} ({read} bytes, stream at {}/{})",
            buffer.index,
            stream.position(),
            stream.byte_len()
        );
        fw.empty_buffer(decoder, buffer)
            .map_err(PipelineError::EmptyBuffer)?;
        summary.buffers_submitted += 1;
        summary.bytes_submitted += read as u64;
    }
}

fn halted(command: Command) -> Option<StopReason> {
    match command {
        Command::Terminate => Some(StopReason::Terminated),
        Command::Stop => Some(StopReason::Stopped),
        _ => None,
    }
}

/// Submit an empty buffer flagged end-of-stream so the decoder drains.
fn drain<F: MediaFramework + ?Sized>(
    fw: &mut F,
    decoder: StageId,
    settings: &PipelineSettings,
    held: Option<InputBuffer>,
) -> Result<(), PipelineError> {
    let buffer = match held {
        Some(buffer) => Some(buffer),
        None => fw
            .acquire_input_buffer(decoder, DECODER_IN, settings.input_acquire_timeout())
            .map_err(PipelineError::EndOfStream)?,
    };
    let Some(mut buffer) = buffer else {
        log::warn!("No input buffer free for end-of-stream");
        return Ok(());
    };
    buffer.filled = 0;
    buffer.flags = BufferFlags::TIME_UNKNOWN | BufferFlags::EOS;
    fw.empty_buffer(decoder, buffer)
        .map_err(PipelineError::EndOfStream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::media::image::SharedImage;
    use crate::media::soft::{SoftFaults, SoftFramework, SoftStats, annexb_clip};
    use crate::settings::SoftDecoderSettings;

    const BUFFER: usize = 32;

    fn soft() -> SoftDecoderSettings {
        SoftDecoderSettings {
            frame_rate: 0.0,
            input_buffers: 2,
            input_buffer_size: BUFFER,
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

    fn clip_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn control_for(file: &tempfile::NamedTempFile, initial: Command) -> Arc<PlaybackControl> {
        Arc::new(PlaybackControl::new(
            file.path(),
            SharedImage::new(8, 8),
            initial,
        ))
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn devamp_plays_one_pass_then_stops() {
        let clip = annexb_clip(12);
        let passes = clip.len().div_ceil(BUFFER) as u64;
        let file = clip_file(&clip);
        let control = control_for(&file, Command::Devamp);
        let mut fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let summary = decode(&mut fw, &control, &quick()).unwrap();

        assert_eq!(summary.stop_reason, StopReason::Stopped);
        assert_eq!(summary.loops, 0);
        assert_eq!(summary.buffers_submitted, passes);
        assert_eq!(summary.negotiations, 1);
        assert_eq!(summary.frames_presented, 12);
        assert_eq!(control.command(), Command::Stop);

        let stats = probe.snapshot();
        // Every data buffer plus the end-of-stream marker.
        assert_eq!(stats.buffers_emptied, passes + 1);
        assert_eq!(stats.start_time_buffers, 1);
        assert_eq!(stats.eos_buffers, 1);
        assert_eq!(stats.frames_rendered, summary.frames_presented);
        assert_eq!((stats.live_stages, stats.live_tunnels), (0, 0));
        assert!(!control.image().is_bound());
    }

    #[test]
    fn single_buffer_clip_still_negotiates_and_presents() {
        let clip = annexb_clip(1);
        assert!(clip.len() <= BUFFER);
        let file = clip_file(&clip);
        let control = control_for(&file, Command::Devamp);
        let mut fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let summary = decode(&mut fw, &control, &quick()).unwrap();

        assert_eq!(summary.stop_reason, StopReason::Stopped);
        assert_eq!(summary.buffers_submitted, 1);
        assert_eq!(summary.negotiations, 1);
        assert_eq!(summary.frames_presented, 1);
        let stats = probe.snapshot();
        assert_eq!(stats.images_bound, 1);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn devamp_during_looping_finishes_the_current_pass() {
        let clip = annexb_clip(6);
        let passes = clip.len().div_ceil(BUFFER) as u64;
        let file = clip_file(&clip);
        let control = control_for(&file, Command::Play);
        let fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let session = {
            let control = control.clone();
            thread::spawn(move || {
                let mut fw = fw;
                decode(&mut fw, &control, &quick())
            })
        };
        wait_until("a second pass", || probe.snapshot().buffers_emptied > passes);
        control.set_command(Command::Devamp);

        let summary = session.join().unwrap().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Stopped);
        assert!(summary.loops >= 1);
        assert_eq!(summary.buffers_submitted % passes, 0);
        assert_eq!(summary.negotiations, 1);
        assert_eq!(control.command(), Command::Stop);
    }

    #[test]
    fn framework_is_reusable_across_sessions() {
        let file = clip_file(&annexb_clip(6));
        let mut fw = SoftFramework::new(soft());
        let probe = fw.probe();

        for _ in 0..2 {
            let control = control_for(&file, Command::Devamp);
            let summary = decode(&mut fw, &control, &quick()).unwrap();
            assert_eq!(summary.negotiations, 1);
            assert_eq!(summary.frames_presented, 6);
            assert!(!control.image().is_bound());
        }
        let stats = probe.snapshot();
        assert_eq!(stats.port_settings_events, 2);
        assert_eq!(stats.images_bound, 2);
        assert_eq!((stats.live_stages, stats.live_tunnels), (0, 0));
    }

    #[test]
    fn play_loops_until_terminated() {
        let clip = annexb_clip(6);
        let passes = clip.len().div_ceil(BUFFER) as u64;
        let file = clip_file(&clip);
        let control = control_for(&file, Command::Play);
        let fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let session = {
            let control = control.clone();
            thread::spawn(move || {
                let mut fw = fw;
                decode(&mut fw, &control, &quick())
            })
        };
        wait_until("three passes", || probe.snapshot().buffers_emptied > 3 * passes);
        assert_eq!(control.state(), PlaybackState::Playing);
        control.set_command(Command::Terminate);

        let summary = session.join().unwrap().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Terminated);
        assert!(summary.loops >= 3);
        assert_eq!(summary.negotiations, 1);
        assert_eq!(probe.snapshot().live_stages, 0);
    }

    #[test]
    fn pause_holds_submission_until_resumed() {
        let file = clip_file(&annexb_clip(6));
        let control = control_for(&file, Command::Play);
        let fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let session = {
            let control = control.clone();
            thread::spawn(move || {
                let mut fw = fw;
                decode(&mut fw, &control, &quick())
            })
        };
        wait_until("playback", || probe.snapshot().buffers_emptied > 2);
        control.set_command(Command::Pause);
        wait_until("pause", || control.state() == PlaybackState::Paused);

        let frozen = probe.snapshot().buffers_emptied;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.snapshot().buffers_emptied, frozen);
        assert_eq!(control.state(), PlaybackState::Paused);

        control.set_command(Command::Play);
        wait_until("resume", || probe.snapshot().buffers_emptied > frozen + 2);
        assert_eq!(control.state(), PlaybackState::Playing);

        control.set_command(Command::Terminate);
        assert!(session.join().unwrap().is_ok());
    }

    #[test]
    fn terminate_before_first_buffer_submits_nothing() {
        let file = clip_file(&annexb_clip(4));
        let control = control_for(&file, Command::Terminate);
        let mut fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let summary = decode(&mut fw, &control, &quick()).unwrap();
        assert_eq!(summary.stop_reason, StopReason::Terminated);
        assert_eq!(summary.buffers_submitted, 0);
        assert_eq!(summary.negotiations, 0);
        assert_eq!(control.state(), PlaybackState::Stopped);
        assert_eq!(probe.snapshot().eos_buffers, 1);
    }

    #[test]
    fn missing_file_fails_before_touching_the_framework() {
        let dir = tempfile::tempdir().unwrap();
        let control = PlaybackControl::new(
            dir.path().join("absent.h264"),
            SharedImage::new(1, 1),
            Command::Play,
        );
        let mut fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let err = decode(&mut fw, &control, &quick()).unwrap_err();
        assert_eq!(err.code(), -2);
        assert_eq!(probe.snapshot(), SoftStats::default());
    }

    #[test]
    fn each_stage_creation_failure_has_its_own_code_and_leaks_nothing() {
        let file = clip_file(&annexb_clip(2));
        for (kind, code) in [
            (StageKind::Decoder, -14),
            (StageKind::Renderer, -17),
            (StageKind::Clock, -18),
            (StageKind::Scheduler, -19),
        ] {
            let control = control_for(&file, Command::Play);
            let mut fw = SoftFramework::with_faults(
                soft(),
                SoftFaults {
                    fail_create: Some(kind),
                    ..Default::default()
                },
            );
            let probe = fw.probe();
            let err = decode(&mut fw, &control, &quick()).unwrap_err();
            assert_eq!(err.code(), code, "{kind}");
            let stats = probe.snapshot();
            assert_eq!((stats.live_stages, stats.live_tunnels), (0, 0), "{kind}");
        }
    }

    #[test]
    fn framework_init_failure_is_reported() {
        let file = clip_file(&annexb_clip(2));
        let control = control_for(&file, Command::Play);
        let mut fw = SoftFramework::with_faults(
            soft(),
            SoftFaults {
                fail_init: true,
                ..Default::default()
            },
        );
        assert_eq!(decode(&mut fw, &control, &quick()).unwrap_err().code(), -3);
    }

    #[test]
    fn rejected_image_tears_the_graph_down() {
        let file = clip_file(&annexb_clip(6));
        let control = control_for(&file, Command::Play);
        let mut fw = SoftFramework::with_faults(
            soft(),
            SoftFaults {
                reject_image: true,
                ..Default::default()
            },
        );
        let probe = fw.probe();

        let err = decode(&mut fw, &control, &quick()).unwrap_err();
        assert_eq!(err.code(), -1);
        let stats = probe.snapshot();
        assert_eq!((stats.live_stages, stats.live_tunnels), (0, 0));
        assert!(!control.image().is_bound());
    }

    #[test]
    fn renderer_tunnel_failure_is_reported() {
        let file = clip_file(&annexb_clip(6));
        let control = control_for(&file, Command::Play);
        let mut fw = SoftFramework::with_faults(
            soft(),
            SoftFaults {
                fail_tunnel_into: Some(StageKind::Renderer),
                ..Default::default()
            },
        );
        let probe = fw.probe();
        assert_eq!(decode(&mut fw, &control, &quick()).unwrap_err().code(), -12);
        assert_eq!(probe.snapshot().live_tunnels, 0);
    }

    #[test]
    fn submission_failure_mid_stream_is_reported() {
        let file = clip_file(&annexb_clip(12));
        let control = control_for(&file, Command::Play);
        let mut fw = SoftFramework::with_faults(
            soft(),
            SoftFaults {
                fail_empty_after: Some(3),
                ..Default::default()
            },
        );
        let probe = fw.probe();

        let err = decode(&mut fw, &control, &quick()).unwrap_err();
        assert_eq!(err.code(), -6);
        assert_eq!(probe.snapshot().live_stages, 0);
        assert!(!control.image().is_bound());
    }

    #[test]
    fn empty_stream_times_out_waiting_for_port_settings() {
        let file = clip_file(&[]);
        let control = control_for(&file, Command::Play);
        let mut fw = SoftFramework::new(soft());
        let probe = fw.probe();

        let err = decode(&mut fw, &control, &quick()).unwrap_err();
        assert_eq!(err.code(), -8);
        assert_eq!(probe.snapshot().live_stages, 0);
    }

    #[test]
    fn end_of_stream_reuses_the_buffer_held_by_a_failed_feed() {
        let file = clip_file(&[]);
        let control = control_for(&file, Command::Play);
        let mut fw = SoftFramework::new(SoftDecoderSettings {
            input_buffers: 1,
            ..soft()
        });
        let probe = fw.probe();

        let err = decode(&mut fw, &control, &quick()).unwrap_err();
        assert_eq!(err.code(), -8);
        assert_eq!(probe.snapshot().eos_buffers, 1);
    }

    #[test]
    fn silent_decoder_never_binds_the_image() {
        let file = clip_file(&annexb_clip(6));
        let control = control_for(&file, Command::Devamp);
        let mut fw = SoftFramework::with_faults(
            soft(),
            SoftFaults {
                suppress_port_settings: true,
                ..Default::default()
            },
        );
        let probe = fw.probe();

        let summary = decode(&mut fw, &control, &quick()).unwrap();
        assert_eq!(summary.negotiations, 0);
        assert_eq!(summary.frames_presented, 0);
        assert_eq!(probe.snapshot().images_bound, 0);
    }
}
