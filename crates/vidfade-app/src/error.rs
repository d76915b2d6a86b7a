use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::media::framework::{Endpoint, StageEvent, StageKind, StageState};

/// Destination image misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("image is already bound to an output port")]
    AlreadyBound,
    #[error("image is still bound to an output port")]
    StillBound,
    #[error("image has been released")]
    Released,
}

/// Failure reported by a media framework call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameworkError {
    #[error("media framework is not initialised")]
    NotInitialised,
    #[error("media framework refused to initialise: {0}")]
    Init(String),
    #[error("failed to create {0} stage")]
    CreateStage(StageKind),
    #[error("unknown stage handle {0}")]
    UnknownStage(u32),
    #[error("{kind}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        kind: StageKind,
        from: StageState,
        to: StageState,
    },
    #[error("{kind} port {port} does not exist")]
    NoSuchPort { kind: StageKind, port: u32 },
    #[error("{kind} rejected configuration: {reason}")]
    Configure { kind: StageKind, reason: String },
    #[error("tunnel {upstream} -> {downstream} refused")]
    Tunnel {
        upstream: Endpoint,
        downstream: Endpoint,
    },
    #[error("{kind} port {port} has no buffers enabled")]
    PortBuffers { kind: StageKind, port: u32 },
    #[error("{kind} refused buffer exchange: {reason}")]
    BufferExchange { kind: StageKind, reason: String },
    #[error("timed out after {timeout:?} waiting for {event:?} on {kind}")]
    EventTimeout {
        kind: StageKind,
        event: StageEvent,
        timeout: Duration,
    },
    #[error("{kind} rejected destination image: {source}")]
    Image {
        kind: StageKind,
        #[source]
        source: ImageError,
    },
}

/// Coarse class of a decode-session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    StreamIo,
    PipelineInit,
    RuntimeExchange,
    ImageBind,
}

/// Why a decode session ended early. Every variant maps to a stable status code.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot open {path}: {source}")]
    StreamOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading stream: {0}")]
    StreamRead(#[source] std::io::Error),
    #[error("media framework init failed: {0}")]
    FrameworkInit(#[source] FrameworkError),
    #[error("decoder creation failed: {0}")]
    DecoderCreate(#[source] FrameworkError),
    #[error("renderer creation failed: {0}")]
    RendererCreate(#[source] FrameworkError),
    #[error("clock creation failed: {0}")]
    ClockCreate(#[source] FrameworkError),
    #[error("scheduler creation failed: {0}")]
    SchedulerCreate(#[source] FrameworkError),
    #[error("clock configuration failed: {0}")]
    ClockConfig(#[source] FrameworkError),
    #[error("clock tunnel setup failed: {0}")]
    ClockTunnel(#[source] FrameworkError),
    #[error("decoder input setup failed: {0}")]
    DecoderInput(#[source] FrameworkError),
    #[error("decoder tunnel setup failed: {0}")]
    DecoderTunnel(#[source] FrameworkError),
    #[error("renderer tunnel setup failed: {0}")]
    RendererTunnel(#[source] FrameworkError),
    #[error("no port settings from decoder: {0}")]
    PortSettingsTimeout(#[source] FrameworkError),
    #[error("stage state change failed: {0}")]
    Transition(#[source] FrameworkError),
    #[error("renderer output port enable failed: {0}")]
    PortEnable(#[source] FrameworkError),
    #[error("renderer rejected destination image: {0}")]
    ImageBind(#[source] FrameworkError),
    #[error("output fill request failed: {0}")]
    FillRequest(#[source] FrameworkError),
    #[error("buffer submission failed: {0}")]
    EmptyBuffer(#[source] FrameworkError),
    #[error("end-of-stream submission failed: {0}")]
    EndOfStream(#[source] FrameworkError),
}

impl PipelineError {
    /// Status code reported when the worker exits.
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::ImageBind(_) => -1,
            PipelineError::StreamOpen { .. } => -2,
            PipelineError::FrameworkInit(_) => -3,
            PipelineError::FillRequest(_) => -4,
            PipelineError::StreamRead(_) => -5,
            PipelineError::EmptyBuffer(_) => -6,
            PipelineError::DecoderTunnel(_) => -7,
            PipelineError::PortSettingsTimeout(_) => -8,
            PipelineError::PortEnable(_) => -9,
            PipelineError::Transition(_) => -10,
            PipelineError::RendererTunnel(_) => -12,
            PipelineError::ClockConfig(_) => -13,
            PipelineError::DecoderCreate(_) => -14,
            PipelineError::ClockTunnel(_) => -15,
            PipelineError::DecoderInput(_) => -16,
            PipelineError::RendererCreate(_) => -17,
            PipelineError::ClockCreate(_) => -18,
            PipelineError::SchedulerCreate(_) => -19,
            PipelineError::EndOfStream(_) => -20,
        }
    }

    pub fn kind(&self) -> PipelineErrorKind {
        match self {
            PipelineError::StreamOpen { .. } | PipelineError::StreamRead(_) => {
                PipelineErrorKind::StreamIo
            }
            PipelineError::FrameworkInit(_)
            | PipelineError::DecoderCreate(_)
            | PipelineError::RendererCreate(_)
            | PipelineError::ClockCreate(_)
            | PipelineError::SchedulerCreate(_)
            | PipelineError::ClockConfig(_)
            | PipelineError::DecoderInput(_) => PipelineErrorKind::PipelineInit,
            PipelineError::ImageBind(_) => PipelineErrorKind::ImageBind,
            PipelineError::ClockTunnel(_)
            | PipelineError::DecoderTunnel(_)
            | PipelineError::RendererTunnel(_)
            | PipelineError::PortSettingsTimeout(_)
            | PipelineError::PortEnable(_)
            | PipelineError::Transition(_)
            | PipelineError::FillRequest(_)
            | PipelineError::EmptyBuffer(_)
            | PipelineError::EndOfStream(_) => PipelineErrorKind::RuntimeExchange,
        }
    }

    /// Creation failure for the given stage, each with its own code.
    pub fn stage_create(kind: StageKind, source: FrameworkError) -> Self {
        match kind {
            StageKind::Decoder => PipelineError::DecoderCreate(source),
            StageKind::Renderer => PipelineError::RendererCreate(source),
            StageKind::Clock => PipelineError::ClockCreate(source),
            StageKind::Scheduler => PipelineError::SchedulerCreate(source),
        }
    }
}

/// Process-level failures surfaced by `main`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("usage: {program} <filename>")]
    Usage { program: String },
    #[error("failed to acquire {resource}: {reason}")]
    ResourceInit {
        resource: &'static str,
        reason: String,
    },
    #[error("decode worker failed with code {code}: {reason}")]
    WorkerFailed { code: i32, reason: String },
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Usage { .. } => 1,
            AppError::ResourceInit { .. } => 2,
            AppError::WorkerFailed { .. } => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused(kind: StageKind) -> FrameworkError {
        FrameworkError::CreateStage(kind)
    }

    #[test]
    fn stage_creation_codes_are_distinct() {
        let codes: Vec<i32> = [
            StageKind::Decoder,
            StageKind::Renderer,
            StageKind::Clock,
            StageKind::Scheduler,
        ]
        .into_iter()
        .map(|k| PipelineError::stage_create(k, refused(k)).code())
        .collect();
        assert_eq!(codes, vec![-14, -17, -18, -19]);
        for kind in [StageKind::Decoder, StageKind::Scheduler] {
            assert_eq!(
                PipelineError::stage_create(kind, refused(kind)).kind(),
                PipelineErrorKind::PipelineInit
            );
        }
    }

    #[test]
    fn runtime_failures_are_classified() {
        let err = PipelineError::EmptyBuffer(FrameworkError::NotInitialised);
        assert_eq!(err.code(), -6);
        assert_eq!(err.kind(), PipelineErrorKind::RuntimeExchange);

        let err = PipelineError::ImageBind(FrameworkError::Image {
            kind: StageKind::Renderer,
            source: ImageError::AlreadyBound,
        });
        assert_eq!(err.code(), -1);
        assert_eq!(err.kind(), PipelineErrorKind::ImageBind);

        let err = PipelineError::StreamOpen {
            path: PathBuf::from("missing.h264"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.code(), -2);
        assert_eq!(err.kind(), PipelineErrorKind::StreamIo);
    }

    #[test]
    fn usage_error_exits_with_one() {
        let err = AppError::Usage {
            program: "vidfade".into(),
        };
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "usage: vidfade <filename>");
    }
}
