use thiserror::Error;

/// Errors raised while validating a problem geometry or solver configuration,
/// before any worker is spawned.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("signal axis {axis} is shorter than the atom support ({signal} < {atom})")]
    SignalTooSmall {
        axis: usize,
        signal: usize,
        atom: usize,
    },

    #[error("dictionary has {dict} channels but the signal has {signal}")]
    ChannelMismatch { dict: usize, signal: usize },

    #[error("worker grid {grid:?} does not cover {world} workers")]
    GridMismatch { grid: Vec<usize>, world: usize },

    #[error(
        "tile extent {extent} on axis {axis} must be larger than {min} \
         (too many workers for this signal)"
    )]
    TileTooSmall {
        axis: usize,
        extent: usize,
        min: usize,
    },

    #[error("segment extent {extent} on axis {axis} must be at least {min}")]
    SegmentTooSmall {
        axis: usize,
        extent: usize,
        min: usize,
    },

    #[error("unknown strategy `{0}`, expected one of greedy, random, lgcd")]
    UnknownStrategy(String),

    #[error("automatic worker grids are only supported for 1-d and 2-d signals, got {0} axes")]
    AutoGridUnsupported(usize),

    #[error("tensor payload of {len} values does not match shape {shape:?}")]
    BadTensorShape { shape: Vec<usize>, len: usize },

    #[error("{0}")]
    BadShape(String),
}
