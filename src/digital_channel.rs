//! Contract of the digital I/O channel the protocol engine drives.
//!
//! The engine never talks to a device directly. Everything it needs from the
//! instrument (pin setup, sample rates, pushing a TX buffer, capturing an RX
//! buffer, hardware trigger) goes through [`DigitalChannel`]. Implementations are
//! shared between the caller thread and the capture worker, hence `&self`
//! receivers and the `Send + Sync` bound.

use crate::sample::{Pin, SampleBuffer};
use crate::trigger_config::{TriggerCondition, TriggerMode};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    OpenDrain,
    PushPull,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::OpenDrain => "open-drain",
            OutputMode::PushPull => "push-pull",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pin {pin} is not available on this channel")]
    PinUnavailable { pin: Pin },

    #[error("Operation '{operation}' is not supported by this channel")]
    Unsupported { operation: &'static str },

    #[error("Acquisition aborted")]
    Aborted,

    #[error("Device error: {0}")]
    Device(String),
}

/// Digital GPIO block of the instrument.
pub trait DigitalChannel: Send + Sync {
    fn set_direction(&self, pin: Pin, direction: Direction) -> Result<(), ChannelError>;

    fn enable(&self, pin: Pin, enabled: bool) -> Result<(), ChannelError>;

    fn set_output_mode(&self, pin: Pin, mode: OutputMode) -> Result<(), ChannelError>;

    /// Drive a static level on an output pin (used for idle levels).
    fn set_value(&self, pin: Pin, level: bool) -> Result<(), ChannelError>;

    /// Program the sample rate of one direction, returning the rate in effect.
    fn set_sample_rate(&self, direction: Direction, rate_hz: u32) -> Result<u32, ChannelError>;

    fn set_cyclic(&self, cyclic: bool) -> Result<(), ChannelError>;

    /// Hand a TX buffer to the hardware queue. Blocks until accepted.
    fn push(&self, buffer: SampleBuffer) -> Result<(), ChannelError>;

    /// Arm the capture of `n_samples` samples.
    fn start_acquisition(&self, n_samples: usize) -> Result<(), ChannelError>;

    /// Block until `n_samples` samples have been captured.
    fn get_samples(&self, n_samples: usize) -> Result<SampleBuffer, ChannelError>;

    /// Cancel a running acquisition; a blocked `get_samples` must return.
    fn stop_acquisition(&self) -> Result<(), ChannelError>;

    fn set_trigger_condition(
        &self,
        pin: Pin,
        condition: TriggerCondition,
    ) -> Result<(), ChannelError>;

    /// Trigger delay in samples; negative values keep pre-trigger samples.
    fn set_trigger_delay(&self, delay: i32) -> Result<(), ChannelError>;

    fn set_trigger_mode(&self, mode: TriggerMode) -> Result<(), ChannelError>;
}

/// A digital channel shared by protocol descriptors.
///
/// Descriptors bound to the same channel run their hardware phase under one
/// transaction lock, so their pushes and captures never interleave.
pub struct DigitalBus<C> {
    channel: C,
    transaction_lock: Mutex<()>,
}

impl<C: DigitalChannel> DigitalBus<C> {
    pub fn new(channel: C) -> Arc<Self> {
        Arc::new(Self {
            channel,
            transaction_lock: Mutex::new(()),
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.transaction_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configure `pin` as an enabled output in the given mode.
    pub(crate) fn setup_output(&self, pin: Pin, mode: OutputMode) -> Result<(), ChannelError> {
        log::trace!("Configuring {} as {} output", pin, mode.as_str());
        self.channel.set_direction(pin, Direction::Output)?;
        self.channel.enable(pin, true)?;
        self.channel.set_output_mode(pin, mode)
    }

    /// Program the sample rate of `direction`, warning when the channel settles
    /// on a different one.
    pub(crate) fn set_sample_rate(&self, direction: Direction, rate_hz: u32) -> Result<u32, ChannelError> {
        let actual = self.channel.set_sample_rate(direction, rate_hz)?;
        if actual != rate_hz {
            log::warn!(
                "Requested {} sample rate {} Hz, channel runs at {} Hz",
                direction.as_str(),
                rate_hz,
                actual
            );
        }
        Ok(actual)
    }

    pub(crate) fn setup_input(&self, pin: Pin) -> Result<(), ChannelError> {
        log::trace!("Configuring {} as input", pin);
        self.channel.set_direction(pin, Direction::Input)?;
        self.channel.enable(pin, true)
    }
}
