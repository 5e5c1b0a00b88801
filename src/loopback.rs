//! In-memory [`DigitalChannel`] for tests, demos and offline development.
//!
//! Samples pushed while an acquisition is running become the captured samples,
//! optionally rewritten by jumper wires between lines or by a responder that
//! plays the part of the remote device. Every call is recorded so tests can
//! assert on ordering. Trigger settings are recorded but not evaluated: a
//! capture simply starts at the first sample pushed after arming.

use crate::digital_channel::{ChannelError, Direction, DigitalChannel, OutputMode};
use crate::sample::{Pin, SampleBuffer, SampleWord};
use crate::trigger_config::{TriggerCondition, TriggerMode};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Builds the RX buffer the remote device would produce for a TX buffer.
pub type Responder = Box<dyn Fn(&SampleBuffer) -> SampleBuffer + Send + Sync>;

/// A recorded call on a [`LoopbackChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    SetDirection(Pin, Direction),
    Enable(Pin, bool),
    SetOutputMode(Pin, OutputMode),
    SetValue(Pin, bool),
    SetSampleRate(Direction, u32),
    SetCyclic(bool),
    Push(usize),
    StartAcquisition(usize),
    GetSamples(usize),
    StopAcquisition,
    SetTriggerCondition(Pin, TriggerCondition),
    SetTriggerDelay(i32),
    SetTriggerMode(TriggerMode),
}

#[derive(Default)]
struct LoopbackState {
    calls: Vec<ChannelCall>,
    pushed: Vec<SampleBuffer>,
    scheduled: VecDeque<SampleBuffer>,
    pending: SampleBuffer,
    acquiring: bool,
    idle: SampleWord,
    // bumped by stop_acquisition, cancels waiters that started before it
    generation: u64,
}

pub struct LoopbackChannel {
    state: Mutex<LoopbackState>,
    samples_ready: Condvar,
    wires: Vec<(Pin, Pin)>,
    responder: Option<Responder>,
    arm_delay: Duration,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState::default()),
            samples_ready: Condvar::new(),
            wires: Vec::new(),
            responder: None,
            arm_delay: Duration::ZERO,
        }
    }

    /// Connect line `from` to line `to` in every captured sample.
    pub fn with_wire(mut self, from: Pin, to: Pin) -> Self {
        self.wires.push((from, to));
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&SampleBuffer) -> SampleBuffer + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Make `start_acquisition` take this long before the capture is armed.
    pub fn with_arm_delay(mut self, delay: Duration) -> Self {
        self.arm_delay = delay;
        self
    }

    /// Queue a buffer to be returned by the next acquisition, as if an external
    /// device had sent it.
    pub fn schedule_capture(&self, samples: SampleBuffer) {
        self.state().scheduled.push_back(samples);
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.state().calls.clone()
    }

    /// TX buffers in the order they were pushed.
    pub fn pushed(&self) -> Vec<SampleBuffer> {
        self.state().pushed.clone()
    }

    /// Current static levels of the lines.
    pub fn idle(&self) -> SampleWord {
        self.state().idle
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: ChannelCall) {
        self.state().calls.push(call);
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalChannel for LoopbackChannel {
    fn set_direction(&self, pin: Pin, direction: Direction) -> Result<(), ChannelError> {
        self.record(ChannelCall::SetDirection(pin, direction));
        Ok(())
    }

    fn enable(&self, pin: Pin, enabled: bool) -> Result<(), ChannelError> {
        self.record(ChannelCall::Enable(pin, enabled));
        Ok(())
    }

    fn set_output_mode(&self, pin: Pin, mode: OutputMode) -> Result<(), ChannelError> {
        self.record(ChannelCall::SetOutputMode(pin, mode));
        Ok(())
    }

    fn set_value(&self, pin: Pin, level: bool) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.calls.push(ChannelCall::SetValue(pin, level));
        state.idle.set_level(pin, level);
        Ok(())
    }

    fn set_sample_rate(&self, direction: Direction, rate_hz: u32) -> Result<u32, ChannelError> {
        self.record(ChannelCall::SetSampleRate(direction, rate_hz));
        Ok(rate_hz)
    }

    fn set_cyclic(&self, cyclic: bool) -> Result<(), ChannelError> {
        self.record(ChannelCall::SetCyclic(cyclic));
        Ok(())
    }

    fn push(&self, buffer: SampleBuffer) -> Result<(), ChannelError> {
        let mut rx = match &self.responder {
            Some(responder) => responder(&buffer),
            None => buffer.clone(),
        };
        for &(from, to) in &self.wires {
            rx.copy_line(from, to);
        }

        let mut state = self.state();
        state.calls.push(ChannelCall::Push(buffer.len()));
        if let Some(last) = rx.last() {
            state.idle = last;
        }
        if state.acquiring {
            state.pending.extend_from(&rx);
            self.samples_ready.notify_all();
        } else {
            log::trace!("Loopback dropped {} samples, no acquisition armed", rx.len());
        }
        state.pushed.push(buffer);
        Ok(())
    }

    fn start_acquisition(&self, n_samples: usize) -> Result<(), ChannelError> {
        let generation = self.state().generation;
        if !self.arm_delay.is_zero() {
            thread::sleep(self.arm_delay);
        }

        let mut state = self.state();
        if state.generation != generation {
            return Err(ChannelError::Aborted);
        }
        state.calls.push(ChannelCall::StartAcquisition(n_samples));
        state.pending = state.scheduled.pop_front().unwrap_or_default();
        state.acquiring = true;
        if !state.pending.is_empty() {
            self.samples_ready.notify_all();
        }
        Ok(())
    }

    fn get_samples(&self, n_samples: usize) -> Result<SampleBuffer, ChannelError> {
        let mut state = self.state();
        state.calls.push(ChannelCall::GetSamples(n_samples));
        let generation = state.generation;
        while state.pending.is_empty() && state.generation == generation {
            state = self
                .samples_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation != generation {
            return Err(ChannelError::Aborted);
        }

        let mut samples = std::mem::take(&mut state.pending);
        state.acquiring = false;
        samples.truncate(n_samples);
        samples.hold_to_len(n_samples, state.idle);
        Ok(samples)
    }

    fn stop_acquisition(&self) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.calls.push(ChannelCall::StopAcquisition);
        state.generation += 1;
        state.acquiring = false;
        state.pending = SampleBuffer::new();
        self.samples_ready.notify_all();
        Ok(())
    }

    fn set_trigger_condition(
        &self,
        pin: Pin,
        condition: TriggerCondition,
    ) -> Result<(), ChannelError> {
        self.record(ChannelCall::SetTriggerCondition(pin, condition));
        Ok(())
    }

    fn set_trigger_delay(&self, delay: i32) -> Result<(), ChannelError> {
        self.record(ChannelCall::SetTriggerDelay(delay));
        Ok(())
    }

    fn set_trigger_mode(&self, mode: TriggerMode) -> Result<(), ChannelError> {
        self.record(ChannelCall::SetTriggerMode(mode));
        Ok(())
    }
}
