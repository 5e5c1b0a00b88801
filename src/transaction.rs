//! Capture/generate coordination.
//!
//! Duplex protocols generate the traffic they observe, so the capture has to be
//! armed before the TX buffer is pushed or the first edges are lost. A worker
//! thread arms the acquisition, reports back over a one-shot channel and then
//! blocks in `get_samples`; the caller only pushes once that report arrives.
//! A failed transaction cancels its worker and waits for it to exit before the
//! bus is released, so a late arm never steals the next transaction's samples.
//!
//! ```text
//! Idle -> Arming -> Capturing -> Complete
//!            |          |    \-> Failed (decode error)
//!            \----------\------> Failed (timeout / channel error)
//! ```

use crate::digital_channel::{ChannelError, DigitalBus, DigitalChannel, Direction};
use crate::error::ProtocolError;
use crate::sample::SampleBuffer;
use crate::trigger_config::DigitalTrigger;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Arming,
    Capturing,
    Complete,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Idle => "idle",
            TransactionState::Arming => "arming",
            TransactionState::Capturing => "capturing",
            TransactionState::Complete => "complete",
            TransactionState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds for the two blocking waits of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTimeouts {
    /// Time allowed for the worker to arm the acquisition.
    pub arm: Duration,
    /// Time allowed for the capture to complete once armed.
    pub capture: Duration,
}

impl TransactionTimeouts {
    pub const DEFAULT_ARM: Duration = Duration::from_secs(1);
    pub const DEFAULT_CAPTURE: Duration = Duration::from_secs(5);

    pub fn new(arm: Duration, capture: Duration) -> Self {
        Self { arm, capture }
    }
}

impl Default for TransactionTimeouts {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ARM, Self::DEFAULT_CAPTURE)
    }
}

type CaptureResult = Result<SampleBuffer, ChannelError>;

// interval between stop requests while a cancelled worker winds down
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// One capture, optionally paired with a generated TX buffer.
pub struct Transaction<C: DigitalChannel + 'static> {
    bus: Arc<DigitalBus<C>>,
    capture_len: usize,
    sample_rate: Option<u32>,
    trigger: Option<DigitalTrigger>,
    timeouts: TransactionTimeouts,
    state: TransactionState,
}

impl<C: DigitalChannel + 'static> Transaction<C> {
    pub fn new(bus: Arc<DigitalBus<C>>, capture_len: usize, timeouts: TransactionTimeouts) -> Self {
        Self {
            bus,
            capture_len,
            sample_rate: None,
            trigger: None,
            timeouts,
            state: TransactionState::Idle,
        }
    }

    /// Sample rate programmed on the channel before arming. Descriptors sharing
    /// a channel run at different rates, so every transaction sets its own.
    pub fn with_sample_rate(mut self, rate_hz: u32) -> Self {
        self.sample_rate = Some(rate_hz);
        self
    }

    /// Trigger applied to the channel before arming.
    pub fn with_trigger(mut self, trigger: DigitalTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn capture_len(&self) -> usize {
        self.capture_len
    }

    /// Arm the capture, push `tx` once armed and return the captured samples.
    pub fn duplex(&mut self, tx: SampleBuffer) -> Result<SampleBuffer, ProtocolError> {
        self.run(Some(tx))
    }

    /// Capture traffic generated by someone else. There is nothing to race
    /// against, so the arming report is not waited for.
    pub fn capture(&mut self) -> Result<SampleBuffer, ProtocolError> {
        self.run(None)
    }

    /// Hand the capture to a decoder and record the outcome.
    pub fn complete<T>(
        &mut self,
        decode: impl FnOnce() -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let result = decode();
        match &result {
            Ok(_) => self.transition(TransactionState::Complete),
            Err(e) => {
                log::debug!("Decoding failed: {}", e);
                self.transition(TransactionState::Failed);
            }
        }
        result
    }

    fn transition(&mut self, next: TransactionState) {
        log::trace!("Transaction {} -> {}", self.state, next);
        self.state = next;
    }

    fn run(&mut self, tx: Option<SampleBuffer>) -> Result<SampleBuffer, ProtocolError> {
        let result = self.execute(tx);
        if result.is_err() {
            self.transition(TransactionState::Failed);
        }
        result
    }

    fn execute(&mut self, tx: Option<SampleBuffer>) -> Result<SampleBuffer, ProtocolError> {
        let bus = Arc::clone(&self.bus);
        let _guard = bus.lock();

        if let Some(rate) = self.sample_rate {
            if tx.is_some() {
                bus.set_sample_rate(Direction::Output, rate)?;
            }
            bus.set_sample_rate(Direction::Input, rate)?;
        }
        if let Some(trigger) = &self.trigger {
            trigger.apply(bus.channel())?;
        }

        self.transition(TransactionState::Arming);
        let worker = CaptureWorker::spawn(Arc::clone(&bus), self.capture_len)?;
        let result = self.drive(&bus, &worker, tx);
        if result.is_ok() {
            worker.join();
        } else {
            worker.cancel(&bus);
        }
        result
    }

    fn drive(
        &mut self,
        bus: &DigitalBus<C>,
        worker: &CaptureWorker,
        tx: Option<SampleBuffer>,
    ) -> Result<SampleBuffer, ProtocolError> {
        match tx {
            Some(tx) => {
                self.wait_armed(worker)?;
                self.transition(TransactionState::Capturing);
                log::trace!("Pushing {} samples", tx.len());
                bus.channel().push(tx)?;
            }
            None => self.transition(TransactionState::Capturing),
        }

        self.wait_captured(worker)
    }

    fn wait_armed(&self, worker: &CaptureWorker) -> Result<(), ProtocolError> {
        match worker.armed.recv_timeout(self.timeouts.arm) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout {
                state: TransactionState::Arming,
                waited: self.timeouts.arm,
            }),
            // the worker gave up before arming; its result carries the reason
            Err(RecvTimeoutError::Disconnected) => match worker.captured.recv() {
                Ok(Err(e)) => Err(e.into()),
                Ok(Ok(_)) | Err(_) => Err(ProtocolError::CaptureAborted),
            },
        }
    }

    fn wait_captured(&self, worker: &CaptureWorker) -> Result<SampleBuffer, ProtocolError> {
        let start = Instant::now();
        match worker.captured.recv_timeout(self.timeouts.capture) {
            Ok(Ok(samples)) => {
                log::trace!(
                    "Captured {} samples in {:?}",
                    samples.len(),
                    start.elapsed()
                );
                if samples.len() != self.capture_len {
                    log::warn!(
                        "Requested {} samples but the channel delivered {}",
                        self.capture_len,
                        samples.len()
                    );
                }
                Ok(samples)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout {
                state: TransactionState::Capturing,
                waited: self.timeouts.capture,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::CaptureAborted),
        }
    }
}

/// Capture thread of one transaction.
struct CaptureWorker {
    armed: Receiver<()>,
    captured: Receiver<CaptureResult>,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CaptureWorker {
    fn spawn<C: DigitalChannel + 'static>(
        bus: Arc<DigitalBus<C>>,
        n_samples: usize,
    ) -> Result<Self, ProtocolError> {
        let (armed_tx, armed) = mpsc::sync_channel(1);
        let (result_tx, captured) = mpsc::sync_channel(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancelled);
        let handle = thread::Builder::new()
            .name("bitbang-capture".to_string())
            .spawn(move || {
                let channel = bus.channel();
                let result = channel.start_acquisition(n_samples).and_then(|()| {
                    // nobody listens for capture-only transactions
                    let _ = armed_tx.send(());
                    if flag.load(Ordering::SeqCst) {
                        // armed after the caller gave up
                        channel.stop_acquisition()?;
                        return Err(ChannelError::Aborted);
                    }
                    channel.get_samples(n_samples)
                });
                let _ = result_tx.send(result);
            })?;

        Ok(Self {
            armed,
            captured,
            cancelled,
            handle,
        })
    }

    /// Stop the acquisition until the worker reports back, then join it.
    fn cancel<C: DigitalChannel>(self, bus: &DigitalBus<C>) {
        self.cancelled.store(true, Ordering::SeqCst);
        loop {
            abort(bus);
            match self.captured.recv_timeout(CANCEL_POLL) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.join();
    }

    fn join(self) {
        if self.handle.join().is_err() {
            log::warn!("Capture worker panicked");
        }
    }
}

fn abort<C: DigitalChannel>(bus: &DigitalBus<C>) {
    if let Err(e) = bus.channel().stop_acquisition() {
        log::warn!("Failed to stop acquisition: {}", e);
    }
}
