//! UART on a single digital line.
//!
//! Writes push a generated buffer without capturing anything. Reads capture
//! traffic from the remote device and decode it best-effort: framing and parity
//! anomalies are counted, never returned as errors.

use crate::capture::Capture;
use crate::digital_channel::{DigitalBus, DigitalChannel, Direction, OutputMode};
use crate::error::ProtocolError;
use crate::sample::{Pin, SampleBuffer, SampleWord};
use crate::timing::Timing;
use crate::transaction::{Transaction, TransactionTimeouts};
use crate::trigger_config::DigitalTrigger;
use std::sync::Arc;

/// Samples generated per UART bit.
pub const SAMPLES_PER_CYCLE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartParity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl UartParity {
    /// Level of the parity bit for `data`, `None` when parity is disabled.
    pub fn bit(self, data: u8) -> Option<bool> {
        let ones = data.count_ones();
        match self {
            UartParity::None => None,
            UartParity::Odd => Some(ones % 2 == 0),
            UartParity::Even => Some(ones % 2 != 0),
            UartParity::Mark => Some(true),
            UartParity::Space => Some(false),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UartParity::None => "none",
            UartParity::Odd => "odd",
            UartParity::Even => "even",
            UartParity::Mark => "mark",
            UartParity::Space => "space",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UartStopBits {
    #[default]
    One,
    OneAndAHalf,
    Two,
}

impl UartStopBits {
    pub fn half_bits(self) -> usize {
        match self {
            UartStopBits::One => 2,
            UartStopBits::OneAndAHalf => 3,
            UartStopBits::Two => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartConfig {
    pub pin: Pin,
    pub baud_rate: u32,
    pub bits_number: u8,
    pub parity: UartParity,
    pub stop_bits: UartStopBits,
    pub timeouts: TransactionTimeouts,
}

impl UartConfig {
    /// 8N1
    pub fn new(pin: Pin, baud_rate: u32) -> Self {
        Self {
            pin,
            baud_rate,
            bits_number: 8,
            parity: UartParity::None,
            stop_bits: UartStopBits::One,
            timeouts: TransactionTimeouts::default(),
        }
    }

    pub fn bits_number(mut self, bits: u8) -> Self {
        self.bits_number = bits;
        self
    }

    pub fn parity(mut self, parity: UartParity) -> Self {
        self.parity = parity;
        self
    }

    pub fn stop_bits(mut self, stop_bits: UartStopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn timeouts(mut self, timeouts: TransactionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(5..=8).contains(&self.bits_number) {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "UART data bits must be between 5 and 8, got {}",
                self.bits_number
            )));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::InvalidConfiguration(
                "UART baud rate must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn data_mask(&self) -> u8 {
        (0xFFu16 >> 8u16.saturating_sub(u16::from(self.bits_number))) as u8
    }
}

/// Field layout of one UART character, in samples.
#[derive(Debug, Clone, Copy)]
struct CharacterLayout {
    bits_number: u8,
    data_mask: u8,
    parity: UartParity,
    samples_per_bit: usize,
    stop_len: usize,
}

impl CharacterLayout {
    fn new(config: &UartConfig, timing: &Timing) -> Self {
        Self {
            bits_number: config.bits_number.min(8),
            data_mask: config.data_mask(),
            parity: config.parity,
            samples_per_bit: timing.samples_per_bit(),
            stop_len: timing.samples_per_half_bit() * config.stop_bits.half_bits(),
        }
    }

    fn len(&self) -> usize {
        let parity_bits = usize::from(self.parity != UartParity::None);
        self.samples_per_bit * (1 + usize::from(self.bits_number) + parity_bits) + self.stop_len
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UartEncoder {
    pin: Pin,
    layout: CharacterLayout,
}

impl UartEncoder {
    pub fn new(config: &UartConfig, timing: &Timing) -> Self {
        Self {
            pin: config.pin,
            layout: CharacterLayout::new(config, timing),
        }
    }

    pub fn frame_sample_count(&self, bytes: usize) -> usize {
        bytes * self.layout.len()
    }

    pub fn encode(&self, data: &[u8]) -> SampleBuffer {
        let layout = &self.layout;
        let high = SampleWord::LOW.with_level(self.pin, true);
        let low = SampleWord::LOW;
        let level = |bit: bool| if bit { high } else { low };

        let mut buffer = SampleBuffer::with_capacity(self.frame_sample_count(data.len()));
        for &byte in data {
            let byte = byte & layout.data_mask;
            buffer.push_repeat(low, layout.samples_per_bit);
            for bit in 0..layout.bits_number {
                buffer.push_repeat(level((byte >> bit) & 1 == 1), layout.samples_per_bit);
            }
            if let Some(parity) = layout.parity.bit(byte) {
                buffer.push_repeat(level(parity), layout.samples_per_bit);
            }
            buffer.push_repeat(high, layout.stop_len);
        }
        buffer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartByte {
    pub value: u8,
    /// Start, parity and stop anomalies seen while decoding this byte.
    pub errors: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UartReading {
    pub bytes: Vec<UartByte>,
    /// Bytes whose start bit never showed up in the capture.
    pub missing: usize,
}

impl UartReading {
    pub fn data(&self) -> Vec<u8> {
        self.bytes.iter().map(|byte| byte.value).collect()
    }

    /// Anomalies of this reading; a missing byte counts as one start error.
    pub fn error_count(&self) -> u32 {
        self.bytes.iter().map(|byte| byte.errors).sum::<u32>() + self.missing as u32
    }
}

/// Cursor over the levels of one line. Past the end of the capture the line
/// reads as idle (high).
struct LineReader<'a> {
    samples: &'a SampleBuffer,
    pin: Pin,
    cursor: usize,
}

impl<'a> LineReader<'a> {
    fn new(samples: &'a SampleBuffer, pin: Pin) -> Self {
        Self {
            samples,
            pin,
            cursor: 0,
        }
    }

    fn level(&self, index: usize) -> bool {
        self.samples.level(index, self.pin).unwrap_or(true)
    }

    /// Skip the idle line up to the next low sample.
    fn seek_start(&mut self) -> bool {
        while self.cursor < self.samples.len() && self.level(self.cursor) {
            self.cursor += 1;
        }
        self.cursor < self.samples.len()
    }

    /// Majority level over the next `width` samples. When the window is cut by
    /// an edge the cursor follows it, so drift does not accumulate over a frame.
    fn read_field(&mut self, width: usize) -> bool {
        if width == 0 {
            return true;
        }
        let start = self.cursor;
        let end = start + width;
        let highs = (start..end).filter(|&i| self.level(i)).count();
        let value = match (2 * highs).cmp(&width) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.level(start + width / 2),
        };

        let len = self.samples.len();
        let trailing = (start..end).rev().take_while(|&i| self.level(i) != value).count();
        let leading = (start..end).take_while(|&i| self.level(i) != value).count();
        self.cursor = if trailing > 0 {
            // next field started early, inside this window
            end - trailing
        } else if leading > 0 {
            // this field started late, extend past the window
            let extra = (end..len).take_while(|&i| self.level(i) == value).count();
            (end + extra.min(leading)).min(len.max(end))
        } else {
            end
        };
        value
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UartDecoder {
    pin: Pin,
    layout: CharacterLayout,
}

impl UartDecoder {
    pub fn new(config: &UartConfig, timing: &Timing) -> Self {
        Self {
            pin: config.pin,
            layout: CharacterLayout::new(config, timing),
        }
    }

    pub fn decode(&self, samples: &SampleBuffer, expected: usize) -> UartReading {
        let layout = &self.layout;
        let mut reader = LineReader::new(samples, self.pin);
        let mut reading = UartReading::default();

        while reading.bytes.len() < expected {
            if !reader.seek_start() {
                reading.missing = expected - reading.bytes.len();
                break;
            }

            let mut errors = 0;
            if reader.read_field(layout.samples_per_bit) {
                errors += 1;
            }
            let mut value = 0u8;
            for bit in 0..layout.bits_number {
                if reader.read_field(layout.samples_per_bit) {
                    value |= 1 << bit;
                }
            }
            if let Some(expected_parity) = layout.parity.bit(value) {
                if reader.read_field(layout.samples_per_bit) != expected_parity {
                    errors += 1;
                }
            }
            if !reader.read_field(layout.stop_len) {
                errors += 1;
            }

            reading.bytes.push(UartByte { value, errors });
        }

        reading
    }
}

pub struct Uart<C: DigitalChannel + 'static> {
    bus: Arc<DigitalBus<C>>,
    config: UartConfig,
    timing: Timing,
    encoder: UartEncoder,
    decoder: UartDecoder,
    total_errors: u32,
    last_capture: Option<Capture>,
}

impl<C: DigitalChannel + 'static> Uart<C> {
    pub fn init(bus: Arc<DigitalBus<C>>, config: UartConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        let timing = Timing::resolve(config.baud_rate, SAMPLES_PER_CYCLE);
        log::debug!(
            "UART on {}: {} baud ({}{}) at {} Hz sample rate",
            config.pin,
            timing.bit_rate,
            config.bits_number,
            config.parity.as_str(),
            timing.sample_rate
        );

        {
            let _guard = bus.lock();
            let channel = bus.channel();
            channel.stop_acquisition()?;
            bus.set_sample_rate(Direction::Output, timing.sample_rate)?;
            bus.set_sample_rate(Direction::Input, timing.sample_rate)?;
            channel.set_output_mode(config.pin, OutputMode::PushPull)?;
            channel.set_cyclic(false)?;
            DigitalTrigger::disarmed(&[config.pin]).apply(channel)?;
            channel.set_value(config.pin, true)?;
        }

        let encoder = UartEncoder::new(&config, &timing);
        let decoder = UartDecoder::new(&config, &timing);
        Ok(Self {
            bus,
            config,
            timing,
            encoder,
            decoder,
            total_errors: 0,
            last_capture: None,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(pin = self.config.pin.index(), bytes = data.len()))]
    pub fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        profile_scope!("uart_write");

        let tx = self.encoder.encode(data);
        let _guard = self.bus.lock();
        self.bus.set_sample_rate(Direction::Output, self.timing.sample_rate)?;
        self.bus.setup_output(self.config.pin, OutputMode::PushPull)?;
        self.bus.channel().push(tx)?;
        Ok(())
    }

    /// Capture and decode `len` characters sent by the remote device.
    #[tracing::instrument(level = "debug", skip_all, fields(pin = self.config.pin.index(), bytes = len))]
    pub fn read(&mut self, len: usize) -> Result<UartReading, ProtocolError> {
        profile_scope!("uart_read");

        {
            let _guard = self.bus.lock();
            self.bus.setup_input(self.config.pin)?;
        }
        let trigger = DigitalTrigger::start_capturing_when()
            .falling_edge(self.config.pin)
            .any_of();
        let mut transaction = Transaction::new(
            Arc::clone(&self.bus),
            self.encoder.frame_sample_count(len),
            self.config.timeouts,
        )
        .with_sample_rate(self.timing.sample_rate)
        .with_trigger(trigger);
        let rx = transaction.capture()?;
        self.last_capture = Some(Capture::new(self.timing.sample_rate, rx.clone()));

        let decoder = &self.decoder;
        let reading = transaction.complete(|| Ok(decoder.decode(&rx, len)))?;

        let errors = reading.error_count();
        if errors > 0 {
            log::warn!(
                "UART read of {} bytes on {} saw {} framing/parity errors",
                len,
                self.config.pin,
                errors
            );
        }
        self.total_errors = self.total_errors.saturating_add(errors);
        Ok(reading)
    }

    /// Anomalies counted over the lifetime of this descriptor.
    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    pub fn last_capture(&self) -> Option<&Capture> {
        self.last_capture.as_ref()
    }

    pub fn config(&self) -> &UartConfig {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }
}
