//! I2C master over two open-drain digital lines.
//!
//! A transfer is generated as one TX buffer (start, address, data, stop) and
//! captured back from the same lines; acknowledge bits are then read from the
//! capture. Released lines read high, so an acknowledge is a *low* level and a
//! slot read back as `true` means nobody pulled the line down.

use crate::capture::Capture;
use crate::digital_channel::{DigitalBus, DigitalChannel, Direction, OutputMode};
use crate::error::ProtocolError;
use crate::sample::{Pin, SampleBuffer, SampleWord};
use crate::timing::Timing;
use crate::transaction::{Transaction, TransactionTimeouts};
use crate::trigger_config::DigitalTrigger;
use std::sync::Arc;

/// Samples generated per I2C bit.
pub const SAMPLES_PER_CYCLE: u32 = 4;

const TEN_BIT_PREFIX: u8 = 0b1111_0000;
const READ_FILLER: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cAddressing {
    SevenBit,
    TenBit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cDirection {
    Write,
    Read,
}

impl I2cDirection {
    fn rw_bit(self) -> u8 {
        match self {
            I2cDirection::Write => 0,
            I2cDirection::Read => 1,
        }
    }
}

/// Per-transfer options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Leave the bus claimed (no stop condition) so the next transfer starts
    /// with a repeated start.
    pub repeated_start: bool,
}

impl TransferOptions {
    pub fn repeated_start() -> Self {
        Self {
            repeated_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cConfig {
    pub scl: Pin,
    pub sda: Pin,
    pub slave_address: u16,
    pub max_speed_hz: u32,
    pub addressing: I2cAddressing,
    pub general_call: bool,
    pub timeouts: TransactionTimeouts,
}

impl I2cConfig {
    pub const DEFAULT_SPEED_HZ: u32 = 100_000;

    pub fn new(scl: Pin, sda: Pin, slave_address: u16) -> Self {
        Self {
            scl,
            sda,
            slave_address,
            max_speed_hz: Self::DEFAULT_SPEED_HZ,
            addressing: I2cAddressing::SevenBit,
            general_call: false,
            timeouts: TransactionTimeouts::default(),
        }
    }

    pub fn max_speed_hz(mut self, hz: u32) -> Self {
        self.max_speed_hz = hz;
        self
    }

    pub fn ten_bit_addressing(mut self) -> Self {
        self.addressing = I2cAddressing::TenBit;
        self
    }

    /// Address every device on the bus through the general call address.
    /// The slave address is ignored and only writes are possible.
    pub fn general_call(mut self) -> Self {
        self.general_call = true;
        self
    }

    pub fn timeouts(mut self, timeouts: TransactionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.scl == self.sda {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "SCL and SDA must be different pins, both are {}",
                self.scl
            )));
        }
        if self.max_speed_hz == 0 {
            return Err(ProtocolError::InvalidConfiguration(
                "I2C speed must be greater than 0 Hz".to_string(),
            ));
        }
        if self.general_call {
            if self.addressing == I2cAddressing::TenBit {
                return Err(ProtocolError::InvalidConfiguration(
                    "General call cannot be combined with 10-bit addressing".to_string(),
                ));
            }
            return Ok(());
        }
        let limit = match self.addressing {
            I2cAddressing::SevenBit => 0x7F,
            I2cAddressing::TenBit => 0x3FF,
        };
        if self.slave_address > limit {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "Slave address 0x{:x} out of range, maximum is 0x{:x}",
                self.slave_address, limit
            )));
        }
        Ok(())
    }

    /// Address the transfer targets, 0 for a general call.
    pub fn target_address(&self) -> u16 {
        if self.general_call {
            0
        } else {
            self.slave_address
        }
    }

    /// Number of bytes the address phase occupies on the wire.
    pub fn address_len(&self) -> usize {
        match (self.general_call, self.addressing) {
            (false, I2cAddressing::TenBit) => 2,
            _ => 1,
        }
    }

    /// Address phase bytes. Only meaningful for a validated config.
    pub(crate) fn address_bytes(&self, direction: I2cDirection) -> Vec<u8> {
        let rw = direction.rw_bit();
        if self.general_call {
            return vec![rw];
        }
        let address = self.slave_address;
        match self.addressing {
            I2cAddressing::SevenBit => vec![((address as u8) << 1) | rw],
            I2cAddressing::TenBit => vec![
                TEN_BIT_PREFIX | ((address >> 7) as u8 & 0b110) | rw,
                address as u8,
            ],
        }
    }
}

/// One byte on the wire plus the level the master leaves on SDA during its
/// acknowledge slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cSlot {
    pub byte: u8,
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cFrame {
    pub slots: Vec<I2cSlot>,
    pub stop: bool,
}

impl I2cFrame {
    /// Write request. Fails when `config` does not validate, since its address
    /// could not be put on the wire.
    pub fn write(
        config: &I2cConfig,
        data: &[u8],
        options: TransferOptions,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let mut slots = Self::address_slots(config, I2cDirection::Write);
        slots.extend(data.iter().map(|&byte| I2cSlot { byte, ack: true }));
        Ok(Self {
            slots,
            stop: !options.repeated_start,
        })
    }

    /// Read request: the data phase is filler the slave overrides, and the
    /// master acknowledges every byte except the last.
    pub fn read(
        config: &I2cConfig,
        len: usize,
        options: TransferOptions,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let mut slots = Self::address_slots(config, I2cDirection::Read);
        slots.extend((0..len).map(|i| I2cSlot {
            byte: READ_FILLER,
            ack: i + 1 == len,
        }));
        Ok(Self {
            slots,
            stop: !options.repeated_start,
        })
    }

    fn address_slots(config: &I2cConfig, direction: I2cDirection) -> Vec<I2cSlot> {
        config
            .address_bytes(direction)
            .into_iter()
            .map(|byte| I2cSlot { byte, ack: true })
            .collect()
    }
}

/// Turns an [`I2cFrame`] into samples.
#[derive(Debug, Clone, Copy)]
pub struct I2cEncoder {
    scl: Pin,
    sda: Pin,
    samples_per_bit: usize,
}

impl I2cEncoder {
    pub fn new(scl: Pin, sda: Pin, timing: &Timing) -> Self {
        Self {
            scl,
            sda,
            samples_per_bit: timing.samples_per_bit(),
        }
    }

    /// Length of the encoded frame, which is also the capture length.
    pub fn frame_sample_count(&self, slots: usize, stop: bool) -> usize {
        let s = self.samples_per_bit;
        // clocked bits are two whole halves, which drops a sample when s is odd
        let bit = 2 * (s / 2);
        let stop_len = if stop { 3 * s } else { 0 };
        4 * s + 9 * bit * slots + stop_len
    }

    pub fn encode(&self, frame: &I2cFrame) -> SampleBuffer {
        let mut buffer =
            SampleBuffer::with_capacity(self.frame_sample_count(frame.slots.len(), frame.stop));

        self.phases(
            &mut buffer,
            &[(false, true), (true, true), (true, false), (false, false)],
        );
        for slot in &frame.slots {
            for bit in (0..8).rev() {
                self.bit(&mut buffer, (slot.byte >> bit) & 1 == 1);
            }
            self.bit(&mut buffer, slot.ack);
        }
        if frame.stop {
            self.phases(&mut buffer, &[(false, false), (true, false), (true, true)]);
        }

        buffer
    }

    fn lines(&self, scl: bool, sda: bool) -> SampleWord {
        SampleWord::LOW
            .with_level(self.scl, scl)
            .with_level(self.sda, sda)
    }

    fn phases(&self, buffer: &mut SampleBuffer, levels: &[(bool, bool)]) {
        for &(scl, sda) in levels {
            buffer.push_repeat(self.lines(scl, sda), self.samples_per_bit);
        }
    }

    // SCL low for the first half of the bit, high for the second
    fn bit(&self, buffer: &mut SampleBuffer, level: bool) {
        let half = self.samples_per_bit / 2;
        buffer.push_repeat(self.lines(false, level), half);
        buffer.push_repeat(self.lines(true, level), half);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cByte {
    pub value: u8,
    /// SDA level in the acknowledge slot; `false` means acknowledged.
    pub acknowledge: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct I2cDecoder {
    scl: Pin,
    sda: Pin,
}

impl I2cDecoder {
    pub fn new(scl: Pin, sda: Pin) -> Self {
        Self { scl, sda }
    }

    /// Decode up to `expected` bytes following the first start condition.
    pub fn decode(&self, samples: &SampleBuffer, expected: usize) -> Vec<I2cByte> {
        let mut bytes = Vec::with_capacity(expected.min(samples.len()));
        let mut iter = samples.iter();
        let Some(mut previous) = iter.next() else {
            return bytes;
        };

        let mut started = false;
        let mut value = 0u8;
        let mut bit_count = 0u8;
        for sample in iter {
            if bytes.len() == expected {
                break;
            }
            if !started {
                started =
                    previous.level(self.sda) && !sample.level(self.sda) && sample.level(self.scl);
            } else if !previous.level(self.scl) && sample.level(self.scl) {
                if bit_count < 8 {
                    value = (value << 1) | u8::from(sample.level(self.sda));
                    bit_count += 1;
                } else {
                    bytes.push(I2cByte {
                        value,
                        acknowledge: sample.level(self.sda),
                    });
                    value = 0;
                    bit_count = 0;
                }
            }
            previous = sample;
        }

        bytes
    }
}

/// Generation-only I2C master. Nothing is captured, so acknowledges are not
/// checked.
pub struct I2cWriter<C: DigitalChannel + 'static> {
    bus: Arc<DigitalBus<C>>,
    config: I2cConfig,
    timing: Timing,
    encoder: I2cEncoder,
}

impl<C: DigitalChannel + 'static> I2cWriter<C> {
    pub fn init(bus: Arc<DigitalBus<C>>, config: I2cConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        let timing = Timing::resolve(config.max_speed_hz, SAMPLES_PER_CYCLE);
        log::debug!(
            "I2C on SCL {} / SDA {}: {} Hz bit rate at {} Hz sample rate",
            config.scl,
            config.sda,
            timing.bit_rate,
            timing.sample_rate
        );

        {
            let _guard = bus.lock();
            let channel = bus.channel();
            bus.set_sample_rate(Direction::Output, timing.sample_rate)?;
            bus.setup_output(config.scl, OutputMode::OpenDrain)?;
            bus.setup_output(config.sda, OutputMode::OpenDrain)?;
            channel.set_cyclic(false)?;
            channel.set_value(config.scl, true)?;
            channel.set_value(config.sda, true)?;
        }

        let encoder = I2cEncoder::new(config.scl, config.sda, &timing);
        Ok(Self {
            bus,
            config,
            timing,
            encoder,
        })
    }

    /// Add the capture side, turning the writer into a full [`I2c`] master.
    pub fn enable_capture(self) -> Result<I2c<C>, ProtocolError> {
        {
            let _guard = self.bus.lock();
            let channel = self.bus.channel();
            channel.stop_acquisition()?;
            self.bus.set_sample_rate(Direction::Input, self.timing.sample_rate)?;
            DigitalTrigger::disarmed(&[self.config.scl, self.config.sda]).apply(channel)?;
        }

        let decoder = I2cDecoder::new(self.config.scl, self.config.sda);
        Ok(I2c {
            writer: self,
            decoder,
            last_capture: None,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(address = self.config.target_address(), bytes = data.len()))]
    pub fn write_only(&mut self, data: &[u8], options: TransferOptions) -> Result<(), ProtocolError> {
        profile_scope!("i2c_write_only");

        let frame = I2cFrame::write(&self.config, data, options)?;
        let tx = self.encoder.encode(&frame);
        log::trace!("Pushing {} byte I2C write without capture", data.len());

        let _guard = self.bus.lock();
        self.bus.set_sample_rate(Direction::Output, self.timing.sample_rate)?;
        self.bus.channel().push(tx)?;
        Ok(())
    }

    pub fn config(&self) -> &I2cConfig {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }
}

/// I2C master with acknowledge checking and reads.
pub struct I2c<C: DigitalChannel + 'static> {
    writer: I2cWriter<C>,
    decoder: I2cDecoder,
    last_capture: Option<Capture>,
}

impl<C: DigitalChannel + 'static> I2c<C> {
    pub fn init(bus: Arc<DigitalBus<C>>, config: I2cConfig) -> Result<Self, ProtocolError> {
        I2cWriter::init(bus, config)?.enable_capture()
    }

    /// Set up a master that only generates traffic.
    pub fn init_write_only(
        bus: Arc<DigitalBus<C>>,
        config: I2cConfig,
    ) -> Result<I2cWriter<C>, ProtocolError> {
        I2cWriter::init(bus, config)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(address = self.config().target_address(), bytes = data.len()))]
    pub fn write(&mut self, data: &[u8], options: TransferOptions) -> Result<(), ProtocolError> {
        profile_scope!("i2c_write");
        let frame = I2cFrame::write(&self.writer.config, data, options)?;
        self.transfer(&frame, I2cDirection::Write).map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(address = self.config().target_address(), bytes = len))]
    pub fn read(&mut self, len: usize, options: TransferOptions) -> Result<Vec<u8>, ProtocolError> {
        profile_scope!("i2c_read");
        if self.writer.config.general_call {
            return Err(ProtocolError::InvalidConfiguration(
                "General call transfers are write-only".to_string(),
            ));
        }
        let frame = I2cFrame::read(&self.writer.config, len, options)?;
        self.transfer(&frame, I2cDirection::Read)
    }

    /// Write `data`, then read `len` bytes after a repeated start. This is the
    /// usual register read: the written bytes select the register.
    pub fn write_then_read(&mut self, data: &[u8], len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.write(data, TransferOptions::repeated_start())?;
        self.read(len, TransferOptions::default())
    }

    pub fn write_only(&mut self, data: &[u8], options: TransferOptions) -> Result<(), ProtocolError> {
        self.writer.write_only(data, options)
    }

    /// Samples captured by the most recent read or write.
    pub fn last_capture(&self) -> Option<&Capture> {
        self.last_capture.as_ref()
    }

    pub fn config(&self) -> &I2cConfig {
        &self.writer.config
    }

    pub fn timing(&self) -> &Timing {
        &self.writer.timing
    }

    fn transfer(
        &mut self,
        frame: &I2cFrame,
        direction: I2cDirection,
    ) -> Result<Vec<u8>, ProtocolError> {
        let config = &self.writer.config;
        let tx = self.writer.encoder.encode(frame);
        let trigger = DigitalTrigger::start_capturing_when()
            .falling_edge(config.sda)
            .delay(-(self.writer.timing.samples_per_bit as i32))
            .any_of();

        let mut transaction = Transaction::new(Arc::clone(&self.writer.bus), tx.len(), config.timeouts)
            .with_sample_rate(self.writer.timing.sample_rate)
            .with_trigger(trigger);
        let rx = transaction.duplex(tx)?;
        self.last_capture = Some(Capture::new(self.writer.timing.sample_rate, rx.clone()));

        let expected = frame.slots.len();
        let address_len = config.address_len();
        let address = config.target_address();
        let decoder = &self.decoder;
        transaction.complete(|| {
            let bytes = decoder.decode(&rx, expected);
            if bytes.len() < address_len {
                return Err(ProtocolError::IncompleteFrame {
                    expected,
                    decoded: bytes.len(),
                });
            }
            if bytes[..address_len].iter().any(|byte| byte.acknowledge) {
                return Err(ProtocolError::NoResponse { address });
            }
            if bytes.len() < expected {
                return Err(ProtocolError::IncompleteFrame {
                    expected,
                    decoded: bytes.len(),
                });
            }

            let data = &bytes[address_len..];
            if direction == I2cDirection::Write {
                if let Some(index) = data.iter().position(|byte| byte.acknowledge) {
                    return Err(ProtocolError::DataRejected { index });
                }
            }
            Ok(data.iter().map(|byte| byte.value).collect())
        })
    }
}
