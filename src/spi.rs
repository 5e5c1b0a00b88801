//! SPI master over four digital lines.

use crate::capture::Capture;
use crate::digital_channel::{DigitalBus, DigitalChannel, Direction, OutputMode};
use crate::error::ProtocolError;
use crate::sample::{Pin, SampleBuffer, SampleWord};
use crate::timing::Timing;
use crate::transaction::{Transaction, TransactionTimeouts};
use crate::trigger_config::{DigitalTrigger, TriggerCondition};
use std::sync::Arc;

/// Samples generated per SPI clock cycle.
pub const SAMPLES_PER_CYCLE: u32 = 4;

/// Clock polarity and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpiMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

impl SpiMode {
    pub fn from_flags(cpol: bool, cpha: bool) -> Self {
        match (cpol, cpha) {
            (false, false) => SpiMode::Mode0,
            (false, true) => SpiMode::Mode1,
            (true, false) => SpiMode::Mode2,
            (true, true) => SpiMode::Mode3,
        }
    }

    /// Idle level of the clock.
    pub fn cpol(self) -> bool {
        matches!(self, SpiMode::Mode2 | SpiMode::Mode3)
    }

    /// Data changes on the leading edge and is sampled on the trailing one.
    pub fn cpha(self) -> bool {
        matches!(self, SpiMode::Mode1 | SpiMode::Mode3)
    }

    pub fn samples_on_rising_edge(self) -> bool {
        matches!(self, SpiMode::Mode0 | SpiMode::Mode3)
    }
}

impl TryFrom<u8> for SpiMode {
    type Error = ProtocolError;

    fn try_from(mode: u8) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(SpiMode::Mode0),
            1 => Ok(SpiMode::Mode1),
            2 => Ok(SpiMode::Mode2),
            3 => Ok(SpiMode::Mode3),
            _ => Err(ProtocolError::InvalidConfiguration(format!(
                "SPI mode {} does not exist, must be between 0 and 3",
                mode
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitOrder {
    #[default]
    MsbFirst,
    LsbFirst,
}

impl BitOrder {
    /// Bit shift of the `position`-th transmitted bit of a byte.
    fn shift(self, position: usize) -> usize {
        match self {
            BitOrder::MsbFirst => 7 - position,
            BitOrder::LsbFirst => position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsPolarity {
    #[default]
    ActiveLow,
    ActiveHigh,
}

impl CsPolarity {
    pub fn active_level(self) -> bool {
        matches!(self, CsPolarity::ActiveHigh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub clock: Pin,
    pub mosi: Pin,
    pub miso: Pin,
    pub chip_select: Pin,
    pub max_speed_hz: u32,
    pub mode: SpiMode,
    pub bit_order: BitOrder,
    pub cs_polarity: CsPolarity,
    pub timeouts: TransactionTimeouts,
}

impl SpiConfig {
    pub const DEFAULT_SPEED_HZ: u32 = 1_000_000;

    pub fn new(clock: Pin, mosi: Pin, miso: Pin, chip_select: Pin) -> Self {
        Self {
            clock,
            mosi,
            miso,
            chip_select,
            max_speed_hz: Self::DEFAULT_SPEED_HZ,
            mode: SpiMode::default(),
            bit_order: BitOrder::default(),
            cs_polarity: CsPolarity::default(),
            timeouts: TransactionTimeouts::default(),
        }
    }

    pub fn max_speed_hz(mut self, hz: u32) -> Self {
        self.max_speed_hz = hz;
        self
    }

    pub fn mode(mut self, mode: SpiMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn bit_order(mut self, order: BitOrder) -> Self {
        self.bit_order = order;
        self
    }

    pub fn cs_polarity(mut self, polarity: CsPolarity) -> Self {
        self.cs_polarity = polarity;
        self
    }

    pub fn timeouts(mut self, timeouts: TransactionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let pins = [self.clock, self.mosi, self.miso, self.chip_select];
        for (i, pin) in pins.iter().enumerate() {
            if pins[i + 1..].contains(pin) {
                return Err(ProtocolError::InvalidConfiguration(format!(
                    "SPI lines must use distinct pins, {} is assigned twice",
                    pin
                )));
            }
        }
        if self.max_speed_hz == 0 {
            return Err(ProtocolError::InvalidConfiguration(
                "SPI speed must be greater than 0 Hz".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpiEncoder {
    clock: Pin,
    mosi: Pin,
    chip_select: Pin,
    mode: SpiMode,
    bit_order: BitOrder,
    cs_polarity: CsPolarity,
    samples_per_half_bit: usize,
}

impl SpiEncoder {
    pub fn new(config: &SpiConfig, timing: &Timing) -> Self {
        Self {
            clock: config.clock,
            mosi: config.mosi,
            chip_select: config.chip_select,
            mode: config.mode,
            bit_order: config.bit_order,
            cs_polarity: config.cs_polarity,
            samples_per_half_bit: timing.samples_per_half_bit(),
        }
    }

    /// Two half periods per bit, plus clock release and chip select release.
    pub fn frame_sample_count(&self, bytes: usize) -> usize {
        (16 * bytes + 2) * self.samples_per_half_bit
    }

    pub fn encode(&self, data: &[u8]) -> SampleBuffer {
        let half = self.samples_per_half_bit;
        let total_bits = data.len() * 8;
        let active = self.cs_polarity.active_level();
        let cpol = self.mode.cpol();
        let cpha = self.mode.cpha();

        let mut buffer = SampleBuffer::with_capacity(self.frame_sample_count(data.len()));
        for period in 0..total_bits * 2 {
            let clock = cpol ^ (period % 2 == 1);
            // with CPHA the data is shifted out on the leading edge, half a period late
            let bit = if cpha {
                period.saturating_sub(1) / 2
            } else {
                period / 2
            };
            buffer.push_repeat(self.lines(active, clock, self.bit_at(data, bit)), half);
        }

        let trailing = cpha && total_bits > 0 && self.bit_at(data, total_bits - 1);
        buffer.push_repeat(self.lines(active, cpol, trailing), half);
        buffer.push_repeat(self.lines(!active, cpol, false), half);
        buffer
    }

    fn bit_at(&self, data: &[u8], bit: usize) -> bool {
        let shift = self.bit_order.shift(bit % 8);
        data.get(bit / 8).is_some_and(|byte| (byte >> shift) & 1 == 1)
    }

    fn lines(&self, chip_select: bool, clock: bool, mosi: bool) -> SampleWord {
        SampleWord::LOW
            .with_level(self.chip_select, chip_select)
            .with_level(self.clock, clock)
            .with_level(self.mosi, mosi)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpiDecoder {
    clock: Pin,
    miso: Pin,
    chip_select: Pin,
    mode: SpiMode,
    bit_order: BitOrder,
    cs_polarity: CsPolarity,
}

impl SpiDecoder {
    pub fn new(config: &SpiConfig) -> Self {
        Self {
            clock: config.clock,
            miso: config.miso,
            chip_select: config.chip_select,
            mode: config.mode,
            bit_order: config.bit_order,
            cs_polarity: config.cs_polarity,
        }
    }

    /// Sample MISO on every qualifying clock edge while the chip is selected.
    /// Only complete bytes are returned.
    pub fn decode(&self, samples: &SampleBuffer, expected: usize) -> Vec<u8> {
        let total_bits = expected * 8;
        let rising = self.mode.samples_on_rising_edge();
        let active = self.cs_polarity.active_level();

        let mut bytes = vec![0u8; expected];
        let mut bit = 0usize;
        let mut iter = samples.iter();
        let Some(mut previous) = iter.next() else {
            return Vec::new();
        };
        for sample in iter {
            if bit == total_bits {
                break;
            }
            let was_high = previous.level(self.clock);
            let is_high = sample.level(self.clock);
            let edge = if rising {
                !was_high && is_high
            } else {
                was_high && !is_high
            };
            if edge && sample.level(self.chip_select) == active {
                if sample.level(self.miso) {
                    bytes[bit / 8] |= 1 << self.bit_order.shift(bit % 8);
                }
                bit += 1;
            }
            previous = sample;
        }

        bytes.truncate(bit / 8);
        bytes
    }
}

pub struct Spi<C: DigitalChannel + 'static> {
    bus: Arc<DigitalBus<C>>,
    config: SpiConfig,
    timing: Timing,
    encoder: SpiEncoder,
    decoder: SpiDecoder,
    last_capture: Option<Capture>,
}

impl<C: DigitalChannel + 'static> Spi<C> {
    pub fn init(bus: Arc<DigitalBus<C>>, config: SpiConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        let timing = Timing::resolve(config.max_speed_hz, SAMPLES_PER_CYCLE);
        log::debug!(
            "SPI {:?} on CLK {} / MOSI {} / MISO {} / CS {}: {} Hz at {} Hz sample rate",
            config.mode,
            config.clock,
            config.mosi,
            config.miso,
            config.chip_select,
            timing.bit_rate,
            timing.sample_rate
        );

        {
            let _guard = bus.lock();
            let channel = bus.channel();
            channel.stop_acquisition()?;
            bus.set_sample_rate(Direction::Output, timing.sample_rate)?;
            bus.set_sample_rate(Direction::Input, timing.sample_rate)?;
            bus.setup_output(config.chip_select, OutputMode::PushPull)?;
            bus.setup_output(config.clock, OutputMode::PushPull)?;
            bus.setup_output(config.mosi, OutputMode::PushPull)?;
            bus.setup_input(config.miso)?;
            channel.set_cyclic(false)?;
            DigitalTrigger::disarmed(&[config.clock, config.mosi, config.miso, config.chip_select])
                .apply(channel)?;
            channel.set_value(config.chip_select, !config.cs_polarity.active_level())?;
            channel.set_value(config.clock, config.mode.cpol())?;
        }

        let encoder = SpiEncoder::new(&config, &timing);
        let decoder = SpiDecoder::new(&config);
        Ok(Self {
            bus,
            config,
            timing,
            encoder,
            decoder,
            last_capture: None,
        })
    }

    /// Clock `data` out on MOSI and return what MISO carried meanwhile.
    #[tracing::instrument(level = "debug", skip_all, fields(bytes = data.len()))]
    pub fn write_and_read(&mut self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        profile_scope!("spi_write_and_read");

        let tx = self.encoder.encode(data);
        let condition = match self.config.cs_polarity {
            CsPolarity::ActiveLow => TriggerCondition::FallingEdge,
            CsPolarity::ActiveHigh => TriggerCondition::RisingEdge,
        };
        let trigger = DigitalTrigger::start_capturing_when()
            .set_pin(self.config.chip_select, condition)
            .any_of();

        let mut transaction = Transaction::new(Arc::clone(&self.bus), tx.len(), self.config.timeouts)
            .with_sample_rate(self.timing.sample_rate)
            .with_trigger(trigger);
        let rx = transaction.duplex(tx)?;
        self.last_capture = Some(Capture::new(self.timing.sample_rate, rx.clone()));

        let expected = data.len();
        let decoder = &self.decoder;
        transaction.complete(|| {
            let bytes = decoder.decode(&rx, expected);
            if bytes.len() < expected {
                return Err(ProtocolError::IncompleteFrame {
                    expected,
                    decoded: bytes.len(),
                });
            }
            Ok(bytes)
        })
    }

    pub fn last_capture(&self) -> Option<&Capture> {
        self.last_capture.as_ref()
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }
}
