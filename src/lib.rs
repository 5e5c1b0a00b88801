//! # bitbang-rs
//!
//! Software-defined I2C, SPI and UART for the oversampled digital GPIO block of a
//! mixed-signal instrument.
//!
//! Nothing here talks to protocol hardware. Writes are generated as buffers of
//! sample words and pushed to the digital output; reads capture the digital input
//! and recover bytes from the sampled line levels.
//!
//! ## Features
//!
//! - **Timing resolution**: maps a bit rate onto the `2^i * 5^j` sample rates the
//!   instrument supports
//! - **Frame encoders and decoders**: I2C (7/10-bit addressing, general call,
//!   repeated start), SPI (all four modes, MSB/LSB first, CS polarity) and UART
//!   (5 to 8 data bits, parity, 1/1.5/2 stop bits, majority vote with resync)
//! - **Duplex transactions**: the capture is always armed before the TX buffer is
//!   pushed, with bounded waits on both sides
//! - **DataFrame output**: captures export to `polars` DataFrames and CSV
//! - **Loopback channel**: an in-memory [`DigitalChannel`] for tests and demos
//!
//! ## Examples
//!
//! ### SPI over a loopback wire
//!
//! ```rust
//! use bitbang_rs::{DigitalBus, LoopbackChannel, Pin, Spi, SpiConfig, SpiMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (clock, mosi, miso, cs) = (Pin::new(0)?, Pin::new(1)?, Pin::new(2)?, Pin::new(3)?);
//!
//! // MOSI wired straight back into MISO
//! let bus = DigitalBus::new(LoopbackChannel::new().with_wire(mosi, miso));
//! let config = SpiConfig::new(clock, mosi, miso, cs).mode(SpiMode::Mode3);
//! let mut spi = Spi::init(bus, config)?;
//!
//! assert_eq!(spi.write_and_read(&[0xA5, 0x5A])?, vec![0xA5, 0x5A]);
//! # Ok(())
//! # }
//! ```
//!
//! ### UART framing
//!
//! ```rust
//! use bitbang_rs::uart::{UartConfig, UartDecoder, UartEncoder, UartParity, SAMPLES_PER_CYCLE};
//! use bitbang_rs::{Pin, Timing};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UartConfig::new(Pin::new(4)?, 115_200).parity(UartParity::Even);
//! config.validate()?;
//! let timing = Timing::resolve(config.baud_rate, SAMPLES_PER_CYCLE);
//!
//! let samples = UartEncoder::new(&config, &timing).encode(b"hi");
//! let reading = UartDecoder::new(&config, &timing).decode(&samples, 2);
//! assert_eq!(reading.data(), b"hi".to_vec());
//! assert_eq!(reading.error_count(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! ### I2C register read
//!
//! ```rust,no_run
//! use bitbang_rs::{DigitalBus, I2c, I2cConfig, LoopbackChannel, Pin};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = DigitalBus::new(LoopbackChannel::new());
//! let config = I2cConfig::new(Pin::new(0)?, Pin::new(1)?, 0x48).max_speed_hz(400_000);
//! let mut i2c = I2c::init(bus, config)?;
//!
//! // select register 0x0F, then read two bytes after a repeated start
//! let value = i2c.write_then_read(&[0x0F], 2)?;
//! println!("register: {:02x?}", value);
//! # Ok(())
//! # }
//! ```

/// Profiling span that compiles to nothing unless `cpu-profiling` is enabled.
macro_rules! profile_scope {
    ($name:expr) => {
        #[cfg(feature = "cpu-profiling")]
        let _profile_span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!($name), 0));
    };
}

pub mod capture;
pub mod digital_channel;
pub mod error;
pub mod i2c;
pub mod loopback;
pub mod sample;
pub mod spi;
pub mod timing;
pub mod transaction;
pub mod trigger_config;
pub mod uart;

// Re-export the main types for convenience
pub use capture::Capture;
pub use digital_channel::{ChannelError, DigitalBus, DigitalChannel, Direction, OutputMode};
pub use error::ProtocolError;
pub use i2c::{I2c, I2cConfig, I2cWriter, TransferOptions};
pub use loopback::{ChannelCall, LoopbackChannel};
pub use sample::{Pin, SampleBuffer, SampleWord};
pub use spi::{BitOrder, CsPolarity, Spi, SpiConfig, SpiMode};
pub use timing::{resolve_sample_rate, Timing, MAX_SAMPLE_RATE};
pub use transaction::{Transaction, TransactionState, TransactionTimeouts};
pub use trigger_config::{DigitalTrigger, PinTriggerBuilder, TriggerCondition, TriggerMode};
pub use uart::{Uart, UartConfig, UartParity, UartReading, UartStopBits};
