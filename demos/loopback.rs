// Loopback protocol demo
//
// Runs I2C, SPI or UART transactions against the in-memory loopback channel,
// prints what was decoded and optionally dumps the raw capture as CSV.

use bitbang_rs::i2c::{self, I2cDecoder, I2cEncoder, I2cFrame, I2cSlot};
use bitbang_rs::uart::UartEncoder;
use bitbang_rs::{
    Capture, DigitalBus, I2c, I2cConfig, LoopbackChannel, Pin, SampleBuffer, Spi, SpiConfig,
    SpiMode, Timing, TransferOptions, Uart, UartConfig, UartParity,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loopback")]
#[command(version = "1.0")]
#[command(about = "Bit-banged I2C, SPI and UART over a loopback digital channel")]
struct Args {
    #[command(subcommand)]
    protocol: Protocol,

    /// Write the raw capture of the last transaction to this CSV file
    #[arg(long, global = true)]
    csv: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Show debug information and detailed logs")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Protocol {
    /// Full-duplex transfer with MOSI wired to MISO
    Spi {
        #[arg(long, default_value_t = 1_000_000)]
        speed: u32,
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
        mode: u8,
        /// Bytes to send, in hex
        #[arg(required = true)]
        bytes: Vec<String>,
    },
    /// Write to an emulated slave, then read its registers back
    I2c {
        #[arg(long, default_value_t = 100_000)]
        speed: u32,
        #[arg(long, default_value = "0x48")]
        address: String,
        /// Bytes to write, in hex
        #[arg(required = true)]
        bytes: Vec<String>,
    },
    /// Write a frame, then read it back as if the remote end had sent it
    Uart {
        #[arg(long, default_value_t = 115_200)]
        baud: u32,
        #[arg(long, value_enum, default_value_t = Parity::None)]
        parity: Parity,
        /// Text to send
        text: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl From<Parity> for UartParity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => UartParity::None,
            Parity::Odd => UartParity::Odd,
            Parity::Even => UartParity::Even,
            Parity::Mark => UartParity::Mark,
            Parity::Space => UartParity::Space,
        }
    }
}

fn parse_hex(text: &str) -> Result<u8, std::num::ParseIntError> {
    u8::from_str_radix(text.trim_start_matches("0x"), 16)
}

/// Slave that acknowledges everything and answers reads with `registers`.
fn emulated_slave(
    config: &I2cConfig,
    registers: Vec<u8>,
) -> impl Fn(&SampleBuffer) -> SampleBuffer + Send + Sync + 'static {
    let timing = Timing::resolve(config.max_speed_hz, i2c::SAMPLES_PER_CYCLE);
    let s = timing.samples_per_bit();
    let encoder = I2cEncoder::new(config.scl, config.sda, &timing);
    let decoder = I2cDecoder::new(config.scl, config.sda);

    move |tx: &SampleBuffer| {
        let body = tx.len().saturating_sub(4 * s);
        let stop = body % (9 * s) != 0;
        let slots = (body - if stop { 3 * s } else { 0 }) / (9 * s);
        let request = decoder.decode(tx, slots);
        let reading = request.first().is_some_and(|address| address.value & 1 == 1);

        let slots = request
            .iter()
            .enumerate()
            .map(|(index, byte)| match index {
                0 => I2cSlot { byte: byte.value, ack: false },
                _ if reading => I2cSlot {
                    byte: registers[(index - 1) % registers.len()],
                    ack: byte.acknowledge,
                },
                _ => I2cSlot { byte: byte.value, ack: false },
            })
            .collect();
        encoder.encode(&I2cFrame { slots, stop })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Trace)
            .init();
    } else {
        env_logger::init();
    }

    let (capture, pins): (Option<Capture>, Vec<Pin>) = match args.protocol {
        Protocol::Spi { speed, mode, bytes } => {
            let data = bytes.iter().map(|b| parse_hex(b)).collect::<Result<Vec<_>, _>>()?;
            let (clock, mosi, miso, cs) = (Pin::new(0)?, Pin::new(1)?, Pin::new(2)?, Pin::new(3)?);

            let bus = DigitalBus::new(LoopbackChannel::new().with_wire(mosi, miso));
            let config = SpiConfig::new(clock, mosi, miso, cs)
                .max_speed_hz(speed)
                .mode(SpiMode::try_from(mode)?);
            let mut spi = Spi::init(bus, config)?;
            println!(
                "SPI mode {} at {} Hz ({} Hz sample rate)",
                mode,
                spi.timing().bit_rate,
                spi.timing().sample_rate
            );

            let received = spi.write_and_read(&data)?;
            println!("Sent:     {:02x?}", data);
            println!("Received: {:02x?}", received);
            (spi.last_capture().cloned(), vec![clock, mosi, miso, cs])
        }
        Protocol::I2c {
            speed,
            address,
            bytes,
        } => {
            let data = bytes.iter().map(|b| parse_hex(b)).collect::<Result<Vec<_>, _>>()?;
            let address = u16::from(parse_hex(&address)?);
            let (scl, sda) = (Pin::new(0)?, Pin::new(1)?);

            let config = I2cConfig::new(scl, sda, address).max_speed_hz(speed);
            let channel = LoopbackChannel::new().with_responder(emulated_slave(&config, data.clone()));
            let mut i2c = I2c::init(DigitalBus::new(channel), config)?;

            i2c.write(&data, TransferOptions::default())?;
            println!("Wrote {:02x?} to 0x{:02x}", data, address);
            let read = i2c.write_then_read(&[0x00], data.len())?;
            println!("Read back {:02x?}", read);
            (i2c.last_capture().cloned(), vec![scl, sda])
        }
        Protocol::Uart { baud, parity, text } => {
            let pin = Pin::new(4)?;
            let config = UartConfig::new(pin, baud).parity(parity.into());
            let channel = LoopbackChannel::new();
            let bus = DigitalBus::new(channel);
            let mut uart = Uart::init(std::sync::Arc::clone(&bus), config.clone())?;

            uart.write(text.as_bytes())?;
            // play our own transmission back as incoming traffic
            for frame in bus.channel().pushed() {
                bus.channel().schedule_capture(frame);
            }
            let reading = uart.read(text.len())?;
            println!(
                "UART {} baud: read {:?} with {} errors",
                uart.timing().bit_rate,
                String::from_utf8_lossy(&reading.data()),
                reading.error_count()
            );
            let expected = UartEncoder::new(&config, uart.timing()).frame_sample_count(text.len());
            println!("Frame length: {} samples", expected);
            (uart.last_capture().cloned(), vec![pin])
        }
    };

    if let (Some(path), Some(capture)) = (args.csv, capture) {
        capture.write_csv(&pins, File::create(&path)?)?;
        println!(
            "Saved {} samples ({:?}) to {}",
            capture.samples().len(),
            capture.duration(),
            path.display()
        );
    }

    Ok(())
}
