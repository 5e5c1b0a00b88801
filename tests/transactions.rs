use bitbang_rs::i2c::{self, I2cAddressing, I2cConfig, I2cDecoder, I2cEncoder, I2cFrame, I2cSlot};
use bitbang_rs::uart::UartEncoder;
use bitbang_rs::{
    BitOrder, ChannelCall, CsPolarity, DigitalBus, Direction, I2c, LoopbackChannel, Pin,
    ProtocolError, SampleBuffer, Spi, SpiConfig, SpiMode, Timing, TransactionState,
    TransactionTimeouts, TransferOptions, TriggerCondition, Uart, UartConfig, UartParity,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn pin(index: u8) -> Pin {
    Pin::new(index).unwrap()
}

fn i2c_config() -> I2cConfig {
    I2cConfig::new(pin(0), pin(1), 0x48)
}

/// Address bytes a slave answers to, with the R/W bit cleared.
fn slave_address(config: &I2cConfig) -> Vec<u8> {
    let address = config.slave_address;
    match (config.general_call, config.addressing) {
        (true, _) => vec![0x00],
        (false, I2cAddressing::SevenBit) => vec![(address as u8) << 1],
        (false, I2cAddressing::TenBit) => {
            vec![0xF0 | ((address >> 7) as u8 & 0b110), address as u8]
        }
    }
}

/// I2C slave at `config`'s address: acknowledges the address bytes that match,
/// serves `registers` on reads and acknowledges written bytes up to (not
/// including) data byte `reject_from`.
fn i2c_slave(
    config: &I2cConfig,
    registers: Vec<u8>,
    reject_from: Option<usize>,
) -> impl Fn(&SampleBuffer) -> SampleBuffer + Send + Sync + 'static {
    let timing = Timing::resolve(config.max_speed_hz, i2c::SAMPLES_PER_CYCLE);
    let s = timing.samples_per_bit();
    let encoder = I2cEncoder::new(config.scl, config.sda, &timing);
    let decoder = I2cDecoder::new(config.scl, config.sda);
    let own_address = slave_address(config);

    move |tx: &SampleBuffer| {
        let body = tx.len().saturating_sub(4 * s);
        let (slots, stop) = if body % (9 * s) == 0 {
            (body / (9 * s), false)
        } else {
            (body.saturating_sub(3 * s) / (9 * s), true)
        };
        let request = decoder.decode(tx, slots);
        // not an I2C frame, e.g. another descriptor on the same bus
        if request.is_empty() {
            return tx.clone();
        }
        let reading = request[0].value & 1 == 1;

        let mut frame = I2cFrame {
            slots: Vec::new(),
            stop,
        };
        let mut selected = true;
        for (index, byte) in request.iter().enumerate() {
            let slot = if index < own_address.len() {
                let expected = own_address[index];
                let value = if index == 0 { byte.value & !1 } else { byte.value };
                selected &= value == expected;
                I2cSlot {
                    byte: byte.value,
                    ack: !selected,
                }
            } else if !selected {
                I2cSlot {
                    byte: byte.value,
                    ack: byte.acknowledge,
                }
            } else if reading {
                let data_index = index - own_address.len();
                I2cSlot {
                    byte: registers[data_index % registers.len()],
                    ack: byte.acknowledge,
                }
            } else {
                let data_index = index - own_address.len();
                I2cSlot {
                    byte: byte.value,
                    ack: reject_from.is_some_and(|first| data_index >= first),
                }
            };
            frame.slots.push(slot);
        }
        encoder.encode(&frame)
    }
}

fn position(calls: &[ChannelCall], wanted: impl Fn(&ChannelCall) -> bool) -> usize {
    calls.iter().position(wanted).expect("call not recorded")
}

#[test]
fn test_i2c_write_acknowledged() {
    let config = i2c_config();
    let channel = LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0], None));
    let bus = DigitalBus::new(channel);
    let mut i2c = I2c::init(Arc::clone(&bus), config).unwrap();

    i2c.write(&[0x10, 0x20], TransferOptions::default()).unwrap();

    let capture = i2c.last_capture().unwrap();
    assert_eq!(capture.sample_rate(), 400_000);
    assert_eq!(capture.samples().len(), bus.channel().pushed()[0].len());
}

#[test]
fn test_i2c_read_returns_slave_data() {
    let config = i2c_config();
    let channel =
        LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0xDE, 0xAD, 0xBE], None));
    let mut i2c = I2c::init(DigitalBus::new(channel), config).unwrap();

    assert_eq!(
        i2c.read(3, TransferOptions::default()).unwrap(),
        vec![0xDE, 0xAD, 0xBE]
    );
    assert_eq!(i2c.write_then_read(&[0x0F], 2).unwrap(), vec![0xDE, 0xAD]);
}

#[test]
fn test_i2c_without_slave_is_no_response() {
    let mut i2c = I2c::init(DigitalBus::new(LoopbackChannel::new()), i2c_config()).unwrap();

    let result = i2c.write(&[0x01], TransferOptions::default());
    assert!(matches!(result, Err(ProtocolError::NoResponse { address: 0x48 })));
    // the raw capture stays available for inspection
    assert!(i2c.last_capture().is_some());
}

#[test]
fn test_i2c_data_rejected() {
    let config = i2c_config();
    let channel = LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0], Some(1)));
    let mut i2c = I2c::init(DigitalBus::new(channel), config).unwrap();

    let result = i2c.write(&[0x01, 0x02, 0x03], TransferOptions::default());
    assert!(matches!(result, Err(ProtocolError::DataRejected { index: 1 })));
}

#[test]
fn test_i2c_ten_bit_transfers() {
    let config = I2cConfig::new(pin(0), pin(1), 0x2A5).ten_bit_addressing();
    let channel = LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0x5A, 0xC3], None));
    let bus = DigitalBus::new(channel);
    let mut i2c = I2c::init(Arc::clone(&bus), config).unwrap();

    i2c.write(&[0x01, 0x02], TransferOptions::default()).unwrap();
    assert_eq!(
        i2c.read(2, TransferOptions::default()).unwrap(),
        vec![0x5A, 0xC3]
    );

    // two address bytes precede the data on the wire
    let timing = i2c.timing();
    let encoder = I2cEncoder::new(pin(0), pin(1), timing);
    assert_eq!(bus.channel().pushed()[0].len(), encoder.frame_sample_count(4, true));
}

#[test]
fn test_i2c_ten_bit_wrong_address_is_no_response() {
    // same upper bits, so the prefix byte is acknowledged and the second is not
    let slave = I2cConfig::new(pin(0), pin(1), 0x2A5).ten_bit_addressing();
    let master = I2cConfig::new(pin(0), pin(1), 0x2A6).ten_bit_addressing();
    let channel = LoopbackChannel::new().with_responder(i2c_slave(&slave, vec![0], None));
    let mut i2c = I2c::init(DigitalBus::new(channel), master).unwrap();

    let result = i2c.write(&[0x01], TransferOptions::default());
    assert!(matches!(result, Err(ProtocolError::NoResponse { address: 0x2A6 })));
}

#[test]
fn test_i2c_ten_bit_data_rejected_index() {
    let config = I2cConfig::new(pin(0), pin(1), 0x155).ten_bit_addressing();
    let channel = LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0], Some(1)));
    let mut i2c = I2c::init(DigitalBus::new(channel), config).unwrap();

    let result = i2c.write(&[0x01, 0x02, 0x03], TransferOptions::default());
    assert!(matches!(result, Err(ProtocolError::DataRejected { index: 1 })));
}

#[test]
fn test_i2c_general_call_is_write_only() {
    let config = i2c_config().general_call();
    let channel = LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0], None));
    let mut i2c = I2c::init(DigitalBus::new(channel), config).unwrap();

    i2c.write(&[0x06], TransferOptions::default()).unwrap();
    assert!(matches!(
        i2c.read(1, TransferOptions::default()),
        Err(ProtocolError::InvalidConfiguration(_))
    ));
}

#[test]
fn test_i2c_invalid_address_touches_nothing() {
    let bus = DigitalBus::new(LoopbackChannel::new());
    let result = I2c::init(Arc::clone(&bus), I2cConfig::new(pin(0), pin(1), 0x80));
    assert!(matches!(result, Err(ProtocolError::InvalidConfiguration(_))));
    assert!(bus.channel().calls().is_empty());
}

#[test]
fn test_i2c_init_configures_lines() {
    let bus = DigitalBus::new(LoopbackChannel::new());
    I2c::init(Arc::clone(&bus), i2c_config()).unwrap();

    let calls = bus.channel().calls();
    assert!(calls.contains(&ChannelCall::SetOutputMode(
        pin(0),
        bitbang_rs::OutputMode::OpenDrain
    )));
    assert!(calls.contains(&ChannelCall::SetValue(pin(1), true)));
    assert!(calls.contains(&ChannelCall::SetTriggerDelay(0)));
    assert!(bus.channel().idle().level(pin(0)));
}

#[test]
fn test_i2c_write_only_skips_capture() {
    let bus = DigitalBus::new(LoopbackChannel::new());
    let mut writer = I2c::init_write_only(Arc::clone(&bus), i2c_config()).unwrap();

    writer.write_only(&[0xAA], TransferOptions::default()).unwrap();

    let calls = bus.channel().calls();
    assert!(calls.contains(&ChannelCall::Push(4 * 4 + 9 * 4 * 2 + 3 * 4)));
    assert!(!calls.iter().any(|c| matches!(c, ChannelCall::StartAcquisition(_))));
}

#[test]
fn test_spi_loopback_all_modes() {
    let modes = [SpiMode::Mode0, SpiMode::Mode1, SpiMode::Mode2, SpiMode::Mode3];
    for mode in modes {
        for order in [BitOrder::MsbFirst, BitOrder::LsbFirst] {
            for polarity in [CsPolarity::ActiveLow, CsPolarity::ActiveHigh] {
                let channel = LoopbackChannel::new().with_wire(pin(1), pin(2));
                let config = SpiConfig::new(pin(0), pin(1), pin(2), pin(3))
                    .mode(mode)
                    .bit_order(order)
                    .cs_polarity(polarity);
                let mut spi = Spi::init(DigitalBus::new(channel), config).unwrap();

                assert_eq!(
                    spi.write_and_read(&[0xA5]).unwrap(),
                    vec![0xA5],
                    "{:?} {:?} {:?}",
                    mode,
                    order,
                    polarity
                );
            }
        }
    }
}

#[test]
fn test_spi_without_wire_reads_zeros() {
    let config = SpiConfig::new(pin(0), pin(1), pin(2), pin(3));
    let mut spi = Spi::init(DigitalBus::new(LoopbackChannel::new()), config).unwrap();
    assert_eq!(spi.write_and_read(&[0xFF, 0x0F]).unwrap(), vec![0x00, 0x00]);
}

#[test]
fn test_capture_length_matches_tx_length() {
    for n in [1usize, 2, 8] {
        let data = vec![0x3C; n];

        let bus = DigitalBus::new(LoopbackChannel::new().with_wire(pin(1), pin(2)));
        let config = SpiConfig::new(pin(0), pin(1), pin(2), pin(3));
        Spi::init(Arc::clone(&bus), config)
            .unwrap()
            .write_and_read(&data)
            .unwrap();
        assert_capture_matches_push(&bus.channel().calls());

        let config = i2c_config();
        let channel = LoopbackChannel::new().with_responder(i2c_slave(&config, vec![0], None));
        let bus = DigitalBus::new(channel);
        I2c::init(Arc::clone(&bus), config)
            .unwrap()
            .write(&data, TransferOptions::default())
            .unwrap();
        assert_capture_matches_push(&bus.channel().calls());
    }
}

fn assert_capture_matches_push(calls: &[ChannelCall]) {
    let captured = calls.iter().find_map(|c| match c {
        ChannelCall::StartAcquisition(n) => Some(*n),
        _ => None,
    });
    let pushed = calls.iter().find_map(|c| match c {
        ChannelCall::Push(n) => Some(*n),
        _ => None,
    });
    assert!(captured.is_some());
    assert_eq!(captured, pushed);
}

#[test]
fn test_uart_read_counts_errors() {
    let config = UartConfig::new(pin(4), 115_200).parity(UartParity::Even);
    let channel = LoopbackChannel::new();
    let bus = DigitalBus::new(channel);
    let mut uart = Uart::init(Arc::clone(&bus), config.clone()).unwrap();
    let encoder = UartEncoder::new(&config, uart.timing());
    let s = uart.timing().samples_per_bit();

    let mut corrupted = encoder.encode(&[0x12, 0x34]);
    // data bit 0 of the first character
    corrupted.force_level(s..2 * s, pin(4), true);
    bus.channel().schedule_capture(corrupted);
    bus.channel().schedule_capture(encoder.encode(&[0x56]));

    let reading = uart.read(2).unwrap();
    assert_eq!(reading.data(), vec![0x13, 0x34]);
    assert_eq!(reading.error_count(), 1);
    assert_eq!(uart.total_errors(), 1);

    let reading = uart.read(1).unwrap();
    assert_eq!(reading.data(), vec![0x56]);
    assert_eq!(reading.error_count(), 0);
    assert_eq!(uart.total_errors(), 1);

    let calls = bus.channel().calls();
    assert!(calls.contains(&ChannelCall::SetDirection(pin(4), Direction::Input)));
    assert!(!calls.iter().any(|c| matches!(c, ChannelCall::Push(_))));
}

#[test]
fn test_uart_short_capture_counts_missing_bytes() {
    let config = UartConfig::new(pin(4), 9_600);
    let bus = DigitalBus::new(LoopbackChannel::new());
    let mut uart = Uart::init(Arc::clone(&bus), config.clone()).unwrap();
    let encoder = UartEncoder::new(&config, uart.timing());
    bus.channel().schedule_capture(encoder.encode(&[0x7E]));

    let reading = uart.read(3).unwrap();
    assert_eq!(reading.data(), vec![0x7E]);
    assert_eq!(reading.error_count(), 2);
    assert_eq!(uart.total_errors(), 2);
}

#[test]
fn test_uart_write_pushes_frame() {
    let config = UartConfig::new(pin(4), 9_600);
    let bus = DigitalBus::new(LoopbackChannel::new());
    let mut uart = Uart::init(Arc::clone(&bus), config.clone()).unwrap();

    uart.write(b"ok").unwrap();

    let pushed = bus.channel().pushed();
    assert_eq!(pushed.len(), 1);
    let encoder = UartEncoder::new(&config, uart.timing());
    assert_eq!(pushed[0], encoder.encode(b"ok"));
    assert!(bus.channel().idle().level(pin(4)));
}

#[test]
fn test_arming_precedes_push_under_slow_channel() {
    let config = i2c_config();
    let channel = LoopbackChannel::new()
        .with_arm_delay(Duration::from_millis(40))
        .with_responder(i2c_slave(&config, vec![0], None));
    let bus = DigitalBus::new(channel);
    let mut i2c = I2c::init(Arc::clone(&bus), config).unwrap();

    i2c.write(&[0x55], TransferOptions::default()).unwrap();

    let calls = bus.channel().calls();
    let armed = position(&calls, |c| matches!(c, ChannelCall::StartAcquisition(_)));
    let pushed = position(&calls, |c| matches!(c, ChannelCall::Push(_)));
    assert!(armed < pushed);
}

#[test]
fn test_arm_timeout_fails_before_generation() {
    let timeouts = TransactionTimeouts::new(Duration::from_millis(10), Duration::from_secs(1));
    let config = SpiConfig::new(pin(0), pin(1), pin(2), pin(3)).timeouts(timeouts);
    let channel = LoopbackChannel::new().with_arm_delay(Duration::from_millis(150));
    let bus = DigitalBus::new(channel);
    let mut spi = Spi::init(Arc::clone(&bus), config).unwrap();

    let result = spi.write_and_read(&[0x01]);
    assert!(matches!(
        result,
        Err(ProtocolError::Timeout {
            state: TransactionState::Arming,
            ..
        })
    ));

    thread::sleep(Duration::from_millis(250));
    assert!(bus.channel().pushed().is_empty());
}

#[test]
fn test_shared_bus_serializes_descriptors() {
    let channel = LoopbackChannel::new()
        .with_wire(pin(1), pin(2))
        .with_wire(pin(5), pin(6));
    let bus = DigitalBus::new(channel);
    let mut first = Spi::init(
        Arc::clone(&bus),
        SpiConfig::new(pin(0), pin(1), pin(2), pin(3)),
    )
    .unwrap();
    let mut second = Spi::init(
        Arc::clone(&bus),
        SpiConfig::new(pin(4), pin(5), pin(6), pin(7)).mode(SpiMode::Mode3),
    )
    .unwrap();

    let worker = thread::spawn(move || {
        for i in 0..20u8 {
            assert_eq!(first.write_and_read(&[i, !i]).unwrap(), vec![i, !i]);
        }
    });
    for i in 0..20u8 {
        let data = [i.wrapping_mul(7), 0x81];
        assert_eq!(second.write_and_read(&data).unwrap(), data.to_vec());
    }
    worker.join().unwrap();
}

/// Value of the last call `pick` matches before call index `before`.
fn last_before<T>(
    calls: &[ChannelCall],
    before: usize,
    pick: impl Fn(&ChannelCall) -> Option<T>,
) -> Option<T> {
    calls[..before].iter().rev().find_map(pick)
}

fn last_index(calls: &[ChannelCall], wanted: impl Fn(&ChannelCall) -> bool) -> usize {
    calls.iter().rposition(wanted).expect("call not recorded")
}

#[test]
fn test_shared_bus_rates_follow_each_descriptor() {
    let bus = DigitalBus::new(LoopbackChannel::new().with_wire(pin(1), pin(2)));
    let mut spi = Spi::init(
        Arc::clone(&bus),
        SpiConfig::new(pin(0), pin(1), pin(2), pin(3)).max_speed_hz(1_000_000),
    )
    .unwrap();
    let mut uart = Uart::init(Arc::clone(&bus), UartConfig::new(pin(4), 9_600)).unwrap();
    assert_eq!(spi.timing().sample_rate, 4_000_000);
    assert_eq!(uart.timing().sample_rate, 80_000);

    assert_eq!(spi.write_and_read(&[0x3C]).unwrap(), vec![0x3C]);
    let calls = bus.channel().calls();
    let push = last_index(&calls, |c| matches!(c, ChannelCall::Push(_)));
    let armed = last_index(&calls, |c| matches!(c, ChannelCall::StartAcquisition(_)));
    let rate = |direction: Direction| {
        move |c: &ChannelCall| match c {
            ChannelCall::SetSampleRate(d, rate) if *d == direction => Some(*rate),
            _ => None,
        }
    };
    assert_eq!(last_before(&calls, push, rate(Direction::Output)), Some(4_000_000));
    assert_eq!(last_before(&calls, armed, rate(Direction::Input)), Some(4_000_000));

    uart.write(b"x").unwrap();
    let calls = bus.channel().calls();
    let push = last_index(&calls, |c| matches!(c, ChannelCall::Push(_)));
    assert_eq!(last_before(&calls, push, rate(Direction::Output)), Some(80_000));
}

#[test]
fn test_shared_bus_trigger_does_not_leak() {
    let i2c_config = i2c_config();
    let channel = LoopbackChannel::new()
        .with_responder(i2c_slave(&i2c_config, vec![0], None))
        .with_wire(pin(5), pin(6));
    let bus = DigitalBus::new(channel);
    let mut i2c = I2c::init(Arc::clone(&bus), i2c_config).unwrap();
    let mut spi = Spi::init(
        Arc::clone(&bus),
        SpiConfig::new(pin(4), pin(5), pin(6), pin(7)),
    )
    .unwrap();

    i2c.write(&[0x42], TransferOptions::default()).unwrap();
    spi.write_and_read(&[0x99]).unwrap();

    let calls = bus.channel().calls();
    let armed = last_index(&calls, |c| matches!(c, ChannelCall::StartAcquisition(_)));
    let condition = |wanted: Pin| {
        move |c: &ChannelCall| match c {
            ChannelCall::SetTriggerCondition(line, set) if *line == wanted => Some(*set),
            _ => None,
        }
    };
    assert_eq!(
        last_before(&calls, armed, condition(pin(1))),
        Some(TriggerCondition::Disabled)
    );
    assert_eq!(
        last_before(&calls, armed, condition(pin(7))),
        Some(TriggerCondition::FallingEdge)
    );
}

#[test]
fn test_init_waits_for_running_transaction() {
    let channel = LoopbackChannel::new()
        .with_wire(pin(1), pin(2))
        .with_arm_delay(Duration::from_millis(100));
    let bus = DigitalBus::new(channel);
    let mut spi = Spi::init(
        Arc::clone(&bus),
        SpiConfig::new(pin(0), pin(1), pin(2), pin(3)),
    )
    .unwrap();

    let transfer = thread::spawn(move || spi.write_and_read(&[0xA5]));
    thread::sleep(Duration::from_millis(30));
    Uart::init(Arc::clone(&bus), UartConfig::new(pin(4), 9_600)).unwrap();

    assert_eq!(transfer.join().unwrap().unwrap(), vec![0xA5]);
    let calls = bus.channel().calls();
    let push = position(&calls, |c| matches!(c, ChannelCall::Push(_)));
    let uart_setup = position(&calls, |c| {
        matches!(c, ChannelCall::SetOutputMode(p, _) if *p == pin(4))
    });
    assert!(push < uart_setup);
}
