use crate::digital_channel::{ChannelError, DigitalChannel};
use crate::sample::Pin;

/// Per-pin condition of the digital hardware trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    Disabled,
    RisingEdge,
    FallingEdge,
    Low,
    High,
    AnyEdge,
}

impl TriggerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::Disabled => "none",
            TriggerCondition::RisingEdge => "edge-rising",
            TriggerCondition::FallingEdge => "edge-falling",
            TriggerCondition::Low => "level-low",
            TriggerCondition::High => "level-high",
            TriggerCondition::AnyEdge => "edge-any",
        }
    }
}

/// How the per-pin conditions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Or,
    And,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Or => "or",
            TriggerMode::And => "and",
        }
    }
}

#[derive(Debug)]
pub struct PinTriggerBuilder {
    conditions: [Option<TriggerCondition>; Pin::COUNT as usize],
    delay: i32,
}

impl PinTriggerBuilder {
    pub fn new() -> Self {
        Self {
            conditions: [None; Pin::COUNT as usize],
            delay: 0,
        }
    }

    pub fn set_pin(mut self, pin: Pin, condition: TriggerCondition) -> Self {
        self.conditions[usize::from(pin.index())] = Some(condition);
        self
    }

    pub fn rising_edge(self, pin: Pin) -> Self {
        self.set_pin(pin, TriggerCondition::RisingEdge)
    }

    pub fn falling_edge(self, pin: Pin) -> Self {
        self.set_pin(pin, TriggerCondition::FallingEdge)
    }

    pub fn any_edge(self, pin: Pin) -> Self {
        self.set_pin(pin, TriggerCondition::AnyEdge)
    }

    pub fn low(self, pin: Pin) -> Self {
        self.set_pin(pin, TriggerCondition::Low)
    }

    pub fn high(self, pin: Pin) -> Self {
        self.set_pin(pin, TriggerCondition::High)
    }

    /// Leave the pin out of the trigger.
    pub fn ignore(self, pin: Pin) -> Self {
        self.set_pin(pin, TriggerCondition::Disabled)
    }

    /// Delay in samples between the trigger event and the first captured sample.
    /// Negative values keep samples from before the event.
    pub fn delay(mut self, samples: i32) -> Self {
        self.delay = samples;
        self
    }

    /// Trigger when any configured pin matches.
    pub fn any_of(self) -> DigitalTrigger {
        DigitalTrigger::new(self.conditions, TriggerMode::Or, self.delay)
    }

    /// Trigger when all configured pins match.
    pub fn all_of(self) -> DigitalTrigger {
        DigitalTrigger::new(self.conditions, TriggerMode::And, self.delay)
    }
}

impl Default for PinTriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Digital trigger configuration. Pins without a condition are disabled when
/// the trigger is applied, so nothing armed by an earlier trigger survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigitalTrigger {
    pub conditions: [Option<TriggerCondition>; Pin::COUNT as usize],
    pub mode: TriggerMode,
    pub delay: i32,
}

impl DigitalTrigger {
    pub fn new(
        conditions: [Option<TriggerCondition>; Pin::COUNT as usize],
        mode: TriggerMode,
        delay: i32,
    ) -> Self {
        Self {
            conditions,
            mode,
            delay,
        }
    }

    pub fn start_capturing_when() -> PinTriggerBuilder {
        PinTriggerBuilder::new()
    }

    /// Trigger that disables every listed pin, ORed, without delay.
    pub fn disarmed(pins: &[Pin]) -> Self {
        pins.iter()
            .fold(PinTriggerBuilder::new(), |builder, &pin| builder.ignore(pin))
            .any_of()
    }

    pub fn condition(&self, pin: Pin) -> Option<TriggerCondition> {
        self.conditions[usize::from(pin.index())]
    }

    pub fn apply<C: DigitalChannel + ?Sized>(&self, channel: &C) -> Result<(), ChannelError> {
        for pin in Pin::all() {
            let condition = self.condition(pin).unwrap_or(TriggerCondition::Disabled);
            if condition != TriggerCondition::Disabled {
                log::trace!("Trigger on {}: {}", pin, condition.as_str());
            }
            channel.set_trigger_condition(pin, condition)?;
        }
        channel.set_trigger_mode(self.mode)?;
        channel.set_trigger_delay(self.delay)
    }
}
