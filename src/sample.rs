//! Sample words and buffers exchanged with the digital channel.
//!
//! A [`SampleWord`] holds the level of every digital line at one sample instant,
//! bit *i* being line *i*. Lines are addressed through [`Pin`], which is validated
//! once at construction so the per-sample accessors never index out of range.

use crate::error::ProtocolError;
use std::fmt;
use std::ops::Range;

/// Index of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pin(u8);

impl Pin {
    /// Number of digital lines a [`SampleWord`] can carry.
    pub const COUNT: u8 = 16;

    pub fn new(index: u8) -> Result<Self, ProtocolError> {
        if index >= Self::COUNT {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "Pin index {} out of range, must be between 0 and {}",
                index,
                Self::COUNT - 1
            )));
        }
        Ok(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Every line, in index order.
    pub fn all() -> impl Iterator<Item = Pin> {
        (0..Self::COUNT).map(Pin)
    }

    fn mask(self) -> u16 {
        1 << self.0
    }
}

impl TryFrom<u8> for Pin {
    type Error = ProtocolError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index)
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DIO{}", self.0)
    }
}

/// Levels of all digital lines at one sample instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SampleWord(u16);

impl SampleWord {
    pub const LOW: Self = Self(0);

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn level(self, pin: Pin) -> bool {
        self.0 & pin.mask() != 0
    }

    pub fn set_level(&mut self, pin: Pin, level: bool) {
        if level {
            self.0 |= pin.mask();
        } else {
            self.0 &= !pin.mask();
        }
    }

    /// Builder form of [`SampleWord::set_level`].
    pub fn with_level(mut self, pin: Pin, level: bool) -> Self {
        self.set_level(pin, level);
        self
    }
}

impl From<u16> for SampleWord {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SampleWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// An ordered run of samples, either generated (TX) or captured (RX).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleBuffer {
    samples: Vec<SampleWord>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn from_raw(raw: Vec<u16>) -> Self {
        Self {
            samples: raw.into_iter().map(SampleWord::from_raw).collect(),
        }
    }

    pub fn into_raw(self) -> Vec<u16> {
        self.samples.into_iter().map(SampleWord::raw).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn push(&mut self, word: SampleWord) {
        self.samples.push(word);
    }

    /// Append `count` copies of `word`, i.e. hold the lines for `count` samples.
    pub fn push_repeat(&mut self, word: SampleWord, count: usize) {
        self.samples.resize(self.samples.len() + count, word);
    }

    pub fn extend_from(&mut self, other: &SampleBuffer) {
        self.samples.extend_from_slice(&other.samples);
    }

    pub fn get(&self, index: usize) -> Option<SampleWord> {
        self.samples.get(index).copied()
    }

    pub fn last(&self) -> Option<SampleWord> {
        self.samples.last().copied()
    }

    /// Level of `pin` at sample `index`, `None` past the end of the buffer.
    pub fn level(&self, index: usize, pin: Pin) -> Option<bool> {
        self.get(index).map(|word| word.level(pin))
    }

    pub fn levels(&self, pin: Pin) -> impl Iterator<Item = bool> + '_ {
        self.samples.iter().map(move |word| word.level(pin))
    }

    pub fn iter(&self) -> impl Iterator<Item = SampleWord> + '_ {
        self.samples.iter().copied()
    }

    pub fn as_slice(&self) -> &[SampleWord] {
        &self.samples
    }

    /// Drive `pin` to `level` over `range`, clamped to the buffer.
    pub fn force_level(&mut self, range: Range<usize>, pin: Pin, level: bool) {
        let end = range.end.min(self.samples.len());
        let start = range.start.min(end);
        for word in &mut self.samples[start..end] {
            word.set_level(pin, level);
        }
    }

    /// Copy the levels of line `from` onto line `to`, like a jumper wire.
    pub fn copy_line(&mut self, from: Pin, to: Pin) {
        for word in &mut self.samples {
            let level = word.level(from);
            word.set_level(to, level);
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.samples.truncate(len);
    }

    /// Pad with the final sample (or `idle` when empty) up to `len` samples.
    pub fn hold_to_len(&mut self, len: usize, idle: SampleWord) {
        let fill = self.last().unwrap_or(idle);
        if self.samples.len() < len {
            self.samples.resize(len, fill);
        }
    }
}

impl From<Vec<SampleWord>> for SampleBuffer {
    fn from(samples: Vec<SampleWord>) -> Self {
        Self { samples }
    }
}

impl FromIterator<SampleWord> for SampleBuffer {
    fn from_iter<I: IntoIterator<Item = SampleWord>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

impl Extend<SampleWord> for SampleBuffer {
    fn extend<I: IntoIterator<Item = SampleWord>>(&mut self, iter: I) {
        self.samples.extend(iter);
    }
}

impl IntoIterator for SampleBuffer {
    type Item = SampleWord;
    type IntoIter = std::vec::IntoIter<SampleWord>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}
