//! Bitmask-backed status sets
//!
//! Script status, transaction status and output type are stored as single
//! bits so that queries can filter on several states at once. Each enum
//! carries one table that fixes its bit values, labels and decoding order.

use std::fmt;
use std::marker::PhantomData;

/// An enum whose variants map to distinct bits.
pub trait Flag: Copy + Eq + 'static {
    /// Every variant with its bit and label, in decoding order.
    const TABLE: &'static [(Self, u32, &'static str)];

    fn bit(self) -> u32 {
        Self::TABLE
            .iter()
            .find(|(flag, _, _)| *flag == self)
            .map(|(_, bit, _)| *bit)
            .unwrap_or(0)
    }

    fn label(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(flag, _, _)| *flag == self)
            .map(|(_, _, label)| *label)
            .unwrap_or(UNKNOWN)
    }

    /// Exact single-bit lookup.
    fn from_bit(bit: u32) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(_, b, _)| *b == bit)
            .map(|(flag, _, _)| *flag)
    }
}

/// Label used when no known bit is set.
pub const UNKNOWN: &str = "UNKNOWN";

/// A set of flags of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagSet<F: Flag> {
    bits: u32,
    _kind: PhantomData<F>,
}

impl<F: Flag> FlagSet<F> {
    pub fn empty() -> Self {
        Self::from_bits(0)
    }

    /// Every known flag.
    pub fn all() -> Self {
        Self::from_bits(F::TABLE.iter().fold(0, |acc, (_, bit, _)| acc | bit))
    }

    /// Unknown bits are dropped.
    pub fn from_bits(bits: u32) -> Self {
        let known = F::TABLE.iter().fold(0, |acc, (_, bit, _)| acc | bit);
        Self {
            bits: bits & known,
            _kind: PhantomData,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, flag: F) -> bool {
        self.bits & flag.bit() != 0
    }

    pub fn insert(&mut self, flag: F) {
        self.bits |= flag.bit();
    }

    /// Set flags in table order.
    pub fn flags(&self) -> Vec<F> {
        F::TABLE
            .iter()
            .filter(|(_, bit, _)| self.bits & bit != 0)
            .map(|(flag, _, _)| *flag)
            .collect()
    }
}

impl<F: Flag> Default for FlagSet<F> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<F: Flag> From<F> for FlagSet<F> {
    fn from(flag: F) -> Self {
        Self::from_bits(flag.bit())
    }
}

impl<F: Flag> FromIterator<F> for FlagSet<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        let mut set = Self::empty();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

/// `"A | B"` in table order, or [`UNKNOWN`] when empty.
impl<F: Flag> fmt::Display for FlagSet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.flags().into_iter().map(Flag::label).collect();
        if labels.is_empty() {
            f.write_str(UNKNOWN)
        } else {
            f.write_str(&labels.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Color {
        Red,
        Green,
        Blue,
    }

    impl Flag for Color {
        const TABLE: &'static [(Self, u32, &'static str)] = &[
            (Color::Red, 1, "RED"),
            (Color::Green, 2, "GREEN"),
            (Color::Blue, 4, "BLUE"),
        ];
    }

    #[test]
    fn test_decode_in_table_order() {
        let set = FlagSet::<Color>::from_bits(4 | 1);
        assert_eq!(set.flags(), vec![Color::Red, Color::Blue]);
        assert_eq!(set.to_string(), "RED | BLUE");
    }

    #[test]
    fn test_empty_and_unknown_bits_decode_to_unknown() {
        assert_eq!(FlagSet::<Color>::from_bits(0).to_string(), "UNKNOWN");
        assert_eq!(FlagSet::<Color>::from_bits(64).to_string(), "UNKNOWN");
        assert!(FlagSet::<Color>::from_bits(64).flags().is_empty());
    }

    #[test]
    fn test_all_and_contains() {
        let all = FlagSet::<Color>::all();
        assert_eq!(all.bits(), 7);
        assert!(all.contains(Color::Green));

        let some: FlagSet<Color> = [Color::Green].into_iter().collect();
        assert!(!some.contains(Color::Red));
        assert_eq!(Color::from_bit(2), Some(Color::Green));
        assert_eq!(Color::from_bit(3), None);
    }
}
