use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::SlotError;

/// A textual slot specification, as found in machine definitions.
///
/// Tokens come in four shapes: a literal primary slot number (`"0"`..`"3"`),
/// a reserved primary slot (`"?0"`..`"?3"`), one of the sixteen named
/// external slots (`"a"`..`"p"`), or the wildcard (`"any"` / `"X"`) which
/// lets the arbiter pick any free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotSpec {
    Literal(u8),
    Reserved(u8),
    Named(u8),
    Any,
}

impl SlotSpec {
    pub fn parse(token: &str) -> Result<Self, SlotError> {
        let bytes = token.as_bytes();
        match bytes {
            [c @ b'a'..=b'p'] => Ok(SlotSpec::Named(c - b'a')),
            [b'X'] => Ok(SlotSpec::Any),
            [b'?', c] => {
                if c.is_ascii_digit() && (*c - b'0') < 4 {
                    Ok(SlotSpec::Reserved(c - b'0'))
                } else {
                    Err(SlotError::InvalidSlotSpecification(token.to_string()))
                }
            }
            _ if token == "any" => Ok(SlotSpec::Any),
            _ => match token.parse::<i64>() {
                Ok(n) if (0..4).contains(&n) => Ok(SlotSpec::Literal(n as u8)),
                _ => Err(SlotError::InvalidSlotSpecification(token.to_string())),
            },
        }
    }
}

impl FromStr for SlotSpec {
    type Err = SlotError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        SlotSpec::parse(token)
    }
}

impl fmt::Display for SlotSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotSpec::Literal(n) => write!(f, "{}", n),
            SlotSpec::Reserved(n) => write!(f, "?{}", n),
            SlotSpec::Named(i) => write!(f, "{}", (b'a' + i) as char),
            SlotSpec::Any => write!(f, "any"),
        }
    }
}

/// A concrete slot coordinate: primary slot 0..=3, and an optional
/// secondary slot. `None` means the primary is addressed directly, with no
/// secondary mapping ("unexpanded").
///
/// The derived ordering sorts unexpanded before secondary slot 0 of the
/// same primary, which is what free-slot discovery relies on.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SlotAddress {
    pub primary: u8,
    pub secondary: Option<u8>,
}

impl SlotAddress {
    pub fn new(primary: u8, secondary: Option<u8>) -> Self {
        assert!(primary < 4, "primary slot out of range: {}", primary);
        if let Some(ss) = secondary {
            assert!(ss < 4, "secondary slot out of range: {}", ss);
        }
        SlotAddress { primary, secondary }
    }

    pub fn unexpanded(primary: u8) -> Self {
        Self::new(primary, None)
    }

    pub fn expanded(primary: u8, secondary: u8) -> Self {
        Self::new(primary, Some(secondary))
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secondary {
            Some(ss) => write!(f, "{}-{}", self.primary, ss),
            None => write!(f, "{}", self.primary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literal_primary_slots() {
        for n in 0..4u8 {
            assert_eq!(SlotSpec::parse(&n.to_string()), Ok(SlotSpec::Literal(n)));
        }
        assert_eq!(SlotSpec::parse("03"), Ok(SlotSpec::Literal(3)));
    }

    #[test]
    fn parses_sixteen_distinct_named_slots() {
        let mut seen = Vec::new();
        for c in b'a'..=b'p' {
            let token = String::from_utf8(vec![c]).unwrap();
            let spec = SlotSpec::parse(&token).unwrap();
            assert!(matches!(spec, SlotSpec::Named(_)));
            assert!(!seen.contains(&spec), "duplicate code for {}", token);
            seen.push(spec);
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn wildcard_spellings_are_identical() {
        assert_eq!(SlotSpec::parse("any").unwrap(), SlotSpec::Any);
        assert_eq!(SlotSpec::parse("X").unwrap(), SlotSpec::Any);
    }

    #[test]
    fn reserved_slots_are_distinct_from_literals() {
        for n in 0..4u8 {
            let reserved = SlotSpec::parse(&format!("?{}", n)).unwrap();
            assert_eq!(reserved, SlotSpec::Reserved(n));
            for m in 0..4u8 {
                assert_ne!(reserved, SlotSpec::Literal(m));
            }
        }
    }

    #[test]
    fn rejects_everything_else() {
        for token in ["", "q", "4", "-1", "?4", "?a", "anything", "A", "aa", "0x1"] {
            assert_eq!(
                SlotSpec::parse(token),
                Err(SlotError::InvalidSlotSpecification(token.to_string())),
                "token {:?} should not parse",
                token
            );
        }
    }

    #[test]
    fn parse_round_trips_through_display() {
        for token in ["0", "3", "?2", "a", "p", "any"] {
            let spec = SlotSpec::parse(token).unwrap();
            assert_eq!(SlotSpec::parse(&spec.to_string()).unwrap(), spec);
        }
    }

    #[test]
    fn unexpanded_sorts_before_secondary_zero() {
        assert!(SlotAddress::unexpanded(1) < SlotAddress::expanded(1, 0));
        assert!(SlotAddress::expanded(0, 3) < SlotAddress::unexpanded(1));
        assert!(SlotAddress::expanded(1, 0) < SlotAddress::expanded(1, 1));
    }
}
