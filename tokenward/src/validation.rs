//! Validation rules shared by the crate's value types

use thiserror::Error;

/// A value rejected while constructing one of the crate's value types
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvalidValue {
    /// The value was the empty string
    #[error("{kind} cannot be empty")]
    Empty {
        /// The kind of value being validated
        kind: &'static str,
    },
    /// The value was longer than allowed
    #[error("{kind} exceeds the maximum length of {max} bytes (was {len})")]
    TooLong {
        /// The kind of value being validated
        kind: &'static str,
        /// The maximum length, in bytes
        max: usize,
        /// The actual length, in bytes
        len: usize,
    },
    /// The value contained a disallowed character
    #[error("invalid {kind} character at position {position}: {value:?}")]
    InvalidChar {
        /// The kind of value being validated
        kind: &'static str,
        /// The byte index where the invalid character was found
        position: usize,
        /// The invalid character
        value: char,
    },
}

aliri_braid::from_infallible!(InvalidValue);

/// A single check applied to the raw text of a value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rule {
    NonEmpty,
    MaxLength(usize),
    /// Visible ASCII only, so no whitespace
    VisibleAscii,
    /// Anything but control characters
    NoControl,
}

impl Rule {
    fn check(self, kind: &'static str, raw: &str) -> Result<(), InvalidValue> {
        let offending = match self {
            Rule::NonEmpty if raw.is_empty() => return Err(InvalidValue::Empty { kind }),
            Rule::MaxLength(max) if raw.len() > max => {
                return Err(InvalidValue::TooLong {
                    kind,
                    max,
                    len: raw.len(),
                })
            }
            Rule::VisibleAscii => raw.char_indices().find(|&(_, c)| !c.is_ascii_graphic()),
            Rule::NoControl => raw.char_indices().find(|&(_, c)| c.is_control()),
            _ => None,
        };

        match offending {
            Some((position, value)) => Err(InvalidValue::InvalidChar {
                kind,
                position,
                value,
            }),
            None => Ok(()),
        }
    }
}

/// Applies each rule in order, reporting the first violation
pub(crate) fn check(kind: &'static str, raw: &str, rules: &[Rule]) -> Result<(), InvalidValue> {
    rules.iter().try_for_each(|rule| rule.check(kind, raw))
}

/// Implements [`aliri_braid::Validator`] for a braid from a list of rules
macro_rules! validated {
    ($ty:ty: $kind:literal, [$($rule:expr),* $(,)?]) => {
        impl aliri_braid::Validator for $ty {
            type Error = $crate::validation::InvalidValue;

            fn validate(raw: &str) -> Result<(), Self::Error> {
                $crate::validation::check($kind, raw, &[$($rule),*])
            }
        }
    };
}

pub(crate) use validated;

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_RULES: &[Rule] = &[Rule::NonEmpty, Rule::MaxLength(8), Rule::VisibleAscii];

    #[test]
    fn first_violation_wins() {
        assert_eq!(
            check("token", "", TOKEN_RULES),
            Err(InvalidValue::Empty { kind: "token" })
        );
        assert_eq!(
            check("token", "a b c d e f", TOKEN_RULES),
            Err(InvalidValue::TooLong {
                kind: "token",
                max: 8,
                len: 11
            })
        );
    }

    #[test]
    fn whitespace_is_not_visible_ascii() {
        assert_eq!(
            check("token", "ab cd", TOKEN_RULES),
            Err(InvalidValue::InvalidChar {
                kind: "token",
                position: 2,
                value: ' '
            })
        );
    }

    #[test]
    fn no_control_allows_spaces_and_unicode() {
        assert!(check("scope", "api1 api2 café", &[Rule::NoControl]).is_ok());
        assert!(check("scope", "api1\napi2", &[Rule::NoControl]).is_err());
    }
}
