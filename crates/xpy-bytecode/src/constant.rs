//! Literal constants carried by `LOAD_CONST`

use std::fmt;

use serde::{Deserialize, Serialize};

/// A literal operand of `LOAD_CONST`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    /// The `None` literal
    None,
    /// Integer literal (arbitrary width in the source, range-checked on use)
    Int(i128),
    /// String literal
    Str(String),
    /// Tuple of literals
    Tuple(Vec<Constant>),
}

impl Constant {
    /// Create an integer constant
    #[inline]
    pub fn int(value: impl Into<i128>) -> Self {
        Self::Int(value.into())
    }

    /// Create a string constant
    #[inline]
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    /// Get as integer if this is an integer constant
    #[inline]
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Short name of the literal kind, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Int(_) => "int",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Constant::int(-3).to_string(), "-3");
        assert_eq!(Constant::str("hi").to_string(), "\"hi\"");
        assert_eq!(Constant::Tuple(vec![Constant::int(1)]).to_string(), "(1,)");
        assert_eq!(
            Constant::Tuple(vec![Constant::int(1), Constant::None]).to_string(),
            "(1, None)"
        );
    }

    #[test]
    fn test_as_int() {
        assert_eq!(Constant::int(7).as_int(), Some(7));
        assert_eq!(Constant::None.as_int(), None);
    }
}
