//! The closed type lattice carried by IR values.

use std::fmt;

/// Type of an SSA value. `Value` is the boxed "anything" type; `None` is
/// reserved for instructions that produce no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    Int32,
    Double,
    Boolean,
    Str,
    Object,
    Value,
    None,
}

impl IrType {
    /// True for the two numeric types range analysis reasons about.
    pub fn is_numeric(self) -> bool {
        matches!(self, IrType::Int32 | IrType::Double)
    }

    /// Types a boxed value can be unboxed to.
    pub fn is_unboxable(self) -> bool {
        !matches!(self, IrType::Value | IrType::None)
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IrType::Int32 => "int32",
            IrType::Double => "double",
            IrType::Boolean => "bool",
            IrType::Str => "string",
            IrType::Object => "object",
            IrType::Value => "value",
            IrType::None => "none",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_types() {
        assert!(IrType::Int32.is_numeric());
        assert!(IrType::Double.is_numeric());
        assert!(!IrType::Boolean.is_numeric());
        assert!(!IrType::Value.is_numeric());
    }

    #[test]
    fn display() {
        assert_eq!(IrType::Int32.to_string(), "int32");
        assert_eq!(IrType::Value.to_string(), "value");
    }
}
