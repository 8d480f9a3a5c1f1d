//! Bin values and their particle encoding.
use std::fmt::Display;

/// Particle type tags shared by the key digest and the wire codec.
pub mod particle {
    /// No value.
    pub const NIL: u8 = 0;
    /// Big-endian `i64`.
    pub const INTEGER: u8 = 1;
    /// Big-endian IEEE-754 `f64`.
    pub const FLOAT: u8 = 2;
    /// UTF-8 string.
    pub const STRING: u8 = 3;
    /// Opaque bytes.
    pub const BLOB: u8 = 4;
}

/// A value stored in a bin, or used as a user key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Nil,
    /// Signed integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Particle type tag of this value.
    pub fn particle_type(&self) -> u8 {
        match self {
            Self::Nil => particle::NIL,
            Self::Int(_) => particle::INTEGER,
            Self::Float(_) => particle::FLOAT,
            Self::String(_) => particle::STRING,
            Self::Blob(_) => particle::BLOB,
        }
    }

    /// Encoded payload, without the particle type.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Nil => vec![],
            Self::Int(v) => v.to_be_bytes().to_vec(),
            Self::Float(v) => v.to_bits().to_be_bytes().to_vec(),
            Self::String(v) => v.as_bytes().to_vec(),
            Self::Blob(v) => v.clone(),
        }
    }

    /// Returns the integer if this is an [`Value::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string slice if this is a [`Value::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Blob(v) => write!(f, "0x{}", hex::encode(v)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

/// A named value, the unit of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Bin name.
    pub name: String,
    /// Bin value.
    pub value: Value,
}

impl Bin {
    /// Create a new bin.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Value::from("batchvalue1").to_string(), "batchvalue1");
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::Blob(vec![0xde, 0xad]).to_string(), "0xdead");
        assert_eq!(Value::Nil.to_string(), "nil");
    }

    #[test]
    fn test_bytes() {
        assert_eq!(Value::Int(1).to_bytes(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(Value::from("ab").to_bytes(), b"ab".to_vec());
        assert!(Value::Nil.to_bytes().is_empty());
    }
}
