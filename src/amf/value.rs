//! AMF value types
//!
//! RTMP command and data messages carry a small dynamically-typed value
//! language. This enum is the in-memory representation; every consumer
//! pattern-matches on it.

/// An ordered set of key/value properties.
///
/// AMF objects preserve wire order, so properties are kept as a vector of
/// pairs rather than a hash map.
pub type AmfProperties = Vec<(String, AmfValue)>;

/// AMF0 value in the subset used by RTMP commands
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// IEEE 754 double-precision floating point (marker 0x00)
    Number(f64),

    /// Boolean value (marker 0x01)
    Boolean(bool),

    /// UTF-8 string (marker 0x02, or 0x0C when longer than 65 535 bytes)
    String(String),

    /// Key-value object (marker 0x03)
    Object(AmfProperties),

    /// Null value (marker 0x05)
    Null,

    /// ECMA array: an associative array with a count hint (marker 0x08)
    EcmaArray(AmfProperties),
}

impl AmfValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value's properties (objects and ECMA arrays)
    pub fn as_object(&self) -> Option<&AmfProperties> {
        match self {
            AmfValue::Object(p) => Some(p),
            AmfValue::EcmaArray(p) => Some(p),
            _ => None,
        }
    }

    /// Get a property from an object value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Get a string property from an object value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a number property from an object value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    /// Wire-level type name, used in command parameter errors
    pub fn type_name(&self) -> &'static str {
        match self {
            AmfValue::Number(_) => "number",
            AmfValue::Boolean(_) => "boolean",
            AmfValue::String(_) => "string",
            AmfValue::Object(_) => "object",
            AmfValue::Null => "null",
            AmfValue::EcmaArray(_) => "ecma-array",
        }
    }
}

impl Default for AmfValue {
    fn default() -> Self {
        AmfValue::Null
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

// Every numeric input widens to a double before encoding.
macro_rules! amf_number_from {
    ($($t:ty),*) => {
        $(impl From<$t> for AmfValue {
            fn from(v: $t) -> Self {
                AmfValue::Number(v as f64)
            }
        })*
    };
}

amf_number_from!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl From<AmfProperties> for AmfValue {
    fn from(v: AmfProperties) -> Self {
        AmfValue::Object(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let s = AmfValue::String("test".into());
        assert_eq!(s.as_str(), Some("test"));
        assert_eq!(s.as_number(), None);

        let n = AmfValue::Number(42.0);
        assert_eq!(n.as_number(), Some(42.0));
        assert_eq!(n.as_str(), None);

        let o = AmfValue::Object(vec![("key".to_string(), AmfValue::String("value".into()))]);
        assert_eq!(o.get_string("key"), Some("value"));
        assert_eq!(o.get("missing"), None);
    }

    #[test]
    fn test_numeric_widening() {
        assert_eq!(AmfValue::from(7u8), AmfValue::Number(7.0));
        assert_eq!(AmfValue::from(-3i64), AmfValue::Number(-3.0));
        assert_eq!(AmfValue::from(1.5f32), AmfValue::Number(1.5));
        assert_eq!(AmfValue::from(u64::MAX), AmfValue::Number(u64::MAX as f64));
    }

    #[test]
    fn test_from_conversions() {
        let v: AmfValue = "test".into();
        assert!(matches!(v, AmfValue::String(_)));

        let v: AmfValue = true.into();
        assert!(matches!(v, AmfValue::Boolean(true)));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(AmfValue::Null.type_name(), "null");
        assert_eq!(AmfValue::Number(0.0).type_name(), "number");
        assert_eq!(AmfValue::EcmaArray(vec![]).type_name(), "ecma-array");
    }
}
