use std::cmp::Ordering;
use std::fmt::Display;

use anyhow::{Error, Result};

/// Type tags for every value the engine stores or computes. Char types are
/// fixed-width, zero-padded byte arrays; their width is part of the tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Char8,
    Char16,
    Char32,
    Char64,
    Char128,
    Char256,
    Null,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
            DataType::Char8 => 8,
            DataType::Char16 => 16,
            DataType::Char32 => 32,
            DataType::Char64 => 64,
            DataType::Char128 => 128,
            DataType::Char256 => 256,
            DataType::Null => 0,
        }
    }

    pub fn is_char(self) -> bool {
        matches!(
            self,
            DataType::Char8
                | DataType::Char16
                | DataType::Char32
                | DataType::Char64
                | DataType::Char128
                | DataType::Char256
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::U8
                | DataType::U16
                | DataType::U32
                | DataType::U64
                | DataType::I8
                | DataType::I16
                | DataType::I32
                | DataType::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn char_of_width(width: usize) -> Option<DataType> {
        match width {
            8 => Some(DataType::Char8),
            16 => Some(DataType::Char16),
            32 => Some(DataType::Char32),
            64 => Some(DataType::Char64),
            128 => Some(DataType::Char128),
            256 => Some(DataType::Char256),
            _ => None,
        }
    }

    /// Compares two serialized values of this type. Chars compare bytewise
    /// over the full width, numbers numerically.
    pub fn compare(self, left: &[u8], right: &[u8]) -> Ordering {
        debug_assert_eq!(left.len(), self.size());
        debug_assert_eq!(right.len(), self.size());
        match self {
            DataType::U8 => left[0].cmp(&right[0]),
            DataType::U16 => read_u16(left).cmp(&read_u16(right)),
            DataType::U32 => read_u32(left).cmp(&read_u32(right)),
            DataType::U64 => read_u64(left).cmp(&read_u64(right)),
            DataType::I8 => (left[0] as i8).cmp(&(right[0] as i8)),
            DataType::I16 => read_i16(left).cmp(&read_i16(right)),
            DataType::I32 => read_i32(left).cmp(&read_i32(right)),
            DataType::I64 => read_i64(left).cmp(&read_i64(right)),
            DataType::F32 => read_f32(left)
                .partial_cmp(&read_f32(right))
                .unwrap_or(Ordering::Equal),
            DataType::F64 => read_f64(left)
                .partial_cmp(&read_f64(right))
                .unwrap_or(Ordering::Equal),
            _ if self.is_char() => left.cmp(right),
            _ => Ordering::Equal,
        }
    }

    /// In-place increment of an integer value, used for key generation.
    pub fn increment(self, bytes: &mut [u8]) {
        match self {
            DataType::U8 | DataType::I8 => bytes[0] = bytes[0].wrapping_add(1),
            DataType::U16 | DataType::I16 => {
                bytes.copy_from_slice(&read_u16(bytes).wrapping_add(1).to_le_bytes())
            }
            DataType::U32 | DataType::I32 => {
                bytes.copy_from_slice(&read_u32(bytes).wrapping_add(1).to_le_bytes())
            }
            DataType::U64 | DataType::I64 => {
                bytes.copy_from_slice(&read_u64(bytes).wrapping_add(1).to_le_bytes())
            }
            _ => unreachable!("increment on non-integer type"),
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes(b[..2].try_into().unwrap())
}
fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes(b[..4].try_into().unwrap())
}
fn read_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes(b[..8].try_into().unwrap())
}
fn read_i16(b: &[u8]) -> i16 {
    i16::from_le_bytes(b[..2].try_into().unwrap())
}
fn read_i32(b: &[u8]) -> i32 {
    i32::from_le_bytes(b[..4].try_into().unwrap())
}
fn read_i64(b: &[u8]) -> i64 {
    i64::from_le_bytes(b[..8].try_into().unwrap())
}
fn read_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes(b[..4].try_into().unwrap())
}
fn read_f64(b: &[u8]) -> f64 {
    f64::from_le_bytes(b[..8].try_into().unwrap())
}

/// An owned, typed value. Registers, result rows and literals all carry
/// values in this form; page bytes are always copied out into one of these
/// before any operation that could move the page.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    ty: DataType,
    data: Vec<u8>,
}

impl Value {
    pub fn from_bytes(ty: DataType, bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), ty.size());
        Self {
            ty,
            data: bytes.to_vec(),
        }
    }

    pub fn from_u32(val: u32) -> Self {
        Self {
            ty: DataType::U32,
            data: val.to_le_bytes().to_vec(),
        }
    }

    pub fn from_u64(val: u64) -> Self {
        Self {
            ty: DataType::U64,
            data: val.to_le_bytes().to_vec(),
        }
    }

    /// Builds an integer value of the requested width.
    pub fn from_int(ty: DataType, val: i64) -> Result<Self> {
        let data = match ty {
            DataType::U8 => vec![val as u8],
            DataType::U16 => (val as u16).to_le_bytes().to_vec(),
            DataType::U32 => (val as u32).to_le_bytes().to_vec(),
            DataType::U64 => (val as u64).to_le_bytes().to_vec(),
            DataType::I8 => vec![val as i8 as u8],
            DataType::I16 => (val as i16).to_le_bytes().to_vec(),
            DataType::I32 => (val as i32).to_le_bytes().to_vec(),
            DataType::I64 => val.to_le_bytes().to_vec(),
            DataType::F32 => (val as f32).to_le_bytes().to_vec(),
            DataType::F64 => (val as f64).to_le_bytes().to_vec(),
            other => return Err(Error::msg(format!("{} cannot hold an integer", other))),
        };
        Ok(Self { ty, data })
    }

    pub fn from_float(ty: DataType, val: f64) -> Result<Self> {
        let data = match ty {
            DataType::F32 => (val as f32).to_le_bytes().to_vec(),
            DataType::F64 => val.to_le_bytes().to_vec(),
            other => return Err(Error::msg(format!("{} cannot hold a float", other))),
        };
        Ok(Self { ty, data })
    }

    /// Builds a fixed-width char value, zero-padded. Fails if the text does
    /// not fit the column width.
    pub fn from_str(ty: DataType, text: &str) -> Result<Self> {
        if !ty.is_char() {
            return Err(Error::msg(format!("{} cannot hold text", ty)));
        }
        let width = ty.size();
        if text.len() >= width {
            return Err(Error::msg(format!(
                "text of {} bytes does not fit {}",
                text.len(),
                ty
            )));
        }
        let mut data = vec![0u8; width];
        data[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Self { ty, data })
    }

    pub fn zero(ty: DataType) -> Self {
        Self {
            ty,
            data: vec![0u8; ty.size()],
        }
    }

    pub fn data_type(&self) -> DataType {
        self.ty
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_u32(&self) -> u32 {
        match self.ty {
            DataType::U8 => self.data[0] as u32,
            DataType::U16 => read_u16(&self.data) as u32,
            DataType::U32 => read_u32(&self.data),
            DataType::U64 => read_u64(&self.data) as u32,
            _ => unreachable!("as_u32 on {}", self.ty),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self.ty {
            DataType::U8 => self.data[0] as i64,
            DataType::U16 => read_u16(&self.data) as i64,
            DataType::U32 => read_u32(&self.data) as i64,
            DataType::U64 => read_u64(&self.data) as i64,
            DataType::I8 => self.data[0] as i8 as i64,
            DataType::I16 => read_i16(&self.data) as i64,
            DataType::I32 => read_i32(&self.data) as i64,
            DataType::I64 => read_i64(&self.data),
            _ => unreachable!("as_i64 on {}", self.ty),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self.ty {
            DataType::F32 => read_f32(&self.data) as f64,
            DataType::F64 => read_f64(&self.data),
            _ => unreachable!("as_f64 on {}", self.ty),
        }
    }

    /// Text content of a char value, without the zero padding.
    pub fn as_str(&self) -> &str {
        debug_assert!(self.ty.is_char());
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end]).unwrap_or("")
    }

    pub fn is_truthy(&self) -> bool {
        self.data.iter().any(|&b| b != 0)
    }

    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        if self.ty != other.ty {
            return Err(Error::msg(format!(
                "cannot compare {} with {}",
                self.ty, other.ty
            )));
        }
        Ok(self.ty.compare(&self.data, &other.data))
    }

    pub fn arithmetic(&self, other: &Value, op: crate::common::ArithOp) -> Result<Value> {
        use crate::common::ArithOp;
        if self.ty != other.ty {
            return Err(Error::msg(format!(
                "arithmetic type mismatch: {} vs {}",
                self.ty, other.ty
            )));
        }
        if self.ty.is_float() {
            let (a, b) = (self.as_f64(), other.as_f64());
            let out = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => {
                    if b == 0.0 {
                        return Err(Error::msg("division by zero"));
                    }
                    a / b
                }
            };
            return Value::from_float(self.ty, out);
        }
        if !self.ty.is_integer() {
            return Err(Error::msg(format!("arithmetic on {}", self.ty)));
        }
        let (a, b) = (self.as_i64(), other.as_i64());
        let out = match op {
            ArithOp::Add => a.wrapping_add(b),
            ArithOp::Sub => a.wrapping_sub(b),
            ArithOp::Mul => a.wrapping_mul(b),
            ArithOp::Div => {
                if b == 0 {
                    return Err(Error::msg("division by zero"));
                }
                a.wrapping_div(b)
            }
        };
        Value::from_int(self.ty, out)
    }
}

/// Computed layout of a relation's columns. The first column is the key
/// and lives in the B+Tree's key area; the remaining columns concatenate
/// into the fixed-width record, with offsets derived once from type sizes.
#[derive(Clone, Debug, PartialEq)]
pub struct TupleFormat {
    pub columns: Vec<DataType>,
    /// Record-area byte offset per column; slot 0 belongs to the key and
    /// is always zero.
    pub offsets: Vec<usize>,
    pub record_size: usize,
}

impl TupleFormat {
    pub fn from_columns(columns: &[DataType]) -> Self {
        let mut offsets = vec![0usize; columns.len()];
        let mut offset = 0usize;
        for (i, ty) in columns.iter().enumerate().skip(1) {
            offsets[i] = offset;
            offset += ty.size();
        }
        Self {
            columns: columns.to_vec(),
            offsets,
            record_size: offset,
        }
    }

    pub fn key_type(&self) -> DataType {
        self.columns[0]
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Byte span of column `i` (i >= 1) within the record area.
    pub fn record_range(&self, i: usize) -> (usize, usize) {
        (self.offsets[i], self.columns[i].size())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ty {
            DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64 => {
                write!(f, "{}", self.as_i64())
            }
            DataType::I8 | DataType::I16 | DataType::I32 | DataType::I64 => {
                write!(f, "{}", self.as_i64())
            }
            DataType::F32 | DataType::F64 => write!(f, "{}", self.as_f64()),
            DataType::Null => write!(f, "NULL"),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, Value};
    use crate::common::ArithOp;
    use std::cmp::Ordering;

    #[test]
    fn char_values_are_fixed_width_and_padded() {
        let val = Value::from_str(DataType::Char32, "hello").unwrap();
        assert_eq!(val.bytes().len(), 32);
        assert_eq!(val.as_str(), "hello");
        assert!(Value::from_str(DataType::Char8, "eight bytes or more").is_err());
    }

    #[test]
    fn numeric_comparison_is_by_value_not_bytes() {
        let small = Value::from_int(DataType::I32, -5).unwrap();
        let big = Value::from_int(DataType::I32, 3).unwrap();
        assert_eq!(small.compare(&big).unwrap(), Ordering::Less);

        let a = Value::from_u32(300);
        let b = Value::from_u32(2);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Greater);
    }

    #[test]
    fn char_comparison_is_lexicographic_over_full_width() {
        let a = Value::from_str(DataType::Char32, "abc").unwrap();
        let b = Value::from_str(DataType::Char32, "abd").unwrap();
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        let prefix = Value::from_str(DataType::Char32, "ab").unwrap();
        assert_eq!(prefix.compare(&a).unwrap(), Ordering::Less);
    }

    #[test]
    fn mismatched_types_do_not_compare() {
        let a = Value::from_u32(1);
        let b = Value::from_str(DataType::Char32, "1").unwrap();
        assert!(a.compare(&b).is_err());
    }

    #[test]
    fn increment_wraps_through_the_type() {
        let mut bytes = 41u32.to_le_bytes().to_vec();
        DataType::U32.increment(&mut bytes);
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), 42);
    }

    #[test]
    fn arithmetic_matches_type() {
        let a = Value::from_u32(10);
        let b = Value::from_u32(4);
        assert_eq!(a.arithmetic(&b, ArithOp::Sub).unwrap().as_u32(), 6);
        assert!(a
            .arithmetic(&Value::zero(DataType::U32), ArithOp::Div)
            .is_err());

        let x = Value::from_float(DataType::F64, 1.5).unwrap();
        let y = Value::from_float(DataType::F64, 2.0).unwrap();
        assert_eq!(x.arithmetic(&y, ArithOp::Mul).unwrap().as_f64(), 3.0);
    }
}
