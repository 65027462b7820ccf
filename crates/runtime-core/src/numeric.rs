//! Numeric values exchanged between ranks and accumulated by metrics
//!
//! A [`Numeric`] is either an integer scalar, a floating point scalar or a
//! dense row-major array. Arithmetic follows a small set of promotion rules:
//!
//! - integer with integer stays integer (wrapping on overflow)
//! - anything involving a float becomes float
//! - division always produces floats
//! - a scalar broadcasts against an array; two arrays must share a shape
//!
//! Byte arrays only exist to carry serialized payloads through a broadcast and
//! are rejected by every arithmetic operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{Error, Result};

/// Element type of an [`NdArray`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    U8,
    I64,
    F64,
}

/// Flat element storage of an [`NdArray`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    U8(Vec<u8>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::U8(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::U8(_) => DType::U8,
            ArrayData::I64(_) => DType::I64,
            ArrayData::F64(_) => DType::F64,
        }
    }
}

/// Dense row-major array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Create an array, checking that `data` fills `shape` exactly
    pub fn new(shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional float array
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::F64(values),
        }
    }

    /// One-dimensional integer array
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::I64(values),
        }
    }

    /// One-dimensional byte buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            shape: vec![bytes.len()],
            data: ArrayData::U8(bytes),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }
}

/// A value accepted by reductions and metric accumulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Array(NdArray),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Mul,
    Div,
}

impl BinOp {
    fn int(self, a: i64, b: i64) -> Result<i64> {
        let result = match self {
            BinOp::Add => a.checked_add(b),
            BinOp::Mul => a.checked_mul(b),
            // Division is always evaluated in floating point
            BinOp::Div => Some((a as f64 / b as f64) as i64),
        };
        result.ok_or_else(|| Error::NumericOverflow {
            context: format!("{} {} {}", a, self.symbol(), b),
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }

    fn float(self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
        }
    }
}

impl Numeric {
    /// Short human-readable description of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Numeric::Int(_) => "int",
            Numeric::Float(_) => "float",
            Numeric::Array(a) => match a.dtype() {
                DType::U8 => "byte array",
                DType::I64 => "int array",
                DType::F64 => "float array",
            },
        }
    }

    /// Shape of an array value, `None` for scalars
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Numeric::Array(a) => Some(a.shape()),
            _ => None,
        }
    }

    /// Scalar value as `f64`, `None` for arrays
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Numeric::Int(v) => Some(*v as f64),
            Numeric::Float(v) => Some(*v),
            Numeric::Array(_) => None,
        }
    }

    /// Scalar integer value, `None` for floats and arrays
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Numeric::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Unwrap a byte buffer produced by [`NdArray::from_bytes`]
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Numeric::Array(array) => match array.into_data() {
                ArrayData::U8(bytes) => Ok(bytes),
                other => Err(Error::UnsupportedType {
                    kind: format!("{:?} array where bytes were expected", other.dtype()),
                }),
            },
            other => Err(Error::UnsupportedType {
                kind: format!("{} where bytes were expected", other.kind()),
            }),
        }
    }

    /// A value of the same variant and shape with every element zeroed
    pub fn zeros_like(&self) -> Numeric {
        match self {
            Numeric::Int(_) => Numeric::Int(0),
            Numeric::Float(_) => Numeric::Float(0.0),
            Numeric::Array(a) => {
                let data = match a.dtype() {
                    DType::U8 => ArrayData::U8(vec![0; a.len()]),
                    DType::I64 => ArrayData::I64(vec![0; a.len()]),
                    DType::F64 => ArrayData::F64(vec![0.0; a.len()]),
                };
                Numeric::Array(NdArray {
                    shape: a.shape.clone(),
                    data,
                })
            }
        }
    }

    /// Fail unless the value can take part in arithmetic
    pub fn ensure_reducible(&self) -> Result<()> {
        match self {
            Numeric::Array(a) if a.dtype() == DType::U8 => Err(Error::UnsupportedType {
                kind: "byte array".to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn checked_add(&self, rhs: &Numeric) -> Result<Numeric> {
        self.apply(rhs, BinOp::Add)
    }

    pub fn checked_mul(&self, rhs: &Numeric) -> Result<Numeric> {
        self.apply(rhs, BinOp::Mul)
    }

    /// Elementwise division, always producing floating point values
    pub fn checked_div(&self, rhs: &Numeric) -> Result<Numeric> {
        self.apply(rhs, BinOp::Div)
    }

    fn is_integral(&self) -> bool {
        match self {
            Numeric::Int(_) => true,
            Numeric::Float(_) => false,
            Numeric::Array(a) => a.dtype() != DType::F64,
        }
    }

    fn apply(&self, rhs: &Numeric, op: BinOp) -> Result<Numeric> {
        self.ensure_reducible()?;
        rhs.ensure_reducible()?;

        let integral = op != BinOp::Div && self.is_integral() && rhs.is_integral();
        let shape = match (self.shape(), rhs.shape()) {
            (None, None) => None,
            (Some(s), None) | (None, Some(s)) => Some(s.to_vec()),
            (Some(a), Some(b)) => {
                if a != b {
                    return Err(Error::ShapeMismatch {
                        expected: a.to_vec(),
                        actual: b.to_vec(),
                    });
                }
                Some(a.to_vec())
            }
        };

        let Some(shape) = shape else {
            return Ok(if integral {
                Numeric::Int(op.int(self.lanes_i64(1)[0], rhs.lanes_i64(1)[0])?)
            } else {
                Numeric::Float(op.float(self.lanes_f64(1)[0], rhs.lanes_f64(1)[0]))
            });
        };

        let len = shape.iter().product();
        let data = if integral {
            let (a, b) = (self.lanes_i64(len), rhs.lanes_i64(len));
            let lanes = a.iter().zip(&b).map(|(x, y)| op.int(*x, *y));
            ArrayData::I64(lanes.collect::<Result<Vec<_>>>()?)
        } else {
            let (a, b) = (self.lanes_f64(len), rhs.lanes_f64(len));
            ArrayData::F64(a.iter().zip(&b).map(|(x, y)| op.float(*x, *y)).collect())
        };
        Ok(Numeric::Array(NdArray { shape, data }))
    }

    /// Elements as i64, broadcasting scalars to `len`
    fn lanes_i64(&self, len: usize) -> Vec<i64> {
        match self {
            Numeric::Int(v) => vec![*v; len],
            Numeric::Float(v) => vec![*v as i64; len],
            Numeric::Array(a) => match &a.data {
                ArrayData::U8(v) => v.iter().map(|x| *x as i64).collect(),
                ArrayData::I64(v) => v.clone(),
                ArrayData::F64(v) => v.iter().map(|x| *x as i64).collect(),
            },
        }
    }

    /// Elements as f64, broadcasting scalars to `len`
    fn lanes_f64(&self, len: usize) -> Vec<f64> {
        match self {
            Numeric::Int(v) => vec![*v as f64; len],
            Numeric::Float(v) => vec![*v; len],
            Numeric::Array(a) => match &a.data {
                ArrayData::U8(v) => v.iter().map(|x| *x as f64).collect(),
                ArrayData::I64(v) => v.iter().map(|x| *x as f64).collect(),
                ArrayData::F64(v) => v.clone(),
            },
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::Int(v) => write!(f, "{}", v),
            Numeric::Float(v) => write!(f, "{}", v),
            Numeric::Array(a) => write!(f, "{}{:?}", self.kind(), a.shape()),
        }
    }
}

impl From<i32> for Numeric {
    fn from(v: i32) -> Self {
        Numeric::Int(v as i64)
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric::Int(v)
    }
}

impl From<f32> for Numeric {
    fn from(v: f32) -> Self {
        Numeric::Float(v as f64)
    }
}

impl From<f64> for Numeric {
    fn from(v: f64) -> Self {
        Numeric::Float(v)
    }
}

impl From<NdArray> for Numeric {
    fn from(v: NdArray) -> Self {
        Numeric::Array(v)
    }
}

impl From<Vec<f64>> for Numeric {
    fn from(v: Vec<f64>) -> Self {
        Numeric::Array(NdArray::from_f64(v))
    }
}

impl From<&[f64]> for Numeric {
    fn from(v: &[f64]) -> Self {
        Numeric::Array(NdArray::from_f64(v.to_vec()))
    }
}

impl TryFrom<&Value> for Numeric {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => Ok(number_to_numeric(n)),
            Value::Array(_) => {
                let mut shape = Vec::new();
                let mut leaves = Vec::new();
                let mut leaf_depth = None;
                flatten_json(value, 0, &mut shape, &mut leaf_depth, &mut leaves)?;

                let data = if leaves.iter().all(|n| n.is_i64()) {
                    ArrayData::I64(leaves.iter().filter_map(|n| n.as_i64()).collect())
                } else {
                    ArrayData::F64(leaves.iter().filter_map(|n| n.as_f64()).collect())
                };
                Ok(Numeric::Array(NdArray::new(shape, data)?))
            }
            other => Err(Error::UnsupportedType {
                kind: json_kind(other).to_string(),
            }),
        }
    }
}

fn number_to_numeric(n: &serde_json::Number) -> Numeric {
    match n.as_i64() {
        Some(v) => Numeric::Int(v),
        None => Numeric::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn flatten_json<'a>(
    value: &'a Value,
    depth: usize,
    shape: &mut Vec<usize>,
    leaf_depth: &mut Option<usize>,
    leaves: &mut Vec<&'a serde_json::Number>,
) -> Result<()> {
    match value {
        Value::Array(items) => {
            if leaf_depth.is_some_and(|l| depth >= l) {
                return Err(Error::UnsupportedType {
                    kind: "ragged array".to_string(),
                });
            }
            if shape.len() == depth {
                shape.push(items.len());
            } else if shape[depth] != items.len() {
                return Err(Error::UnsupportedType {
                    kind: "ragged array".to_string(),
                });
            }
            for item in items {
                flatten_json(item, depth + 1, shape, leaf_depth, leaves)?;
            }
            Ok(())
        }
        Value::Number(n) => {
            match *leaf_depth {
                Some(l) if l != depth => {
                    return Err(Error::UnsupportedType {
                        kind: "ragged array".to_string(),
                    })
                }
                _ => *leaf_depth = Some(depth),
            }
            if shape.len() != depth {
                return Err(Error::UnsupportedType {
                    kind: "ragged array".to_string(),
                });
            }
            leaves.push(n);
            Ok(())
        }
        other => Err(Error::UnsupportedType {
            kind: json_kind(other).to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
