//! Typed kernel arguments.
//!
//! A kernel signature lists one type string per parameter (`i32`, `fp32`,
//! `*fp16`, ...). Host values are checked against the declared type and
//! packed into a [`Scalar`], which always widens losslessly to a 64-bit word.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, Result};

/// Declared type of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgType {
    I1,
    I8,
    I16,
    I32,
    I64,
    U32,
    U64,
    /// Half-precision floats are passed as 32-bit floats.
    Fp16,
    Bf16,
    Fp32,
    Fp64,
    /// Device pointer (`*<elem>` in signatures).
    Ptr,
}

impl FromStr for ArgType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.starts_with('*') {
            return Ok(ArgType::Ptr);
        }
        Ok(match s {
            "i1" => ArgType::I1,
            "i8" => ArgType::I8,
            "i16" => ArgType::I16,
            "i32" => ArgType::I32,
            "i64" => ArgType::I64,
            "u32" => ArgType::U32,
            "u64" => ArgType::U64,
            "fp16" => ArgType::Fp16,
            "bf16" => ArgType::Bf16,
            "fp32" | "f32" => ArgType::Fp32,
            "fp64" => ArgType::Fp64,
            other => return Err(format!("unknown argument type '{}'", other)),
        })
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgType::I1 => "i1",
            ArgType::I8 => "i8",
            ArgType::I16 => "i16",
            ArgType::I32 => "i32",
            ArgType::I64 => "i64",
            ArgType::U32 => "u32",
            ArgType::U64 => "u64",
            ArgType::Fp16 => "fp16",
            ArgType::Bf16 => "bf16",
            ArgType::Fp32 => "fp32",
            ArgType::Fp64 => "fp64",
            ArgType::Ptr => "ptr",
        };
        f.write_str(s)
    }
}

/// A host value before it is checked against a parameter type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostValue {
    Int(i128),
    Float(f64),
    /// Address of a device buffer.
    Ptr(u64),
    /// Absent value; only valid for pointers (null).
    None,
}

/// A kernel argument with a fixed machine width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(u64),
}

impl Scalar {
    /// Widen to a 64-bit word. Signed values are sign-extended, floats keep
    /// their bit pattern in the low bits; a kernel reading the parameter at
    /// its declared width sees the original value.
    pub fn to_word(self) -> u64 {
        match self {
            Scalar::Bool(b) => b as u64,
            Scalar::I8(v) => v as i64 as u64,
            Scalar::I16(v) => v as i64 as u64,
            Scalar::I32(v) => v as i64 as u64,
            Scalar::I64(v) => v as u64,
            Scalar::U32(v) => v as u64,
            Scalar::U64(v) | Scalar::Ptr(v) => v,
            Scalar::F32(v) => v.to_bits() as u64,
            Scalar::F64(v) => v.to_bits(),
        }
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::U64(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::U32(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::I32(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::I64(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::F32(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

fn int_in<T: TryFrom<i128>>(ty: ArgType, v: i128) -> std::result::Result<T, String> {
    T::try_from(v).map_err(|_| format!("{} is out of range for {}", v, ty))
}

impl ArgType {
    /// Check `value` against this type and pack it.
    pub fn encode(self, value: HostValue) -> std::result::Result<Scalar, String> {
        match (self, value) {
            (ArgType::Ptr, HostValue::Ptr(p)) => Ok(Scalar::Ptr(p)),
            (ArgType::Ptr, HostValue::None) => Ok(Scalar::Ptr(0)),
            (ArgType::Ptr, HostValue::Int(v)) => int_in(self, v).map(Scalar::Ptr),
            (ArgType::I1, HostValue::Int(v)) => match v {
                0 | 1 => Ok(Scalar::I32(v as i32)),
                _ => Err(format!("{} is out of range for i1", v)),
            },
            (ArgType::I8, HostValue::Int(v)) => int_in(self, v).map(Scalar::I8),
            (ArgType::I16, HostValue::Int(v)) => int_in(self, v).map(Scalar::I16),
            (ArgType::I32, HostValue::Int(v)) => int_in(self, v).map(Scalar::I32),
            (ArgType::I64, HostValue::Int(v)) => int_in(self, v).map(Scalar::I64),
            (ArgType::U32, HostValue::Int(v)) => int_in(self, v).map(Scalar::U32),
            (ArgType::U64, HostValue::Int(v)) => int_in(self, v).map(Scalar::U64),
            (ArgType::Fp16 | ArgType::Bf16 | ArgType::Fp32, HostValue::Float(v)) => Ok(Scalar::F32(v as f32)),
            (ArgType::Fp16 | ArgType::Bf16 | ArgType::Fp32, HostValue::Int(v)) => Ok(Scalar::F32(v as f32)),
            (ArgType::Fp64, HostValue::Float(v)) => Ok(Scalar::F64(v)),
            (ArgType::Fp64, HostValue::Int(v)) => Ok(Scalar::F64(v as f64)),
            (ty, other) => Err(format!("cannot pass {:?} as {}", other, ty)),
        }
    }
}

/// Ordered parameter types of one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
    types: Vec<ArgType>,
}

impl Signature {
    pub fn new(types: Vec<ArgType>) -> Self {
        Self { types }
    }

    pub fn parse<S: AsRef<str>>(types: &[S]) -> std::result::Result<Self, String> {
        types
            .iter()
            .map(|t| t.as_ref().parse())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn types(&self) -> &[ArgType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check and pack one value per parameter, in order.
    pub fn encode(&self, values: &[HostValue]) -> Result<Vec<Scalar>> {
        if values.len() != self.types.len() {
            return Err(LaunchError::ArgumentConversion {
                index: values.len().min(self.types.len()),
                reason: format!("expected {} arguments, got {}", self.types.len(), values.len()),
            });
        }
        self.types
            .iter()
            .zip(values)
            .enumerate()
            .map(|(index, (ty, value))| {
                ty.encode(*value)
                    .map_err(|reason| LaunchError::ArgumentConversion { index, reason })
            })
            .collect()
    }
}
