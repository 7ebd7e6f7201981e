//! Image payloads: a flattened pixel buffer plus shape and element type.

use std::fmt;
use std::str::FromStr;

use tokio_util::bytes::Bytes;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("unknown element type: {0}")]
    UnknownDtype(String),

    #[error("shape {shape:?} overflows element count")]
    ShapeOverflow { shape: Vec<usize> },

    #[error("buffer of {actual} bytes does not match shape {shape:?} of {dtype} ({expected} bytes)")]
    LengthMismatch {
        shape: Vec<usize>,
        dtype: Dtype,
        expected: usize,
        actual: usize,
    },
}

/// Element type of an image buffer, named the way array libraries name them
/// on the wire (`uint8`, `float32`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Dtype::Uint8 | Dtype::Int8 => 1,
            Dtype::Uint16 | Dtype::Int16 => 2,
            Dtype::Uint32 | Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Uint64 | Dtype::Int64 | Dtype::Float64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Uint8 => "uint8",
            Dtype::Int8 => "int8",
            Dtype::Uint16 => "uint16",
            Dtype::Int16 => "int16",
            Dtype::Uint32 => "uint32",
            Dtype::Int32 => "int32",
            Dtype::Uint64 => "uint64",
            Dtype::Int64 => "int64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(Dtype::Uint8),
            "int8" => Ok(Dtype::Int8),
            "uint16" => Ok(Dtype::Uint16),
            "int16" => Ok(Dtype::Int16),
            "uint32" => Ok(Dtype::Uint32),
            "int32" => Ok(Dtype::Int32),
            "uint64" => Ok(Dtype::Uint64),
            "int64" => Ok(Dtype::Int64),
            "float32" => Ok(Dtype::Float32),
            "float64" => Ok(Dtype::Float64),
            other => Err(ImageError::UnknownDtype(other.to_string())),
        }
    }
}

/// An n-dimensional image buffer in row-major order.
///
/// Construction validates that the buffer length matches the shape and
/// element type, so a decoded frame can always be reshaped on the far side.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    shape: Vec<usize>,
    dtype: Dtype,
    data: Bytes,
}

impl ImageFrame {
    pub fn new(shape: Vec<usize>, dtype: Dtype, data: Bytes) -> Result<Self, ImageError> {
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| ImageError::ShapeOverflow {
                shape: shape.clone(),
            })?;
        let expected = elements
            .checked_mul(dtype.size())
            .ok_or_else(|| ImageError::ShapeOverflow {
                shape: shape.clone(),
            })?;

        if expected != data.len() {
            return Err(ImageError::LengthMismatch {
                shape,
                dtype,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self { shape, dtype, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Number of elements (not bytes).
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [
            Dtype::Uint8,
            Dtype::Int8,
            Dtype::Uint16,
            Dtype::Int16,
            Dtype::Uint32,
            Dtype::Int32,
            Dtype::Uint64,
            Dtype::Int64,
            Dtype::Float32,
            Dtype::Float64,
        ] {
            assert_eq!(dtype.as_str().parse::<Dtype>().unwrap(), dtype);
        }
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let err = "complex128".parse::<Dtype>().unwrap_err();
        assert_eq!(err, ImageError::UnknownDtype("complex128".to_string()));
    }

    #[test]
    fn frame_accepts_matching_buffer() {
        let frame = ImageFrame::new(
            vec![2, 3, 2],
            Dtype::Uint16,
            Bytes::from(vec![0u8; 2 * 3 * 2 * 2]),
        )
        .unwrap();
        assert_eq!(frame.element_count(), 12);
        assert_eq!(frame.shape(), &[2, 3, 2]);
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        let err = ImageFrame::new(vec![4, 4], Dtype::Float32, Bytes::from(vec![0u8; 63]))
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::LengthMismatch {
                expected: 64,
                actual: 63,
                ..
            }
        ));
    }

    #[test]
    fn frame_rejects_shape_overflow() {
        let err = ImageFrame::new(
            vec![usize::MAX, 2],
            Dtype::Uint8,
            Bytes::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ImageError::ShapeOverflow { .. }));
    }

    #[test]
    fn zero_dim_shape_wants_empty_buffer() {
        let frame = ImageFrame::new(vec![0, 3], Dtype::Uint8, Bytes::new()).unwrap();
        assert_eq!(frame.element_count(), 0);
    }
}
