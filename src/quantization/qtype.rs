use crate::core::types::DType;
use crate::quantization::stats::Range;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum QScheme {
    /// Arbitrary scale factor with optional zero point (SQ8 kernels).
    #[default]
    Scaled,
    /// Power-of-two fixed point, scale is `2^-q`.
    Pow2,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    Factor(f64),
    Shift(i32),
}

/// Fixed-point representation of one tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QType {
    pub dtype: DType,
    pub scale: Scale,
    #[serde(default)]
    pub zero_point: i64,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub forced: bool,
}

/// Equality ignores `forced`: a forced format equals an unforced format with the same representation.
impl PartialEq for QType {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.scale == other.scale
            && self.zero_point == other.zero_point
            && self.min == other.min
            && self.max == other.max
    }
}

impl QType {
    pub fn from_range(scheme: QScheme, dtype: DType, range: Range, asymmetric: bool) -> QType {
        match scheme {
            QScheme::Scaled => Self::scaled(dtype, range.min, range.max, asymmetric),
            QScheme::Pow2 => Self::pow2(dtype, range.min, range.max),
        }
    }

    pub fn scaled(dtype: DType, min: f64, max: f64, asymmetric: bool) -> QType {
        let (qmin, qmax) = dtype.int_range();
        let (qmin, qmax) = (qmin as f64, qmax as f64);
        if asymmetric || !dtype.is_signed() {
            let lo = min.min(0.0);
            let hi = max.max(0.0);
            let scale = if hi > lo { (hi - lo) / (qmax - qmin) } else { 1.0 };
            let zero_point = (qmin - (lo / scale).round()).clamp(qmin, qmax) as i64;
            QType { dtype, scale: Scale::Factor(scale), zero_point, min, max, forced: false }
        } else {
            let abs_max = min.abs().max(max.abs());
            let scale = if abs_max > 0.0 { abs_max / qmax } else { 1.0 };
            QType { dtype, scale: Scale::Factor(scale), zero_point: 0, min, max, forced: false }
        }
    }

    pub fn pow2(dtype: DType, min: f64, max: f64) -> QType {
        let abs_max = min.abs().max(max.abs());
        let int_bits = if abs_max > 1.0 { abs_max.log2().ceil() as i32 } else { 0 };
        let sign_bit = if dtype.is_signed() { 1 } else { 0 };
        let q = dtype.bits() as i32 - sign_bit - int_bits;
        QType { dtype, scale: Scale::Shift(q), zero_point: 0, min, max, forced: false }
    }

    /// Power-of-two format with an explicit fractional bit count.
    pub fn pow2_q(dtype: DType, q: i32) -> QType {
        let sign_bit = if dtype.is_signed() { 1 } else { 0 };
        let int_bits = dtype.bits() as i32 - sign_bit - q;
        let max = 2f64.powi(int_bits);
        let min = if dtype.is_signed() { -max } else { 0.0 };
        QType { dtype, scale: Scale::Shift(q), zero_point: 0, min, max, forced: false }
    }

    pub fn scale_factor(&self) -> f64 {
        match self.scale {
            Scale::Factor(f) => f,
            Scale::Shift(q) => 2f64.powi(-q),
        }
    }

    pub fn q(&self) -> Option<i32> {
        match self.scale {
            Scale::Shift(q) => Some(q),
            Scale::Factor(_) => None,
        }
    }

    pub fn is_asymmetric(&self) -> bool {
        self.zero_point != 0
    }

    pub fn range(&self) -> Range {
        Range { min: self.min, max: self.max }
    }

    pub fn forced(mut self) -> QType {
        self.forced = true;
        self
    }

    pub fn unforced(mut self) -> QType {
        self.forced = false;
        self
    }

    /// Symmetric variant of the same range and dtype.
    pub fn symmetric(&self) -> QType {
        match self.scale {
            Scale::Factor(_) => QType { forced: self.forced, ..QType::scaled(self.dtype, self.min, self.max, false) },
            Scale::Shift(_) => self.clone(),
        }
    }

    /// A format wide enough to hold every input's full range.
    pub fn common(qtypes: &[QType]) -> Option<QType> {
        let first = qtypes.first()?;
        let dtype = qtypes.iter().fold(first.dtype, |acc, q| DType::widest(acc, q.dtype));
        let min = qtypes.iter().fold(f64::INFINITY, |acc, q| acc.min(q.min));
        let max = qtypes.iter().fold(f64::NEG_INFINITY, |acc, q| acc.max(q.max));
        Some(match first.scale {
            Scale::Shift(_) => QType::pow2(dtype, min, max),
            Scale::Factor(_) => QType::scaled(dtype, min, max, qtypes.iter().any(|q| q.is_asymmetric())),
        })
    }
}
