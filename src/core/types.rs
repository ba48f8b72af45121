use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    Float32,
}

impl DType {
    pub fn bits(&self) -> u32 {
        match self {
            DType::Int8 | DType::UInt8 => 8,
            DType::Int16 | DType::UInt16 => 16,
            DType::Int32 | DType::Float32 => 32,
        }
    }

    pub fn is_signed(&self) -> bool {
        !matches!(self, DType::UInt8 | DType::UInt16)
    }

    /// Representable integer range as (min, max).
    pub fn int_range(&self) -> (i64, i64) {
        match self {
            DType::Int8 => (i8::MIN as i64, i8::MAX as i64),
            DType::UInt8 => (0, u8::MAX as i64),
            DType::Int16 => (i16::MIN as i64, i16::MAX as i64),
            DType::UInt16 => (0, u16::MAX as i64),
            DType::Int32 | DType::Float32 => (i32::MIN as i64, i32::MAX as i64),
        }
    }

    /// The wider of two integer types; signedness wins over width ties.
    pub fn widest(a: DType, b: DType) -> DType {
        match a.bits().cmp(&b.bits()) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal => {
                if a.is_signed() { a } else { b }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: vec![1] }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Dense row-major tensor backing constant nodes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.size(), data.len());
        Self { shape, data }
    }

    pub fn scalar(value: f32) -> Self {
        Self { shape: Shape::scalar(), data: vec![value] }
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn abs_max(&self) -> f32 {
        self.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
    }

    /// Number of elements per slice along axis 0.
    fn outer_stride(&self) -> usize {
        self.shape.dims.iter().skip(1).product()
    }

    /// Number of elements per slice along axis 1.
    fn inner_stride(&self) -> usize {
        self.shape.dims.iter().skip(2).product()
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape.dims.get(axis).copied().unwrap_or(1)
    }

    /// Max absolute value of every slice along axis 0.
    pub fn abs_max_axis0(&self) -> Vec<f32> {
        let stride = self.outer_stride();
        (0..self.dim(0))
            .map(|o| self.data[o * stride..(o + 1) * stride].iter().fold(0.0f32, |acc, v| acc.max(v.abs())))
            .collect()
    }

    /// Max absolute value of every slice along axis 1.
    pub fn abs_max_axis1(&self) -> Vec<f32> {
        let outer = self.outer_stride();
        let inner = self.inner_stride();
        let mut res = vec![0.0f32; self.dim(1)];
        for o in 0..self.dim(0) {
            for (i, slot) in res.iter_mut().enumerate() {
                let start = o * outer + i * inner;
                for v in &self.data[start..start + inner] {
                    *slot = slot.max(v.abs());
                }
            }
        }
        res
    }

    /// Divides every slice along axis 0 by the matching scale.
    pub fn div_axis0(&mut self, scale: &[f32]) {
        let stride = self.outer_stride();
        for (o, s) in scale.iter().enumerate() {
            for v in &mut self.data[o * stride..(o + 1) * stride] {
                *v /= s;
            }
        }
    }

    /// Multiplies every slice along axis 1 by the matching scale.
    pub fn mul_axis1(&mut self, scale: &[f32]) {
        let outer = self.outer_stride();
        let inner = self.inner_stride();
        for o in 0..self.dim(0) {
            for (i, s) in scale.iter().enumerate() {
                let start = o * outer + i * inner;
                for v in &mut self.data[start..start + inner] {
                    *v *= s;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ranges_follow_axes() {
        let t = Tensor::new(Shape::new([2, 3]), vec![1.0, -4.0, 2.0, 0.5, 3.0, -6.0]);
        assert_eq!(t.abs_max_axis0(), vec![4.0, 6.0]);
        assert_eq!(t.abs_max_axis1(), vec![1.0, 4.0, 6.0]);
    }

    #[test]
    fn channel_scaling_touches_only_its_slice() {
        let mut t = Tensor::new(Shape::new([2, 2, 1, 1]), vec![2.0, 2.0, 4.0, 4.0]);
        t.div_axis0(&[2.0, 1.0]);
        assert_eq!(t.data, vec![1.0, 1.0, 4.0, 4.0]);
        t.mul_axis1(&[1.0, 3.0]);
        assert_eq!(t.data, vec![1.0, 3.0, 4.0, 12.0]);
    }

    #[test]
    fn widest_prefers_bits_then_sign() {
        assert_eq!(DType::widest(DType::Int8, DType::Int16), DType::Int16);
        assert_eq!(DType::widest(DType::UInt8, DType::Int8), DType::Int8);
    }
}
