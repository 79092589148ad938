//! Dense tensors and the examples that carry them

use std::collections::BTreeMap;
use std::ops::Index;

/// Name of the single feature an image reader emits.
pub const VALUE_FEATURE: &str = "value";

/// Dense, row-major `u8` tensor laid out as (batch, height, width, channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Tensor {
    /// Size in bytes of one element. Pixels are stored as `u8`.
    pub const ELEMENT_SIZE: usize = std::mem::size_of::<u8>();

    /// Wrap a buffer whose length must match the product of `shape`.
    pub fn from_vec(data: Vec<u8>, shape: Vec<usize>) -> Option<Self> {
        let expected = shape.iter().product::<usize>() * Self::ELEMENT_SIZE;
        if data.len() != expected {
            return None;
        }
        let strides = contiguous_strides(&shape, Self::ELEMENT_SIZE);
        Some(Self {
            data,
            shape,
            strides,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Byte offsets to advance one step along each dimension.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Size of the leading (batch) dimension.
    pub fn batch_size(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// The bytes of image `i` along the batch dimension.
    pub fn image(&self, i: usize) -> Option<&[u8]> {
        let stride = *self.strides.first()?;
        if i >= self.batch_size() {
            return None;
        }
        Some(&self.data[i * stride..(i + 1) * stride])
    }
}

/// Row-major strides in bytes for `shape`.
pub fn contiguous_strides(shape: &[usize], element_size: usize) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = element_size;
    for (stride, dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc *= dim;
    }
    strides
}

/// One unit of reader output: named tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    features: BTreeMap<String, Tensor>,
    /// Trailing zero-filled images added to complete the last batch.
    pub padding: usize,
}

impl Example {
    pub fn new(value: Tensor) -> Self {
        let mut features = BTreeMap::new();
        features.insert(VALUE_FEATURE.to_string(), value);
        Self {
            features,
            padding: 0,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.features.get(name)
    }

    /// The image tensor.
    pub fn value(&self) -> &Tensor {
        &self[VALUE_FEATURE]
    }

    pub fn into_value(mut self) -> Option<Tensor> {
        self.features.remove(VALUE_FEATURE)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}

impl Index<&str> for Example {
    type Output = Tensor;

    fn index(&self, name: &str) -> &Tensor {
        self.features
            .get(name)
            .unwrap_or_else(|| panic!("example has no feature named `{name}`"))
    }
}
