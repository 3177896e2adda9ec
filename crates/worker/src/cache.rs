//! Paged KV cache store
//!
//! One key and one value block array per local layer, each shaped
//! `[num_blocks, num_kv_heads, block_size, head_dim]`. The store is allocated
//! once at full capacity and never resized. Which block belongs to which
//! sequence is decided by the caller and arrives as a block table with every
//! forward call; the store only reads and writes the blocks it is pointed at.

use crate::model::tensor_bytes;
use candle_core::{DType, Device, Tensor};
use shardline_common::{Result, ShardlineError};
use std::fmt;
use tracing::info;

/// Shape of one layer's key (or value) block array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheShape {
    pub num_blocks: usize,
    pub num_kv_heads: usize,
    pub block_size: usize,
    pub head_dim: usize,
}

impl CacheShape {
    /// Parse a 4-element allocation shape
    pub fn from_alloc(alloc_shape: &[usize]) -> Result<Self> {
        let [num_blocks, num_kv_heads, block_size, head_dim] = alloc_shape else {
            return Err(ShardlineError::invalid_input(format!(
                "cache allocation shape must have 4 dimensions, got {:?}",
                alloc_shape
            )));
        };
        if alloc_shape.contains(&0) {
            return Err(ShardlineError::invalid_input(format!(
                "cache allocation shape {:?} has an empty dimension",
                alloc_shape
            )));
        }

        Ok(Self {
            num_blocks: *num_blocks,
            num_kv_heads: *num_kv_heads,
            block_size: *block_size,
            head_dim: *head_dim,
        })
    }

    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.num_blocks, self.num_kv_heads, self.block_size, self.head_dim)
    }

    /// Elements in one block array, `None` on overflow
    pub fn elem_count(&self) -> Option<usize> {
        self.num_blocks
            .checked_mul(self.num_kv_heads)?
            .checked_mul(self.block_size)?
            .checked_mul(self.head_dim)
    }

    /// Bytes for keys and values of `num_layers` layers, `None` on overflow
    pub fn total_bytes(&self, num_layers: usize, dtype: DType) -> Option<u64> {
        let per_array = self.elem_count()?.checked_mul(dtype.size_in_bytes())?;
        (per_array as u64).checked_mul(2)?.checked_mul(num_layers as u64)
    }

    /// Check the shape against the local model slice
    pub fn check_model(&self, num_kv_heads_local: usize, block_size: usize, head_dim: usize) -> Result<()> {
        let expected = [
            ("num_kv_heads", self.num_kv_heads, num_kv_heads_local),
            ("block_size", self.block_size, block_size),
            ("head_dim", self.head_dim, head_dim),
        ];
        for (name, got, want) in expected {
            if got != want {
                return Err(ShardlineError::invalid_input(format!(
                    "cache {} is {}, model shard needs {}",
                    name, got, want
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CacheShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.num_blocks, self.num_kv_heads, self.block_size, self.head_dim
        )
    }
}

/// Key and value block arrays of one layer
#[derive(Debug, Clone)]
pub struct LayerCache {
    pub key: Tensor,
    pub value: Tensor,
}

/// Device-resident paged KV cache
#[derive(Debug)]
pub struct KvCacheStore {
    shape: CacheShape,
    layers: Vec<LayerCache>,
}

impl KvCacheStore {
    /// Allocate zeroed block arrays for `num_layers` layers
    ///
    /// Fails with a resource error when the request overflows or exceeds
    /// `budget_bytes`.
    pub fn allocate(
        shape: CacheShape,
        num_layers: usize,
        dtype: DType,
        device: &Device,
        budget_bytes: Option<u64>,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(ShardlineError::invalid_input("cache needs at least one layer"));
        }

        let total = shape.total_bytes(num_layers, dtype).ok_or_else(|| {
            ShardlineError::resource(format!("cache of {} x {} layers overflows", shape, num_layers))
        })?;
        if let Some(budget) = budget_bytes {
            if total > budget {
                return Err(ShardlineError::resource(format!(
                    "cache needs {} bytes, {} available",
                    total, budget
                )));
            }
        }

        let layers = (0..num_layers)
            .map(|_| -> Result<LayerCache> {
                Ok(LayerCache {
                    key: Tensor::zeros(shape.dims(), dtype, device)?,
                    value: Tensor::zeros(shape.dims(), dtype, device)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "physical cache init over: {} layers of {} ({:.3} GB)",
            num_layers,
            shape,
            total as f64 / (1024.0 * 1024.0 * 1024.0)
        );

        Ok(Self { shape, layers })
    }

    pub fn shape(&self) -> CacheShape {
        self.shape
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerCache> {
        self.layers.get(layer).ok_or_else(|| {
            ShardlineError::invalid_input(format!(
                "cache layer {} out of range ({} layers)",
                layer,
                self.layers.len()
            ))
        })
    }

    fn check_block(&self, block: usize) -> Result<()> {
        if block >= self.shape.num_blocks {
            return Err(ShardlineError::invalid_input(format!(
                "block {} out of range ({} blocks)",
                block, self.shape.num_blocks
            )));
        }
        Ok(())
    }

    /// Write `key`/`value` rows `[n, num_kv_heads, head_dim]` into one block,
    /// starting at `slot`. Nothing outside that block changes.
    pub fn write(
        &self,
        layer: usize,
        block: usize,
        slot: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<()> {
        let cache = self.layer(layer)?;
        self.check_block(block)?;

        let n = key.dim(0)?;
        if slot + n > self.shape.block_size {
            return Err(ShardlineError::invalid_input(format!(
                "{} tokens at slot {} overflow a block of {}",
                n, slot, self.shape.block_size
            )));
        }

        write_block(&cache.key, block, slot, key)?;
        write_block(&cache.value, block, slot, value)?;
        Ok(())
    }

    /// Views of one block, `[num_kv_heads, block_size, head_dim]` each
    pub fn read_block(&self, layer: usize, block: usize) -> Result<(Tensor, Tensor)> {
        let cache = self.layer(layer)?;
        self.check_block(block)?;
        Ok((cache.key.get(block)?, cache.value.get(block)?))
    }

    /// Blocks of `layer` holding any non-zero key or value
    pub fn nonzero_blocks(&self, layer: usize) -> Result<Vec<usize>> {
        let cache = self.layer(layer)?;
        let mut blocks = Vec::new();
        for block in 0..self.shape.num_blocks {
            let key = cache.key.get(block)?.abs()?.to_dtype(DType::F32)?.sum_all()?;
            let value = cache.value.get(block)?.abs()?.to_dtype(DType::F32)?.sum_all()?;
            if key.to_scalar::<f32>()? + value.to_scalar::<f32>()? > 0.0 {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Bytes held by all block arrays
    pub fn bytes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| tensor_bytes(&l.key) + tensor_bytes(&l.value))
            .sum()
    }
}

/// Overwrite slots `slot..slot + n` of `block` in place
fn write_block(cache: &Tensor, block: usize, slot: usize, rows: &Tensor) -> Result<()> {
    let block_size = cache.dim(2)?;
    let n = rows.dim(0)?;

    // [n, heads, dim] -> [heads, n, dim]
    let rows = rows.to_dtype(cache.dtype())?.transpose(0, 1)?.contiguous()?;
    let current = cache.get(block)?;

    let mut parts = Vec::with_capacity(3);
    if slot > 0 {
        parts.push(current.narrow(1, 0, slot)?);
    }
    parts.push(rows);
    if slot + n < block_size {
        parts.push(current.narrow(1, slot + n, block_size - slot - n)?);
    }

    // Assembled in fresh storage before the cache is touched
    let updated = Tensor::cat(&parts, 1)?.unsqueeze(0)?.contiguous()?;
    cache.slice_set(&updated, 0, block)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(num_blocks: usize) -> KvCacheStore {
        let shape = CacheShape::from_alloc(&[num_blocks, 2, 4, 3]).unwrap();
        KvCacheStore::allocate(shape, 2, DType::F32, &Device::Cpu, None).unwrap()
    }

    fn block_values(store: &KvCacheStore, layer: usize, block: usize) -> Vec<f32> {
        let (key, _) = store.read_block(layer, block).unwrap();
        key.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_alloc_shape_validation() {
        assert!(CacheShape::from_alloc(&[4, 8, 16]).is_err());
        assert!(CacheShape::from_alloc(&[4, 0, 16, 64]).is_err());

        let shape = CacheShape::from_alloc(&[4, 8, 16, 64]).unwrap();
        assert!(shape.check_model(8, 16, 64).is_ok());
        assert!(shape.check_model(4, 16, 64).is_err());
        assert_eq!(shape.total_bytes(2, DType::F16), Some(4 * 8 * 16 * 64 * 2 * 2 * 2));
    }

    #[test]
    fn test_allocation_is_zeroed() {
        let store = store(3);
        assert_eq!(store.num_layers(), 2);
        assert_eq!(store.layer(1).unwrap().key.dims(), &[3, 2, 4, 3]);
        assert!(store.nonzero_blocks(0).unwrap().is_empty());
        assert_eq!(store.bytes(), 2 * 2 * 3 * 2 * 4 * 3 * 4);
    }

    #[test]
    fn test_budget_and_overflow() {
        let shape = CacheShape::from_alloc(&[4, 8, 16, 64]).unwrap();
        let err = KvCacheStore::allocate(shape, 2, DType::F32, &Device::Cpu, Some(1024)).unwrap_err();
        assert!(matches!(err, ShardlineError::Resource(_)));

        let huge = CacheShape::from_alloc(&[usize::MAX, 2, 2, 2]).unwrap();
        let err = KvCacheStore::allocate(huge, 1, DType::F32, &Device::Cpu, None).unwrap_err();
        assert!(matches!(err, ShardlineError::Resource(_)));
    }

    #[test]
    fn test_write_touches_only_addressed_slots() {
        let store = store(3);
        let key = Tensor::ones((2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let value = (key.clone() * 2.0).unwrap();

        store.write(1, 2, 1, &key, &value).unwrap();

        assert_eq!(store.nonzero_blocks(1).unwrap(), vec![2]);
        assert!(store.nonzero_blocks(0).unwrap().is_empty());

        // block layout is [heads, slots, dim]; slots 1 and 2 of each head are set
        let values = block_values(&store, 1, 2);
        for head in 0..2 {
            for slot in 0..4 {
                let row = &values[(head * 4 + slot) * 3..(head * 4 + slot + 1) * 3];
                let expected = if slot == 1 || slot == 2 { 1.0 } else { 0.0 };
                assert!(row.iter().all(|&v| v == expected));
            }
        }

        let (_, stored_value) = store.read_block(1, 2).unwrap();
        let total = stored_value.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 2.0 * 2.0 * 2.0 * 3.0);
    }

    #[test]
    fn test_write_bounds() {
        let store = store(2);
        let rows = Tensor::ones((3, 2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(store.write(0, 0, 2, &rows, &rows).is_err());
        assert!(store.write(0, 2, 0, &rows, &rows).is_err());
        assert!(store.write(2, 0, 0, &rows, &rows).is_err());
    }
}
