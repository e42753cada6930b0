//! Batched iteration over bitmaps using pooled buffers.

use roaring::bitmap::Iter;
use roaring::RoaringBitmap;

use crate::buffer::BufferLease;

/// Iterates a bitmap in ascending batches written into a leased buffer.
pub struct BitmapBatches<'a> {
    iter: Iter<'a>,
    buffer: BufferLease,
}

impl<'a> BitmapBatches<'a> {
    /// Iterate `bitmap` using `buffer` as the batch storage.
    pub fn new(bitmap: &'a RoaringBitmap, buffer: BufferLease) -> Self {
        Self {
            iter: bitmap.iter(),
            buffer,
        }
    }

    /// Next batch of ascending keys, `None` once the bitmap is exhausted.
    pub fn next_batch(&mut self) -> Option<&[u32]> {
        let mut filled = 0;
        for slot in self.buffer.iter_mut() {
            match self.iter.next() {
                Some(pk) => {
                    *slot = pk;
                    filled += 1;
                }
                None => break,
            }
        }
        if filled == 0 {
            return None;
        }
        Some(&self.buffer[..filled])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::SharedBufferPool;
    use crate::config::BufferPoolConfig;

    #[test]
    fn test_batches_cover_bitmap_in_order() {
        let pool = Arc::new(SharedBufferPool::new(&BufferPoolConfig {
            buffer_size: 4,
            max_retained: 2,
        }));
        let bitmap: RoaringBitmap = (1..=10).collect();
        let mut batches = BitmapBatches::new(&bitmap, pool.lease());

        let mut seen = vec![];
        let mut sizes = vec![];
        while let Some(batch) = batches.next_batch() {
            sizes.push(batch.len());
            seen.extend_from_slice(batch);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());

        drop(batches);
        assert_eq!(pool.outstanding(), 0);
    }
}
