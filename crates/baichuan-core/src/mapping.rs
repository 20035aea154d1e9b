//! Placement of one rank inside the tensor-parallel group.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub world_size: usize,
    pub tp_size: usize,
    pub rank: usize,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            world_size: 1,
            tp_size: 1,
            rank: 0,
        }
    }
}

impl Mapping {
    pub fn new(world_size: usize, tp_size: usize, rank: usize) -> Result<Self> {
        if tp_size == 0 || world_size != tp_size {
            return Err(Error::InvalidConfig(format!(
                "world_size ({world_size}) must equal tp_size ({tp_size})"
            )));
        }
        if rank >= world_size {
            return Err(Error::InvalidConfig(format!(
                "rank {rank} is out of range for world_size {world_size}"
            )));
        }
        Ok(Self {
            world_size,
            tp_size,
            rank,
        })
    }

    /// Mapping for every rank of a tensor-parallel group.
    pub fn tensor_parallel(tp_size: usize) -> Result<Vec<Self>> {
        (0..tp_size)
            .map(|rank| Self::new(tp_size, tp_size, rank))
            .collect()
    }

    pub fn tp_rank(&self) -> usize {
        self.rank % self.tp_size
    }

    /// Ranks that hold shards of the same layers as this rank.
    pub fn tp_group(&self) -> Vec<usize> {
        let first = self.rank - self.tp_rank();
        (first..first + self.tp_size).collect()
    }
}

/// Round the vocabulary up so it splits evenly across `tp_size` ranks.
pub fn pad_vocab_size(vocab_size: usize, tp_size: usize) -> usize {
    if tp_size <= 1 {
        return vocab_size;
    }
    vocab_size.div_ceil(tp_size) * tp_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_vocab_size() {
        assert_eq!(pad_vocab_size(64000, 1), 64000);
        assert_eq!(pad_vocab_size(64000, 3), 64002);
        assert_eq!(pad_vocab_size(125696, 8), 125696);
        assert_eq!(pad_vocab_size(37, 2), 38);
    }

    #[test]
    fn test_mapping_validation() {
        assert!(Mapping::new(2, 2, 1).is_ok());
        assert!(Mapping::new(2, 2, 2).is_err());
        assert!(Mapping::new(4, 2, 0).is_err());
        assert!(Mapping::new(0, 0, 0).is_err());
    }

    #[test]
    fn test_tp_group() {
        let mappings = Mapping::tensor_parallel(4).unwrap();
        assert_eq!(mappings.len(), 4);
        assert_eq!(mappings[2].tp_rank(), 2);
        assert_eq!(mappings[3].tp_group(), vec![0, 1, 2, 3]);
    }
}
