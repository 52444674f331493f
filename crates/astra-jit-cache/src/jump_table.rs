//! Persisted content of the jump-table runtime.
//!
//! The runtime structure itself lives elsewhere; the cache only carries its
//! two tables across runs as an explicit, versioned binary encoding: a
//! fixed-record direct-branch table and a dynamic-relocation table.

use std::io::{Read, Write};

use crate::error::{CacheError, Result};
use crate::io::{ReadLeExt, WriteLeExt};

pub const JUMP_TABLE_SNAPSHOT_VERSION: u32 = 1;

/// One direct-branch slot: a guest target and the offset of its host entry
/// stub within the jump table's native region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRecord {
    pub guest: u64,
    pub host_offset: u64,
}

/// One dynamic-dispatch slot awaiting late binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicRecord {
    pub guest: u64,
    pub stub_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpTableSnapshot {
    pub branches: Vec<BranchRecord>,
    pub dynamic: Vec<DynamicRecord>,
}

impl JumpTableSnapshot {
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.dynamic.is_empty()
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(JUMP_TABLE_SNAPSHOT_VERSION)?;

        let branch_count: u32 = self
            .branches
            .len()
            .try_into()
            .map_err(|_| CacheError::Corrupt("too many branch records"))?;
        w.write_u32_le(branch_count)?;
        for record in &self.branches {
            w.write_u64_le(record.guest)?;
            w.write_u64_le(record.host_offset)?;
        }

        let dynamic_count: u32 = self
            .dynamic
            .len()
            .try_into()
            .map_err(|_| CacheError::Corrupt("too many dynamic records"))?;
        w.write_u32_le(dynamic_count)?;
        for record in &self.dynamic {
            w.write_u64_le(record.guest)?;
            w.write_u32_le(record.stub_index)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let version = r.read_u32_le()?;
        if version != JUMP_TABLE_SNAPSHOT_VERSION {
            return Err(CacheError::Corrupt("unsupported jump-table snapshot version"));
        }

        let branch_count = r.read_u32_le()? as usize;
        let mut branches = Vec::with_capacity(branch_count.min(4096));
        for _ in 0..branch_count {
            branches.push(BranchRecord {
                guest: r.read_u64_le()?,
                host_offset: r.read_u64_le()?,
            });
        }

        let dynamic_count = r.read_u32_le()? as usize;
        let mut dynamic = Vec::with_capacity(dynamic_count.min(4096));
        for _ in 0..dynamic_count {
            dynamic.push(DynamicRecord {
                guest: r.read_u64_le()?,
                stub_index: r.read_u32_le()?,
            });
        }

        Ok(Self { branches, dynamic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> JumpTableSnapshot {
        JumpTableSnapshot {
            branches: vec![
                BranchRecord {
                    guest: 0x1000,
                    host_offset: 0,
                },
                BranchRecord {
                    guest: 0x2040,
                    host_offset: 16,
                },
            ],
            dynamic: vec![DynamicRecord {
                guest: 0x3000,
                stub_index: 1,
            }],
        }
    }

    #[test]
    fn round_trip() {
        let snapshot = sample();
        let mut buf = Vec::new();
        snapshot.encode(&mut buf).unwrap();
        assert_eq!(
            JumpTableSnapshot::decode(&mut Cursor::new(&buf)).unwrap(),
            snapshot
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        buf[0] = 9;
        assert!(JumpTableSnapshot::decode(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn truncated_record_array_is_an_error() {
        let mut buf = Vec::new();
        sample().encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(JumpTableSnapshot::decode(&mut Cursor::new(&buf)).is_err());
    }
}
