//! Relocation model: symbolic references embedded in cached machine code and
//! the load-time patching that resolves them against this run's addresses.

use std::io::{Read, Write};

use crate::error::{CacheError, Result};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::runtime::DelegateTable;

/// Wire tag of a [`Symbol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SymbolKind {
    None = 0,
    FunctionTableIndex = 1,
    DelegateTableIndex = 2,
    Special = 3,
    /// Reserved for the tier-2 inline counter cache; never produced here.
    CounterTableIndex = 4,
    /// Reserved for the tier-2 inline counter cache; never produced here.
    DispatchStubIndex = 5,
}

impl SymbolKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => SymbolKind::None,
            1 => SymbolKind::FunctionTableIndex,
            2 => SymbolKind::DelegateTableIndex,
            3 => SymbolKind::Special,
            4 => SymbolKind::CounterTableIndex,
            5 => SymbolKind::DispatchStubIndex,
            _ => return Err(CacheError::Corrupt("unknown symbol kind")),
        })
    }
}

/// Reserved values of `SymbolKind::Special` symbols.
pub mod special {
    /// Base address of the emulated guest address space.
    pub const PAGE_TABLE_POINTER: u64 = 0;
    /// Native stub base of the direct jump table.
    pub const JUMP_TABLE_POINTER: u64 = 1;
    /// Native stub base of the dynamic jump table.
    pub const DYNAMIC_TABLE_POINTER: u64 = 2;
}

/// A symbolic reference carried by a relocation.
///
/// `Symbol` with kind [`SymbolKind::None`] carries no payload: reading its
/// value fails with [`CacheError::EmptySymbol`] so a non-relocation can never
/// be accidentally resolved as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    kind: SymbolKind,
    value: u64,
}

impl Symbol {
    pub fn new(kind: SymbolKind, value: u64) -> Self {
        Self { kind, value }
    }

    pub fn empty() -> Self {
        Self {
            kind: SymbolKind::None,
            value: 0,
        }
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn value(&self) -> Result<u64> {
        if self.kind == SymbolKind::None {
            return Err(CacheError::EmptySymbol);
        }
        Ok(self.value)
    }
}

/// One pointer-sized immediate in a function's code that must be patched at
/// load time: a byte offset plus the symbol resolving to the pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    pub offset: i32,
    pub symbol: Symbol,
}

/// `offset i32 + kind u8 + value u64`.
pub const RELOC_ENTRY_SIZE: usize = 13;

impl RelocEntry {
    pub fn new(offset: i32, symbol: Symbol) -> Self {
        Self { offset, symbol }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32_le(self.offset)?;
        w.write_u8(self.symbol.kind as u8)?;
        w.write_u64_le(self.symbol.value)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let offset = r.read_i32_le()?;
        let kind = SymbolKind::from_u8(r.read_u8()?)?;
        let value = r.read_u64_le()?;
        Ok(Self {
            offset,
            symbol: Symbol::new(kind, value),
        })
    }
}

/// Per-run pointer values that `Special` symbols resolve to, supplied by the
/// caller of materialization.
#[derive(Debug, Clone, Copy)]
pub struct RelocTargets {
    pub page_table: u64,
    pub jump_table: u64,
    pub dynamic_table: u64,
}

/// Patch every relocation of one function into its code buffer.
///
/// Each entry resolves to an 8-byte little-endian immediate written at the
/// entry's byte offset. Must run exactly once per loaded entry, before the
/// buffer is mapped executable. Unresolvable symbols are fatal: they mean the
/// cache was built against an incompatible binary, and executing
/// under-patched code is never acceptable.
pub fn apply_relocations(
    code: &mut [u8],
    relocs: &[RelocEntry],
    targets: &RelocTargets,
    delegates: &dyn DelegateTable,
) -> Result<()> {
    for reloc in relocs {
        let imm = match reloc.symbol.kind() {
            SymbolKind::Special => match reloc.symbol.value()? {
                special::PAGE_TABLE_POINTER => targets.page_table,
                special::JUMP_TABLE_POINTER => targets.jump_table,
                special::DYNAMIC_TABLE_POINTER => targets.dynamic_table,
                _ => return Err(CacheError::Corrupt("unknown special relocation value")),
            },
            SymbolKind::DelegateTableIndex => {
                let index = reloc.symbol.value()?;
                delegates
                    .lookup(index)
                    .ok_or(CacheError::DelegateLookupMiss(index))?
            }
            kind => return Err(CacheError::UnexpectedSymbol(kind as u8)),
        };

        let offset = usize::try_from(reloc.offset)
            .map_err(|_| CacheError::Corrupt("negative relocation offset"))?;
        let slot = offset
            .checked_add(8)
            .and_then(|end| code.get_mut(offset..end))
            .ok_or(CacheError::Corrupt("relocation offset out of bounds"))?;
        slot.copy_from_slice(&imm.to_le_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FixedDelegates;

    impl DelegateTable for FixedDelegates {
        fn lookup(&self, index: u64) -> Option<u64> {
            (index == 2).then_some(0xAABB_CCDD_EEFF_0011)
        }
    }

    #[test]
    fn empty_symbol_has_no_value() {
        let sym = Symbol::empty();
        assert_eq!(sym.kind(), SymbolKind::None);
        assert!(matches!(sym.value(), Err(CacheError::EmptySymbol)));
    }

    #[test]
    fn entry_round_trip() {
        let entry = RelocEntry::new(36, Symbol::new(SymbolKind::DelegateTableIndex, 7));
        let mut buf = Vec::new();
        entry.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), RELOC_ENTRY_SIZE);
        assert_eq!(RelocEntry::decode(&mut Cursor::new(&buf)).unwrap(), entry);
    }

    #[test]
    fn delegate_patch_writes_little_endian_pointer() {
        let mut code = [0u8; 16];
        let relocs = [RelocEntry::new(
            4,
            Symbol::new(SymbolKind::DelegateTableIndex, 2),
        )];
        let targets = RelocTargets {
            page_table: 0,
            jump_table: 0,
            dynamic_table: 0,
        };
        apply_relocations(&mut code, &relocs, &targets, &FixedDelegates).unwrap();

        assert_eq!(&code[4..12], &0xAABB_CCDD_EEFF_0011u64.to_le_bytes());
        assert!(code[..4].iter().all(|&b| b == 0));
        assert!(code[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn special_symbols_resolve_from_targets() {
        let mut code = [0u8; 24];
        let relocs = [
            RelocEntry::new(0, Symbol::new(SymbolKind::Special, special::PAGE_TABLE_POINTER)),
            RelocEntry::new(8, Symbol::new(SymbolKind::Special, special::JUMP_TABLE_POINTER)),
            RelocEntry::new(
                16,
                Symbol::new(SymbolKind::Special, special::DYNAMIC_TABLE_POINTER),
            ),
        ];
        let targets = RelocTargets {
            page_table: 0x1000,
            jump_table: 0x2000,
            dynamic_table: 0x3000,
        };
        apply_relocations(&mut code, &relocs, &targets, &FixedDelegates).unwrap();

        assert_eq!(&code[0..8], &0x1000u64.to_le_bytes());
        assert_eq!(&code[8..16], &0x2000u64.to_le_bytes());
        assert_eq!(&code[16..24], &0x3000u64.to_le_bytes());
    }

    #[test]
    fn delegate_miss_is_fatal() {
        let mut code = [0u8; 16];
        let relocs = [RelocEntry::new(
            0,
            Symbol::new(SymbolKind::DelegateTableIndex, 9),
        )];
        let targets = RelocTargets {
            page_table: 0,
            jump_table: 0,
            dynamic_table: 0,
        };
        let err = apply_relocations(&mut code, &relocs, &targets, &FixedDelegates).unwrap_err();
        assert!(matches!(err, CacheError::DelegateLookupMiss(9)));
    }

    #[test]
    fn unexpected_kind_is_fatal() {
        let mut code = [0u8; 16];
        let relocs = [RelocEntry::new(
            0,
            Symbol::new(SymbolKind::FunctionTableIndex, 0),
        )];
        let targets = RelocTargets {
            page_table: 0,
            jump_table: 0,
            dynamic_table: 0,
        };
        let err = apply_relocations(&mut code, &relocs, &targets, &FixedDelegates).unwrap_err();
        assert!(matches!(err, CacheError::UnexpectedSymbol(1)));
    }

    #[test]
    fn out_of_bounds_offset_is_rejected() {
        let mut code = [0u8; 8];
        let relocs = [RelocEntry::new(
            4,
            Symbol::new(SymbolKind::DelegateTableIndex, 2),
        )];
        let targets = RelocTargets {
            page_table: 0,
            jump_table: 0,
            dynamic_table: 0,
        };
        assert!(apply_relocations(&mut code, &relocs, &targets, &FixedDelegates).is_err());
    }
}
