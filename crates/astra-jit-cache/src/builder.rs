//! Per-translation scratch buffer.

use crate::reloc::{RelocEntry, Symbol};
use crate::runtime::TranslatedCode;

/// Accumulates one function's generated code bytes and relocation list before
/// the entry is committed to the shared cache buffers.
#[derive(Debug, Default)]
pub struct EntryBuilder {
    code: Vec<u8>,
    relocs: Vec<RelocEntry>,
}

impl EntryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_code(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn push_reloc(&mut self, offset: i32, symbol: Symbol) {
        self.relocs.push(RelocEntry::new(offset, symbol));
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn relocs(&self) -> &[RelocEntry] {
        &self.relocs
    }
}

impl From<TranslatedCode> for EntryBuilder {
    fn from(translated: TranslatedCode) -> Self {
        Self {
            code: translated.code,
            relocs: translated.relocs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reloc::SymbolKind;

    #[test]
    fn accumulates_code_and_relocs() {
        let mut builder = EntryBuilder::new();
        builder.write_code(&[0x90; 4]);
        builder.write_code(&[0xC3]);
        builder.push_reloc(0, Symbol::new(SymbolKind::DelegateTableIndex, 1));

        assert_eq!(builder.code(), &[0x90, 0x90, 0x90, 0x90, 0xC3]);
        assert_eq!(builder.relocs().len(), 1);
    }
}
