//! ELF image loading: defined function symbols and target architecture.
//!
//! Memory-maps the file and keeps only what the tracer needs, which is
//! where each function starts and whether the image is position independent.

use std::path::Path;

use memmap2::Mmap;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::types::VirtAddr;

/// A defined function symbol, at its link-time address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub addr: VirtAddr,
    /// Size in bytes (0 if unknown).
    pub size: u64,
}

/// A parsed ELF image.
pub struct ElfFile {
    _mmap: Mmap,
    symbols: Vec<Symbol>,
    machine: object::Architecture,
    position_independent: bool,
}

impl ElfFile {
    /// Load an ELF image from disk via memory mapping.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Elf(format!("open '{}': {}", path.display(), e)))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Elf(format!("mmap '{}': {}", path.display(), e)))?;
        let obj = object::File::parse(&*mmap)
            .map_err(|e| Error::Elf(format!("parse '{}': {}", path.display(), e)))?;

        // Dynamic symbols first: for shared libraries they carry the exported
        // (default-version) names even when the static table is stripped.
        let mut symbols = Vec::new();
        for sym in obj.dynamic_symbols().chain(obj.symbols()) {
            if sym.kind() != SymbolKind::Text || !sym.is_definition() || sym.address() == 0 {
                continue;
            }
            if let Ok(name) = sym.name() {
                if !name.is_empty() {
                    symbols.push(Symbol {
                        name: name.to_string(),
                        addr: VirtAddr(sym.address()),
                        size: sym.size(),
                    });
                }
            }
        }

        let machine = obj.architecture();
        let position_independent = obj.kind() == ObjectKind::Dynamic;

        Ok(ElfFile {
            _mmap: mmap,
            symbols,
            machine,
            position_independent,
        })
    }

    /// Find a function by exact name. The first definition wins.
    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Find the function containing the given link-time address.
    pub fn find_symbol_at(&self, addr: VirtAddr) -> Option<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.size > 0)
            .find(|s| addr >= s.addr && addr.addr() < s.addr.addr() + s.size)
    }

    /// Architecture of the image, if it is one we can trace.
    pub fn arch(&self) -> Result<Arch> {
        Arch::from_object(self.machine)
    }

    /// Whether symbol addresses are relative to the load address
    /// (`ET_DYN`: shared libraries and PIE executables).
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// Detect the architecture of the executable at `path`.
pub fn detect_arch(path: &Path) -> Result<Arch> {
    ElfFile::load(path)?.arch()
}
