//! Runtime symbol resolution for the traced process.
//!
//! Every file-backed image in `/proc/[pid]/maps` is parsed once; a name is
//! resolved to the first definition found, searching the main executable
//! first (so a statically linked-in allocator wins over libc) and the dynamic
//! loader last (it carries private allocator copies that user code never
//! calls).

use std::collections::HashMap;
use std::path::Path;

use nix::unistd::Pid;

use crate::elf::ElfFile;
use crate::error::Result;
use crate::procfs;
use crate::types::VirtAddr;

pub trait SymbolResolver {
    /// Runtime entry address of the function `name`.
    fn resolve(&self, name: &str) -> Option<VirtAddr>;

    /// `function+offset` for a runtime address, for diagnostics.
    fn symbolize(&self, _addr: VirtAddr) -> Option<String> {
        None
    }
}

impl SymbolResolver for HashMap<String, VirtAddr> {
    fn resolve(&self, name: &str) -> Option<VirtAddr> {
        self.get(name).copied()
    }
}

/// An ELF image as mapped into the target.
struct LoadedImage {
    path: String,
    bias: u64,
    elf: ElfFile,
}

/// Symbols of every image mapped into a process.
pub struct ProcessSymbols {
    images: Vec<LoadedImage>,
}

impl ProcessSymbols {
    pub fn load(pid: Pid) -> Result<Self> {
        let maps = procfs::read_memory_maps(pid)?;
        let mut images = Vec::new();

        for path in procfs::mapped_images(&maps) {
            let elf = match ElfFile::load(Path::new(path)) {
                Ok(elf) => elf,
                Err(e) => {
                    log::debug!("skipping {}: {}", path, e);
                    continue;
                }
            };
            let bias = if elf.is_position_independent() {
                match procfs::find_load_address(&maps, path) {
                    Some(base) => base.addr(),
                    None => continue,
                }
            } else {
                0
            };
            log::debug!(
                "loaded {} symbols from {} (bias 0x{:x})",
                elf.symbols().len(),
                path,
                bias
            );
            images.push(LoadedImage {
                path: path.to_string(),
                bias,
                elf,
            });
        }

        images.sort_by_key(|img| is_dynamic_loader(&img.path));
        Ok(ProcessSymbols { images })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

fn is_dynamic_loader(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("ld-") || n.starts_with("ld."))
}

impl SymbolResolver for ProcessSymbols {
    fn resolve(&self, name: &str) -> Option<VirtAddr> {
        self.images.iter().find_map(|img| {
            img.elf
                .find_symbol(name)
                .map(|sym| VirtAddr(sym.addr.addr().wrapping_add(img.bias)))
        })
    }

    fn symbolize(&self, addr: VirtAddr) -> Option<String> {
        self.images.iter().find_map(|img| {
            let link_addr = VirtAddr(addr.addr().wrapping_sub(img.bias));
            img.elf
                .find_symbol_at(link_addr)
                .map(|sym| format!("{}+0x{:x}", sym.name, link_addr.addr() - sym.addr.addr()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_resolver() {
        let mut table = HashMap::new();
        table.insert("malloc".to_string(), VirtAddr(0x7f00_1000));
        assert_eq!(table.resolve("malloc"), Some(VirtAddr(0x7f00_1000)));
        assert_eq!(table.resolve("free"), None);
        assert_eq!(table.symbolize(VirtAddr(0x7f00_1000)), None);
    }

    #[test]
    fn dynamic_loader_detection() {
        assert!(is_dynamic_loader("/lib64/ld-linux-x86-64.so.2"));
        assert!(is_dynamic_loader("/lib/ld-musl-aarch64.so.1"));
        assert!(!is_dynamic_loader("/usr/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(!is_dynamic_loader("/usr/bin/ldconfig"));
    }

    #[test]
    fn own_process_resolves_malloc() {
        // The test binary links libc dynamically on the usual targets.
        let symbols = ProcessSymbols::load(nix::unistd::getpid()).unwrap();
        assert!(symbols.image_count() > 0);
        if let Some(addr) = symbols.resolve("malloc") {
            assert!(!addr.is_null());
            let name = symbols.symbolize(addr).unwrap_or_default();
            assert!(name.contains('+'), "got {}", name);
        }
    }
}
