//! Minimal 64-bit ELF reader for guest kernel images.
//!
//! The loader needs exactly two things from an image: the entry point and
//! the loadable segments with their physical placement. Kernel loading
//! operates on physical addresses; the entry point is translated into a
//! physical address by the segment that covers it.

/// A parse failure; the image is not a loadable 64-bit ELF.
#[derive(Debug, PartialEq, Eq)]
pub struct ElfError;

/// Program-header type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PType {
    Null,
    Load,
    Other(u32),
}

/// One program header.
#[derive(Debug, Clone, Copy)]
pub struct Phdr {
    pub type_: PType,
    /// Offset of the segment in the image.
    pub offset: usize,
    /// Virtual address the segment is linked at.
    pub vaddr: usize,
    /// Physical address the segment loads at.
    pub paddr: usize,
    /// Bytes present in the image.
    pub filesz: usize,
    /// Bytes occupied in memory (zero-filled past `filesz`).
    pub memsz: usize,
}

/// A borrowed 64-bit little-endian ELF image.
pub struct Elf64<'a> {
    bytes: &'a [u8],
}

fn read_u16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(b: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(at..at + 8)?.try_into().ok()?))
}

impl<'a> Elf64<'a> {
    /// Parse an image, checking magic, class and endianness.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < 64 || &bytes[0..4] != b"\x7fELF" {
            return Err(ElfError);
        }
        // Class 2 (64-bit), data 1 (little endian).
        if bytes[4] != 2 || bytes[5] != 1 {
            return Err(ElfError);
        }
        Ok(Self { bytes })
    }

    /// Linked entry point of this binary.
    pub fn entry(&self) -> usize {
        read_u64(self.bytes, 24).unwrap() as usize
    }

    /// Entry point as a physical address, through the segment covering it.
    pub fn entry_paddr(&self) -> Option<usize> {
        let entry = self.entry();
        self.phdrs()
            .filter(|p| p.type_ == PType::Load)
            .find(|p| (p.vaddr..p.vaddr + p.memsz).contains(&entry))
            .map(|p| entry - p.vaddr + p.paddr)
    }

    /// Iterate over the program headers.
    pub fn phdrs(&self) -> impl Iterator<Item = Phdr> + '_ {
        let phoff = read_u64(self.bytes, 32).unwrap_or(0) as usize;
        let phentsize = read_u16(self.bytes, 54).unwrap_or(0) as usize;
        let phnum = read_u16(self.bytes, 56).unwrap_or(0) as usize;
        (0..phnum).filter_map(move |i| {
            let at = phoff + i * phentsize;
            Some(Phdr {
                type_: match read_u32(self.bytes, at)? {
                    0 => PType::Null,
                    1 => PType::Load,
                    v => PType::Other(v),
                },
                offset: read_u64(self.bytes, at + 8)? as usize,
                vaddr: read_u64(self.bytes, at + 16)? as usize,
                paddr: read_u64(self.bytes, at + 24)? as usize,
                filesz: read_u64(self.bytes, at + 32)? as usize,
                memsz: read_u64(self.bytes, at + 40)? as usize,
            })
        })
    }

    /// Bytes of the segment described by `phdr` that exist in the image.
    pub fn segment_bytes(&self, phdr: &Phdr) -> Option<&'a [u8]> {
        self.bytes.get(phdr.offset..phdr.offset + phdr.filesz)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Assemble a tiny ELF with one PT_LOAD segment.
    pub(crate) fn sample_image(entry_vaddr: u64, paddr: u64, payload: &[u8]) -> Vec<u8> {
        let mut img = vec![0u8; 0x1000 + payload.len()];
        img[0..4].copy_from_slice(b"\x7fELF");
        img[4] = 2; // 64-bit
        img[5] = 1; // little endian
        img[24..32].copy_from_slice(&entry_vaddr.to_le_bytes());
        img[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        img[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        img[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let at = 64;
        img[at..at + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        img[at + 8..at + 16].copy_from_slice(&0x1000u64.to_le_bytes()); // offset
        img[at + 16..at + 24].copy_from_slice(&entry_vaddr.to_le_bytes()); // vaddr
        img[at + 24..at + 32].copy_from_slice(&paddr.to_le_bytes()); // paddr
        img[at + 32..at + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        img[at + 40..at + 48].copy_from_slice(&(payload.len() as u64 + 0x800).to_le_bytes());
        img[0x1000..].copy_from_slice(payload);
        img
    }

    #[test]
    fn rejects_non_elf() {
        assert_eq!(Elf64::parse(b"not an elf").map(|_| ()), Err(ElfError));
    }

    #[test]
    fn entry_translates_to_physical() {
        let img = sample_image(0xffff_8000_0010_0040, 0x10_0000, &[0x90; 64]);
        let elf = Elf64::parse(&img).unwrap();
        assert_eq!(elf.entry(), 0xffff_8000_0010_0040);
        assert_eq!(elf.entry_paddr(), Some(0x10_0040));

        let phdr = elf.phdrs().find(|p| p.type_ == PType::Load).unwrap();
        assert_eq!(elf.segment_bytes(&phdr).unwrap().len(), 64);
    }
}
