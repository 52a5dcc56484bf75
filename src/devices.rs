use std::{fs, path::Path};

use anyhow::Context;

use crate::device::{unmapped_line, Device, CACHE_LINE_SIZE};

/// Plain RAM covering one region. Size must be a power of two so mirror
/// arithmetic stays a mask.
pub struct Ram {
    name: String,
    base: u16,
    data: Vec<u8>,
}

impl Ram {
    pub fn new(name: impl Into<String>, base: u16, size: usize) -> Self {
        assert!(size.is_power_of_two() && size >= CACHE_LINE_SIZE);
        Ram {
            name: name.into(),
            base,
            data: vec![0; size],
        }
    }

    fn offset(&self, address: u16) -> usize {
        (address.wrapping_sub(self.base) as usize) & (self.data.len() - 1)
    }
}

impl Device for Ram {
    fn name(&self) -> &str {
        &self.name
    }

    fn peek_mem(&self, address: u16) -> u8 {
        self.data[self.offset(address)]
    }

    fn write_mem(&mut self, address: u16, value: u8) {
        let offset = self.offset(address);
        self.data[offset] = value;
    }

    fn read_cache_line(&self, start: u16) -> Option<&[u8]> {
        let offset = self.offset(start);
        Some(&self.data[offset..offset + CACHE_LINE_SIZE])
    }

    fn write_cache_line(&mut self, start: u16) -> Option<&mut [u8]> {
        let offset = self.offset(start);
        Some(&mut self.data[offset..offset + CACHE_LINE_SIZE])
    }
}

/// Read-only memory. The image is repeated until it fills the mapped
/// region, so a 16K image in a 32K region appears twice.
pub struct Rom {
    name: String,
    base: u16,
    data: Vec<u8>,
}

impl Rom {
    pub fn new(name: impl Into<String>, base: u16, size: usize, image: &[u8]) -> Self {
        assert!(size.is_power_of_two() && size >= CACHE_LINE_SIZE);
        assert!(!image.is_empty(), "ROM image is empty");
        Rom {
            name: name.into(),
            base,
            data: (0..size).map(|i| image[i % image.len()]).collect(),
        }
    }

    pub fn from_file(
        name: impl Into<String>,
        base: u16,
        size: usize,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let image = fs::read(path)
            .with_context(|| format!("Failed to read ROM image {}", path.display()))?;
        if image.is_empty() {
            anyhow::bail!("ROM image {} is empty", path.display());
        }
        Ok(Rom::new(name, base, size, &image))
    }

    fn offset(&self, address: u16) -> usize {
        (address.wrapping_sub(self.base) as usize) & (self.data.len() - 1)
    }
}

impl Device for Rom {
    fn name(&self) -> &str {
        &self.name
    }

    fn peek_mem(&self, address: u16) -> u8 {
        self.data[self.offset(address)]
    }

    fn read_cache_line(&self, start: u16) -> Option<&[u8]> {
        let offset = self.offset(start);
        Some(&self.data[offset..offset + CACHE_LINE_SIZE])
    }
}

/// Placeholder for a slot with nothing in it. Reads float high through the
/// shared unmapped block, writes disappear.
pub struct Empty {
    name: String,
}

impl Empty {
    pub fn new(name: impl Into<String>) -> Self {
        Empty { name: name.into() }
    }
}

impl Device for Empty {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_cache_line(&self, start: u16) -> Option<&[u8]> {
        Some(unmapped_line(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_image_repeats_across_region() {
        let image: Vec<u8> = (0..=0xFF).cycle().take(0x4000).collect();
        let rom = Rom::new("test", 0x4000, 0x8000, &image);
        assert_eq!(rom.peek_mem(0x4123), rom.peek_mem(0x8123));
        assert_eq!(rom.peek_mem(0x4000), image[0]);
        assert_eq!(rom.peek_mem(0xBFFF), image[0x3FFF]);
    }

    #[test]
    fn ram_lines_window_into_backing_store() {
        let mut ram = Ram::new("test", 0x8000, 0x4000);
        ram.write_mem(0x8105, 0x42);
        let line = ram.read_cache_line(0x8100).unwrap();
        assert_eq!(line[0x05], 0x42);

        let line = ram.write_cache_line(0x8100).unwrap();
        line[0x06] = 0x43;
        assert_eq!(ram.peek_mem(0x8106), 0x43);
    }

    #[test]
    fn empty_slot_reads_open_bus() {
        let mut empty = Empty::new("empty");
        assert_eq!(empty.read_mem(0x1234), 0xFF);
        empty.write_mem(0x1234, 0x00);
        assert_eq!(empty.peek_mem(0x1234), 0xFF);
        let line = empty.read_cache_line(0x1234).unwrap();
        assert!(std::ptr::eq(line.as_ptr(), unmapped_line(0x1234).as_ptr()));
        assert!(empty.write_cache_line(0x1234).is_none());
    }
}
