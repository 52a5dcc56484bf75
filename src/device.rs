use once_cell::sync::Lazy;

pub const CACHE_LINE_BITS: usize = 8;
pub const CACHE_LINE_SIZE: usize = 1 << CACHE_LINE_BITS;
pub const CACHE_LINE_LOW: u16 = (CACHE_LINE_SIZE - 1) as u16;
pub const CACHE_LINE_HIGH: u16 = !CACHE_LINE_LOW;
pub const CACHE_LINE_COUNT: usize = 0x10000 >> CACHE_LINE_BITS;

/// Backing store for reads from unmapped address space. Every byte reads
/// 0xFF, the open-bus value.
pub static UNMAPPED_READ: Lazy<[u8; 0x10000]> = Lazy::new(|| [0xFF; 0x10000]);

/// The cache line of `UNMAPPED_READ` covering `start`.
pub fn unmapped_line(start: u16) -> &'static [u8] {
    let base = (start & CACHE_LINE_HIGH) as usize;
    &UNMAPPED_READ[base..base + CACHE_LINE_SIZE]
}

/// A device mapped into the machine's memory and IO space.
///
/// Byte accesses come in three flavors: `read` may have side effects,
/// `peek` never does, `write` stores. The cache line hooks let a device
/// expose a stable 256-byte block for a line so the caller can bypass the
/// byte interface; `None` means the line must go byte by byte. The
/// defaults describe a device mapped nowhere: reads float high, writes
/// disappear, nothing is cacheable.
pub trait Device {
    fn name(&self) -> &str;

    fn read_mem(&mut self, address: u16) -> u8 {
        self.peek_mem(address)
    }

    fn peek_mem(&self, address: u16) -> u8 {
        let _ = address;
        0xFF
    }

    fn write_mem(&mut self, address: u16, value: u8) {
        let _ = (address, value);
    }

    fn read_io(&mut self, port: u8) -> u8 {
        self.peek_io(port)
    }

    fn peek_io(&self, port: u8) -> u8 {
        let _ = port;
        0xFF
    }

    fn write_io(&mut self, port: u8, value: u8) {
        let _ = (port, value);
    }

    /// Stable read-only block for the line containing `start`, if reads
    /// from that line are side-effect free.
    fn read_cache_line(&self, start: u16) -> Option<&[u8]> {
        let _ = start;
        None
    }

    /// Stable writable block for the line containing `start`, if writes to
    /// that line land in plain memory.
    fn write_cache_line(&mut self, start: u16) -> Option<&mut [u8]> {
        let _ = start;
        None
    }

    fn reset(&mut self) {}
}
