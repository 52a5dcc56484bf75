use std::{cell::RefCell, rc::Rc};

use msxbus::{
    device::{unmapped_line, Device},
    devices::Ram,
    Bus,
};
use tracing_subscriber::fmt;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    let fmt_subscriber = fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber)
        .expect("Unable to set global tracing subscriber");
}

/// IO device that answers reads with a fixed value and logs writes into a
/// shared journal, so tests can watch dispatch from outside the bus.
struct IoProbe {
    name: String,
    value: u8,
    writes: Rc<RefCell<Vec<(u8, u8)>>>,
}

impl IoProbe {
    fn new(name: &str, value: u8, writes: Rc<RefCell<Vec<(u8, u8)>>>) -> Self {
        IoProbe {
            name: name.to_string(),
            value,
            writes,
        }
    }
}

impl Device for IoProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn peek_io(&self, _port: u8) -> u8 {
        self.value
    }

    fn write_io(&mut self, port: u8, value: u8) {
        self.writes.borrow_mut().push((port, value));
    }
}

#[test]
fn test_dispatch_follows_primary_slot_register() {
    let mut bus = Bus::new();
    let ram0 = bus.add_device(Box::new(Ram::new("ram-0", 0x0000, 0x4000)));
    let ram3 = bus.add_device(Box::new(Ram::new("ram-3", 0x0000, 0x4000)));
    bus.register_mem_device(ram0, 0, 0, 0x0000, 0x4000).unwrap();
    bus.register_mem_device(ram3, 3, 0, 0x0000, 0x4000).unwrap();

    // slot 0 is visible in every page after power-on
    bus.write_byte(0x1000, 0xAA);
    bus.set_primary_slot_config(0b00_00_00_11);
    bus.write_byte(0x1000, 0x55);
    assert_eq!(bus.read_byte(0x1000), 0x55);

    bus.set_primary_slot_config(0x00);
    assert_eq!(bus.read_byte(0x1000), 0xAA);

    // pages without a device float high, writes are dropped
    assert_eq!(bus.read_byte(0x8000), 0xFF);
    bus.write_byte(0x8000, 0x12);
    assert_eq!(bus.peek_byte(0x8000), 0xFF);
}

#[test]
fn test_sub_slot_register_reads_back_inverted() {
    let mut bus = Bus::new();
    bus.set_expanded(3);
    bus.set_primary_slot_config(0b11_00_00_00);

    bus.write_byte(0xFFFF, 0x12);
    assert_eq!(bus.sub_slot_register(3), 0x12);
    assert_eq!(bus.read_byte(0xFFFF), !0x12);
    assert_eq!(bus.peek_byte(0xFFFF), !0x12);

    // with an unexpanded primary in page 3 the address is plain memory
    bus.set_primary_slot_config(0x00);
    assert_eq!(bus.read_byte(0xFFFF), 0xFF);
    bus.write_byte(0xFFFF, 0x34);
    assert_eq!(bus.sub_slot_register(0), 0x00);

    bus.unset_expanded(3);
}

#[test]
fn test_secondary_slot_selection() {
    let mut bus = Bus::new();
    bus.set_expanded(3);
    let low = bus.add_device(Box::new(Ram::new("ram-low", 0x4000, 0x4000)));
    let high = bus.add_device(Box::new(Ram::new("ram-high", 0x4000, 0x4000)));
    bus.register_mem_device(low, 3, 0, 0x4000, 0x4000).unwrap();
    bus.register_mem_device(high, 3, 1, 0x4000, 0x4000).unwrap();

    // slot 3 in page 1 for the data, and in page 3 to reach the register
    bus.set_primary_slot_config(0b11_00_11_00);
    bus.write_byte(0xFFFF, 0b00_00_00_00);
    bus.write_byte(0x5000, 0x01);
    bus.write_byte(0xFFFF, 0b00_00_01_00);
    bus.write_byte(0x5000, 0x02);
    assert_eq!(bus.read_byte(0x5000), 0x02);

    bus.write_byte(0xFFFF, 0b00_00_00_00);
    assert_eq!(bus.read_byte(0x5000), 0x01);
}

#[test]
fn test_mem_registration_rejects_overlap() {
    let mut bus = Bus::new();
    let a = bus.add_device(Box::new(Ram::new("a", 0x4000, 0x4000)));
    let b = bus.add_device(Box::new(Ram::new("b", 0x4000, 0x4000)));
    bus.register_mem_device(a, 1, 0, 0x4000, 0x4000).unwrap();

    let err = bus.register_mem_device(b, 1, 0, 0x6000, 0x4000).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Memory range 0x6000-0x9FFF in slot 1-0 already in use by a"
    );

    // the same range in another secondary slot coexists
    bus.set_expanded(1);
    bus.register_mem_device(b, 1, 1, 0x4000, 0x4000).unwrap();

    bus.unregister_mem_device(b, 1, 1, 0x4000, 0x4000);
    let device = bus.remove_device(b);
    assert_eq!(device.name(), "b");
}

#[test]
fn test_mem_registration_needs_expanded_primary() {
    let mut bus = Bus::new();
    let ram = bus.add_device(Box::new(Ram::new("ram", 0x0000, 0x4000)));
    let err = bus.register_mem_device(ram, 2, 1, 0x0000, 0x4000).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid secondary slot specification: \"1\"."
    );

    bus.set_expanded(2);
    bus.register_mem_device(ram, 2, 1, 0x0000, 0x4000).unwrap();
}

#[test]
fn test_cache_lines_resolve_like_bytes() {
    let mut bus = Bus::new();
    let ram = bus.add_device(Box::new(Ram::new("ram", 0x8000, 0x4000)));
    bus.register_mem_device(ram, 0, 0, 0x8000, 0x4000).unwrap();

    bus.write_byte(0x8123, 0x99);
    let line = bus.read_cache_line(0x8100).unwrap();
    assert_eq!(line[0x23], 0x99);

    let line = bus.write_cache_line(0x8100).unwrap();
    line[0x24] = 0x77;
    assert_eq!(bus.peek_byte(0x8124), 0x77);

    // unmapped space serves the shared all-ones line, writes go nowhere
    let line = bus.read_cache_line(0x4000).unwrap();
    assert!(std::ptr::eq(line.as_ptr(), unmapped_line(0x4000).as_ptr()));
    assert!(bus.write_cache_line(0x4000).is_none());
}

#[test]
fn test_ffxx_line_uncacheable_while_expanded() {
    let mut bus = Bus::new();
    assert!(bus.read_cache_line(0xFF00).is_some());

    // page 3 shows primary slot 0 after power-on
    bus.set_expanded(0);
    assert!(bus.read_cache_line(0xFF00).is_none());
    assert!(bus.write_cache_line(0xFF00).is_none());
    assert!(bus.read_cache_line(0xFE00).is_some());

    // a different page 3 primary frees the line again
    bus.set_primary_slot_config(0b01_00_00_00);
    assert!(bus.read_cache_line(0xFF00).is_some());

    bus.set_primary_slot_config(0x00);
    bus.unset_expanded(0);
    assert!(bus.read_cache_line(0xFF00).is_some());
}

#[test]
fn test_word_access_is_little_endian() {
    let mut bus = Bus::new();
    let ram = bus.add_device(Box::new(Ram::new("ram", 0x0000, 0x4000)));
    bus.register_mem_device(ram, 0, 0, 0x0000, 0x4000).unwrap();

    bus.write_word(0x1000, 0xBEEF);
    assert_eq!(bus.read_byte(0x1000), 0xEF);
    assert_eq!(bus.read_byte(0x1001), 0xBE);
    assert_eq!(bus.read_word(0x1000), 0xBEEF);
}

#[test]
fn test_io_reads_combine_and_writes_fan_out() {
    let mut bus = Bus::new();
    let writes = Rc::new(RefCell::new(Vec::new()));
    let a = bus.add_device(Box::new(IoProbe::new("a", 0b1010_1111, writes.clone())));
    let b = bus.add_device(Box::new(IoProbe::new("b", 0b1101_1111, writes.clone())));
    bus.register_in_port(a, 0x98);
    bus.register_in_port(b, 0x98);
    bus.register_out_port(a, 0x98);
    bus.register_out_port(b, 0x98);

    // open-collector style: simultaneous readers AND together
    assert_eq!(bus.input(0x98), 0b1000_1111);
    assert_eq!(bus.peek_input(0x98), 0b1000_1111);

    bus.output(0x98, 0x42);
    assert_eq!(writes.borrow().as_slice(), &[(0x98, 0x42), (0x98, 0x42)]);

    // dropping one claimant leaves the other in place
    bus.unregister_in_port(a, 0x98);
    assert_eq!(bus.input(0x98), 0b1101_1111);

    // an unclaimed port floats high
    assert_eq!(bus.input(0x99), 0xFF);
    bus.output(0x99, 0x00);
}

#[test]
fn test_reset_clears_slot_registers_but_keeps_mappings() {
    let mut bus = Bus::new();
    bus.set_expanded(3);
    let ram = bus.add_device(Box::new(Ram::new("ram", 0x0000, 0x4000)));
    bus.register_mem_device(ram, 3, 1, 0x0000, 0x4000).unwrap();

    // slot 3 in pages 0 and 3, then secondary 1 for page 0
    bus.set_primary_slot_config(0b11_00_00_11);
    bus.write_byte(0xFFFF, 0b00_00_00_01);
    bus.write_byte(0x0000, 0x21);
    assert_eq!(bus.read_byte(0x0000), 0x21);

    bus.reset();
    assert_eq!(bus.primary_slot_config(), 0x00);
    assert_eq!(bus.sub_slot_register(3), 0x00);

    // the mapping survives, but secondary 0 is selected again
    bus.set_primary_slot_config(0b00_00_00_11);
    assert_eq!(bus.read_byte(0x0000), 0xFF);
}
