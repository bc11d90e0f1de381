use super::*;
use lockstep_config::{BusWidth, CoreConfig, Endianness};
use lockstep_core::{HandlerId, Machine, MachineBuilder, RegionKind, SpaceConfig};
use test_log::test;

const COP_BASE: u32 = 0x40000;

struct Host {
    machine: Machine,
    space: SpaceId,
    cop: HandlerId,
}

impl Host {
    fn new() -> Self {
        let mut builder = MachineBuilder::new(CoreConfig::default());
        let space =
            builder.add_space(SpaceConfig::new("main", 20, BusWidth::Bits16, Endianness::Little));
        let ram = builder.add_region("ram", RegionKind::Ram, vec![0; 0x40000]);
        builder.map(space, 0x00000, 0x3ffff).ram(ram);

        let cop = builder.add_handler("cop", CopDma::new(space, BufferSink::new()));
        builder.map(space, COP_BASE, COP_BASE + 0x1f).read_write(cop);

        Self { machine: builder.build().unwrap(), space, cop }
    }

    fn set(&mut self, register: u32, value: u16) {
        self.machine.write(self.space, COP_BASE + 2 * register, BusWidth::Bits16, value.into());
    }

    fn register(&mut self, register: u32) -> u16 {
        self.machine.read(self.space, COP_BASE + 2 * register, BusWidth::Bits16) as u16
    }

    fn poke(&mut self, address: u32, value: u16) {
        self.machine.write(self.space, address, BusWidth::Bits16, value.into());
    }

    fn peek(&mut self, address: u32) -> u16 {
        self.machine.read(self.space, address, BusWidth::Bits16) as u16
    }

    fn peek_words(&mut self, address: u32, count: u32) -> Vec<u16> {
        (0..count).map(|i| self.peek(address + 2 * i)).collect()
    }

    fn cop(&self) -> &CopDma<BufferSink> {
        self.machine.board().handler::<CopDma<BufferSink>>(self.cop).unwrap()
    }

    fn select_channel(&mut self, channel: u16, source: u16, size: u16, destination: u16) {
        self.set(0, channel);
        self.set(1, source);
        self.set(2, size);
        self.set(3, destination);
    }
}

fn sort_host(order: u16) -> Host {
    let mut host = Host::new();

    // Table of offsets into the key area
    for (i, offset) in [0, 2, 4, 6].into_iter().enumerate() {
        host.poke(0x1000 + 2 * i as u32, offset);
    }
    for (i, key) in [3, 1, 4, 2].into_iter().enumerate() {
        host.poke(0x2000 + 2 * i as u32, key);
    }

    host.set(9, 0x0000);
    host.set(10, 0x1000);
    host.set(11, 0x0000);
    host.set(12, 0x2000);
    host.set(13, order);
    host.set(14, 4);

    host
}

#[test]
fn sort_descending_by_key() {
    let mut host = sort_host(1);
    assert_eq!(host.peek_words(0x1000, 4), vec![4, 0, 6, 2]);
    // Keys are not moved
    assert_eq!(host.peek_words(0x2000, 4), vec![3, 1, 4, 2]);
}

#[test]
fn sort_ascending_by_key() {
    let mut host = sort_host(2);
    assert_eq!(host.peek_words(0x1000, 4), vec![2, 6, 0, 4]);
}

#[test]
fn sort_with_unknown_order_leaves_table() {
    let mut host = sort_host(0);
    assert_eq!(host.peek_words(0x1000, 4), vec![0, 2, 4, 6]);
}

#[test]
fn sort_keeps_equal_keys_in_table_order() {
    let mut host = Host::new();
    for (i, offset) in [0, 2, 4].into_iter().enumerate() {
        host.poke(0x1000 + 2 * i as u32, offset);
    }
    for (i, key) in [5, 9, 5].into_iter().enumerate() {
        host.poke(0x2000 + 2 * i as u32, key);
    }

    host.set(10, 0x1000);
    host.set(12, 0x2000);
    host.set(13, 2);
    host.set(14, 3);

    assert_eq!(host.peek_words(0x1000, 3), vec![0, 4, 2]);
}

#[test]
fn fill_writes_pattern() {
    let mut host = Host::new();
    host.set(7, 0xbeef);
    host.set(8, 0xdead);
    host.select_channel(0x009, 0x3000 >> 6, 0, 0);
    host.set(15, 1);

    // (size + 1) * 8 dwords
    let expected: Vec<u16> = [0xbeef, 0xdead].repeat(8);
    assert_eq!(host.peek_words(0x3000, 16), expected);
    assert_eq!(host.peek(0x3020), 0);
    assert_eq!(host.cop().state(), CopState::Idle);
}

#[test]
fn fill_skipped_when_destination_register_set() {
    let mut host = Host::new();
    host.set(7, 0xbeef);
    host.set(8, 0xdead);
    host.select_channel(0x116, 0x3000 >> 6, 0, 1);
    host.set(15, 1);

    assert_eq!(host.peek_words(0x3000, 4), vec![0; 4]);
}

#[test]
fn tilemap_source_quirk() {
    let mut host = Host::new();
    host.poke(0xcfc0, 0x9999);
    host.poke(0xd000, 0x1234);
    host.poke(0xd002, 0x5678);
    host.select_channel(0x014, 0xcfc0 >> 6, 0, 0);
    host.set(15, 1);

    let tilemap = host.cop().sink().tilemap();
    assert_eq!(&tilemap[..2], &[0x1234, 0x5678]);
}

#[test]
fn palette_copies_to_sink() {
    let mut host = Host::new();
    host.poke(0x8000, 0x7fff);
    host.poke(0x8002, 0x001f);
    host.poke(0x8000 + 2 * (PALETTE_WORDS as u32 - 1), 0x03e0);
    host.select_channel(0x015, 0x8000 >> 6, 0, 0);
    host.set(15, 1);

    let palette = host.cop().sink().palette();
    assert_eq!(&palette[..2], &[0x7fff, 0x001f]);
    assert_eq!(palette[PALETTE_WORDS - 1], 0x03e0);
}

fn brightness_host(mode: u16, value: u16) -> Host {
    let mut host = Host::new();
    host.poke(0x4000, 0x1234);
    host.poke(0x4400, 0x7fff);
    host.poke(0x4002, 0x8123);
    host.poke(0x4402, 0x7fff);
    host.poke(0x4004, 0x0421);
    host.poke(0x4404, 0x0000);

    host.set(4, 1);
    host.set(5, value);
    host.set(6, mode);
    host.select_channel(0x080, 0x4000 >> 6, 0x100, 0x80);
    host.set(15, 1);

    host
}

#[test]
fn brightness_mode_5_endpoints() {
    let mut host = brightness_host(5, 0);
    assert_eq!(host.peek_words(0x2000, 3), vec![0x1234, 0x8123, 0x0421]);

    let mut host = brightness_host(5, 0x1f);
    assert_eq!(host.peek_words(0x2000, 3), vec![0x7fff, 0x8123, 0x0000]);
}

#[test]
fn brightness_transfer_length() {
    let mut host = Host::new();
    for i in 0..0x20 {
        host.poke(0x4000 + 2 * i, 0x0001);
    }
    host.set(6, 5);
    host.select_channel(0x083, 0x4000 >> 6, 0x100, 0x80);
    host.set(15, 1);

    let expected: Vec<u16> = [vec![0x0001; 16], vec![0]].concat();
    assert_eq!(host.peek_words(0x2000, 17), expected);
}

#[test]
fn brightness_with_negative_count_is_skipped() {
    let mut host = Host::new();
    host.poke(0x4000, 0x1234);
    host.poke(0x2400, 0xaaaa);
    host.set(6, 5);
    host.select_channel(0x080, 0x4000 >> 6, 0x100, 0x90);
    host.set(15, 1);

    assert_eq!(host.peek(0x2400), 0xaaaa);
    assert_eq!(host.cop().state(), CopState::Idle);
}

#[test]
fn brightness_mode_4_endpoints() {
    let mut host = brightness_host(4, 0x10);
    assert_eq!(host.peek_words(0x2000, 3), vec![0x7fff, 0x7fff, 0x0000]);

    // No bit 15 passthrough in this mode
    let mut host = brightness_host(4, 0);
    assert_eq!(host.peek_words(0x2000, 3), vec![0x1234, 0x0123, 0x0421]);
}

#[test]
fn unsupported_brightness_mode_copies_raw() {
    let mut host = brightness_host(3, 0x1f);
    assert_eq!(host.peek_words(0x2000, 3), vec![0x1234, 0x8123, 0x0421]);
}

#[test]
fn brightness_length_never_negative() {
    assert_eq!(brightness_length(0x100, 0x80), Some(16));
    assert_eq!(brightness_length(0, 0), Some(16));
    assert_eq!(brightness_length(0x100, 0x100), None);
    assert_eq!(brightness_length(0x100, 0x81), None);
    assert_eq!(brightness_length(0x102, 0x81), Some(16));
}

#[test]
fn fade_table_identity_at_full_weight() {
    for c in 0..32 {
        assert_eq!(fade_table((c << 5) | 0x1f), c);
        assert_eq!(fade_table(c << 5), 0);
    }
}

#[test]
fn unknown_channel_is_ignored() {
    let mut host = Host::new();
    host.poke(0x3000, 0x5555);
    host.select_channel(0x123, 0x3000 >> 6, 0, 0);
    host.set(15, 1);

    assert_eq!(host.peek(0x3000), 0x5555);
    assert_eq!(host.cop().state(), CopState::Idle);
}

#[test]
fn registers_are_per_channel_and_readable() {
    let mut host = Host::new();
    host.select_channel(0x014, 0x0111, 0x0222, 0x0333);
    host.select_channel(0x015, 0x0444, 0x0555, 0x0666);
    host.set(10, 0xabcd);
    host.set(9, 0x0001);

    host.set(0, 0x014);
    assert_eq!((host.register(1), host.register(2), host.register(3)), (0x0111, 0x0222, 0x0333));
    assert_eq!(host.cop().registers().channel_registers(0x015), (0x0444, 0x0555, 0x0666));
    assert_eq!(host.cop().registers().sort_lookup, 0x1abcd);
}

#[test]
fn registers_and_buffers_survive_save_state() {
    let mut host = Host::new();
    host.poke(0x8000, 0x4321);
    host.select_channel(0x015, 0x8000 >> 6, 0, 0);
    host.set(15, 1);
    host.set(5, 0x0012);

    let state = host.machine.save_state().unwrap();

    let mut fresh = Host::new();
    let report = fresh.machine.load_state(&state).unwrap();
    assert!(report.is_clean(), "{report}");

    assert_eq!(fresh.cop().registers(), host.cop().registers());
    assert_eq!(fresh.cop().sink().palette()[0], 0x4321);
    assert_eq!(fresh.register(5), 0x0012);
}

#[test]
fn reset_clears_registers_and_buffers() {
    let mut host = Host::new();
    host.poke(0x8000, 0x4321);
    host.select_channel(0x015, 0x8000 >> 6, 0, 0);
    host.set(15, 1);

    host.machine.reset();

    assert_eq!(host.cop().registers().channel, 0);
    assert_eq!(host.cop().sink().palette()[0], 0);
}
