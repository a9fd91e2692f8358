//! An in-process stand-in for the device: a ROM and RAM in owned memory, and
//! a peer that consumes the command and cursor rings and hands records back
//! through the release ring the way the device does.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use qxl_core::layout::{ram, ring_header, rom, Command, RELEASE_INFO};
use qxl_core::layout::{
    COMMAND_RING_CAPACITY, CURSOR_RING_CAPACITY, LEGACY_MODE, RAM_MAGIC, RELEASE_RING_CAPACITY,
    ROM_MAGIC,
};
use qxl_core::release::TAG_MASK;
use qxl_core::{
    AddressMap, DeviceIo, IoCommand, Ring, Rom, Session, SessionConfig, ShmRegion,
};

pub const PAGE_SIZE: usize = 4096;
pub const RAM_HEADER: usize = 0;
pub const PAGES_OFFSET: usize = 2 * PAGE_SIZE;
pub const PHYSICAL_BASE: u64 = 0xe000_0000;

pub struct Peer {
    ram: ShmRegion,
    map: AddressMap,
    commands: Ring<Command>,
    cursor: Ring<Command>,
    release: Ring<u64>,
    // Raw release ids of consumed records, not yet handed back.
    done: Vec<u64>,
    pub received: Vec<Command>,
    pub cursor_received: Vec<Command>,
    pub io: Vec<IoCommand>,
    /// Hand everything back when told memory is short.
    pub release_on_oom: bool,
    /// Records per release list.
    pub batch: usize,
}

impl Peer {
    fn new(ram: ShmRegion) -> Peer {
        let commands =
            Ring::attach(ram.clone(), RAM_HEADER + ram::COMMAND_RING, COMMAND_RING_CAPACITY)
                .unwrap();
        let cursor =
            Ring::attach(ram.clone(), RAM_HEADER + ram::CURSOR_RING, CURSOR_RING_CAPACITY)
                .unwrap();
        let release =
            Ring::attach(ram.clone(), RAM_HEADER + ram::RELEASE_RING, RELEASE_RING_CAPACITY)
                .unwrap();
        Peer {
            map: AddressMap::new(PHYSICAL_BASE, ram.len()),
            ram,
            commands,
            cursor,
            release,
            done: Vec::new(),
            received: Vec::new(),
            cursor_received: Vec::new(),
            io: Vec::new(),
            release_on_oom: false,
            batch: 4,
        }
    }

    fn consume(&mut self, command: Command) {
        let offset = self.map.to_offset(command.data).unwrap();
        let id = self.ram.read_u64(offset + RELEASE_INFO).unwrap();
        self.done.push(id);
    }

    // Ask for a notification on the next push.
    fn rearm(&self, header: usize, ring: &Ring<Command>) {
        let next = ring.producer().unwrap().wrapping_add(1);
        self.ram
            .store_u32(header + ring_header::NOTIFY_ON_PROD, next, Ordering::Release)
            .unwrap();
    }

    /// Consume everything on the command and cursor rings.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Some(command) = self.commands.pop().unwrap() {
            self.consume(command);
            self.received.push(command);
            n += 1;
        }
        while let Some(command) = self.cursor.pop().unwrap() {
            self.consume(command);
            self.cursor_received.push(command);
            n += 1;
        }
        self.rearm(RAM_HEADER + ram::COMMAND_RING, &self.commands);
        self.rearm(RAM_HEADER + ram::CURSOR_RING, &self.cursor);
        n
    }

    /// Hand consumed records back, as many lists as the release ring takes.
    /// Returns the number of records released.
    pub fn release(&mut self) -> usize {
        let mut n = 0;
        while !self.done.is_empty() && !self.release.is_full().unwrap() {
            let take = self.batch.max(1).min(self.done.len());
            let list: Vec<u64> = self.done.drain(..take).collect();
            for pair in list.windows(2) {
                let offset = self.map.to_offset(pair[0] & !TAG_MASK).unwrap();
                self.ram.write_u64(offset + RELEASE_INFO, pair[1]).unwrap();
            }
            let last = self.map.to_offset(list[take - 1] & !TAG_MASK).unwrap();
            self.ram.write_u64(last + RELEASE_INFO, 0).unwrap();
            self.release.push(&list[0]).unwrap();
            n += take;
        }
        n
    }

    /// Post a raw id on the release ring, as a misbehaving device might.
    pub fn post(&mut self, raw: u64) {
        self.release.push(&raw).unwrap();
    }

    pub fn process(&mut self) -> usize {
        self.drain();
        self.release()
    }

    pub fn pending(&self) -> usize {
        self.done.len()
    }

    pub fn count(&self, wanted: IoCommand) -> usize {
        self.io.iter().filter(|&&c| c == wanted).count()
    }
}

pub struct SimIo {
    peer: Rc<RefCell<Peer>>,
}

impl DeviceIo for SimIo {
    fn send(&mut self, command: IoCommand) {
        let mut peer = self.peer.borrow_mut();
        peer.io.push(command);
        match command {
            IoCommand::OutOfMemory if peer.release_on_oom => {
                peer.process();
            }
            // The device forgets everything on reset.
            IoCommand::Reset => peer.done.clear(),
            _ => {}
        }
    }
}

pub struct SimDevice {
    pub rom: ShmRegion,
    pub ram: ShmRegion,
    pub peer: Rc<RefCell<Peer>>,
}

impl SimDevice {
    /// A device with `num_io_pages` pages of pool memory.
    pub fn new(num_io_pages: usize) -> SimDevice {
        let rom_shm = ShmRegion::new(rom::SIZE);
        rom_shm.write_u32(rom::MAGIC, ROM_MAGIC).unwrap();
        rom_shm.write_u32(rom::MODE, 0).unwrap();
        rom_shm.write_u32(rom::RAM_HEADER_OFFSET, RAM_HEADER as u32).unwrap();
        rom_shm.write_u32(rom::PAGES_OFFSET, PAGES_OFFSET as u32).unwrap();
        rom_shm.write_u32(rom::NUM_IO_PAGES, num_io_pages as u32).unwrap();
        rom_shm.write_u32(rom::MM_CLOCK, 1234).unwrap();

        let ram_shm = ShmRegion::new(PAGES_OFFSET + num_io_pages * PAGE_SIZE);
        ram_shm.write_u32(RAM_HEADER + ram::MAGIC, RAM_MAGIC).unwrap();

        SimDevice {
            peer: Rc::new(RefCell::new(Peer::new(ram_shm.clone()))),
            rom: rom_shm,
            ram: ram_shm,
        }
    }

    pub fn config() -> SessionConfig {
        SessionConfig::default()
            .with_ram_physical_base(PHYSICAL_BASE)
            .with_page_size(PAGE_SIZE)
    }

    pub fn open(&self, config: SessionConfig) -> Session<SimIo> {
        let rom = Rom::open(self.rom.clone()).unwrap();
        let io = SimIo {
            peer: self.peer.clone(),
        };
        Session::open(self.ram.clone(), rom, io, config).unwrap()
    }

    pub fn set_legacy_mode(&self, legacy: bool) {
        let mode = if legacy { LEGACY_MODE } else { 0 };
        self.rom.store_u32(rom::MODE, mode, Ordering::Release).unwrap();
    }
}
