//! Byte-level transports to the controller board.

mod context;
mod mock;
mod usb;

pub use mock::MockConnection;
pub use usb::UsbConnection;

use std::io;

use crate::codec;
use crate::consts::{READ_PORT, REPLY_SIZE};

/// A byte-level channel to one or more LMC boards, addressed by machine
/// index. Commands are 12-byte writes; realtime replies are 8-byte reads.
pub trait Connection: Send {
    fn open(&mut self, machine: usize) -> io::Result<()>;

    fn close(&mut self, machine: usize);

    fn is_open(&self, machine: usize) -> bool;

    fn write(&mut self, machine: usize, data: &[u8]) -> io::Result<()>;

    fn read(&mut self, machine: usize) -> io::Result<[u8; REPLY_SIZE]>;

    /// Issue `ReadPort` and return the reply words; word 1 carries the
    /// input GPIO mask.
    fn read_port(&mut self, machine: usize) -> io::Result<[u16; 4]> {
        self.write(machine, &codec::command(READ_PORT, [0; 5]))?;
        let raw = self.read(machine)?;
        Ok(codec::reply_words(&raw))
    }

    /// Whether the transport has been torn down behind our back.
    fn is_shutdown(&self) -> bool {
        false
    }
}
