//! In-memory transport recording all traffic, for tests and dry runs.

use std::io;
use std::sync::{Arc, Mutex};

use log::trace;

use super::Connection;
#[cfg(test)]
use crate::codec;
use crate::consts::{COMMAND_SIZE, LIST_PACKET_SIZE, REPLY_SIZE, STATUS_READY, list_command_name};

#[derive(Default)]
struct MockState {
    open: bool,
    writes: Vec<Vec<u8>>,
    input_bits: u16,
    shutdown: bool,
}

/// Always-available [`Connection`] that records every write and answers
/// reads with a READY status. Clones share the recorded traffic, so tests
/// keep a handle while the controller owns another.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write issued so far, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    /// The 12-byte realtime commands, decoded to six words each.
    pub fn commands(&self) -> Vec<[u16; 6]> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.len() == COMMAND_SIZE)
            .map(|w| decode_word(w))
            .collect()
    }

    /// Every list word from every full 0xC00 packet sent, in order,
    /// including the NOP fill.
    pub fn list_words(&self) -> Vec<[u16; 6]> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.len() == LIST_PACKET_SIZE)
            .flat_map(|packet| {
                packet
                    .chunks_exact(COMMAND_SIZE)
                    .map(decode_word)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Only the full list packets.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.len() == LIST_PACKET_SIZE)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Input GPIO mask reported by `read_port`.
    pub fn set_input_bits(&self, bits: u16) {
        self.state.lock().unwrap().input_bits = bits;
    }

    pub fn set_shutdown(&self, shutdown: bool) {
        self.state.lock().unwrap().shutdown = shutdown;
    }
}

fn decode_word(raw: &[u8]) -> [u16; 6] {
    let mut words = [0u16; 6];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
    }
    words
}

impl Connection for MockConnection {
    fn open(&mut self, _machine: usize) -> io::Result<()> {
        self.state.lock().unwrap().open = true;
        Ok(())
    }

    fn close(&mut self, _machine: usize) {
        self.state.lock().unwrap().open = false;
    }

    fn is_open(&self, _machine: usize) -> bool {
        self.state.lock().unwrap().open
    }

    fn write(&mut self, _machine: usize, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        if data.len() == COMMAND_SIZE {
            let word = decode_word(data);
            trace!("mock write {} {:04x?}", list_command_name(word[0]), word);
        } else {
            trace!("mock write packet of {} bytes", data.len());
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, _machine: usize) -> io::Result<[u8; REPLY_SIZE]> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        let mut raw = [0u8; REPLY_SIZE];
        raw[6..8].copy_from_slice(&STATUS_READY.to_le_bytes());
        Ok(raw)
    }

    fn read_port(&mut self, _machine: usize) -> io::Result<[u16; 4]> {
        let state = self.state.lock().unwrap();
        Ok([0, state.input_bits, 0, STATUS_READY])
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::GET_VERSION;

    #[test]
    fn records_writes_and_reports_ready() {
        let mut mock = MockConnection::new();
        let observer = mock.clone();
        mock.open(0).unwrap();
        mock.write(0, &codec::command(GET_VERSION, [0; 5])).unwrap();
        let reply = codec::reply_words(&mock.read(0).unwrap());
        assert_eq!(reply[3] & STATUS_READY, STATUS_READY);
        assert_eq!(observer.commands(), vec![[GET_VERSION, 0, 0, 0, 0, 0]]);
    }

    #[test]
    fn closed_mock_refuses_io() {
        let mut mock = MockConnection::new();
        assert!(mock.write(0, &[0; 12]).is_err());
        assert!(mock.read(0).is_err());
    }
}
