//! USB transport for BJJCZ LMC boards.

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libusb1_sys as libusb;
use log::{debug, info, warn};

use super::Connection;
use super::context::{
    LibusbContext, LibusbDeviceHandle, get_device_descriptor, map_libusb_error,
    read_string_descriptor,
};
use crate::consts::REPLY_SIZE;

pub const LMC_VENDOR_ID: u16 = 0x9588;
pub const LMC_PRODUCT_ID: u16 = 0x9899;

const LMC_INTERFACE: i32 = 0;
const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x88;
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// libusb-backed [`Connection`]. Boards are addressed by enumeration
/// order: machine index n is the nth device matching the LMC VID/PID.
pub struct UsbConnection {
    context: Arc<LibusbContext>,
    handles: HashMap<usize, LibusbDeviceHandle>,
}

impl UsbConnection {
    pub fn new() -> io::Result<Self> {
        Ok(UsbConnection {
            context: LibusbContext::new()?,
            handles: HashMap::new(),
        })
    }

    /// Walk the device list and open the nth LMC board.
    fn open_machine(&self, machine: usize) -> io::Result<LibusbDeviceHandle> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(self.context.ptr.0, &mut list) };
        if count < 0 {
            return Err(map_libusb_error(count as i32));
        }

        let mut result: Option<io::Result<LibusbDeviceHandle>> = None;
        let mut index = 0usize;

        for i in 0..count {
            let device = unsafe { *list.add(i as usize) };
            let desc = match get_device_descriptor(device) {
                Ok(d) => d,
                Err(e) => {
                    result = Some(Err(e));
                    break;
                }
            };

            if desc.idVendor != LMC_VENDOR_ID || desc.idProduct != LMC_PRODUCT_ID {
                continue;
            }
            if index != machine {
                index += 1;
                continue;
            }

            result = Some(LibusbDeviceHandle::open(self.context.clone(), device));
            break;
        }

        unsafe {
            libusb::libusb_free_device_list(list, 1);
        }

        let handle = result.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no LMC board found for machine index {machine}"),
            )
        })??;

        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(LMC_INTERFACE)?;

        if let Some(serial) = read_string_descriptor(&handle, 3) {
            info!("opened LMC board {machine} (serial {serial})");
        } else {
            info!("opened LMC board {machine}");
        }
        Ok(handle)
    }
}

impl Connection for UsbConnection {
    fn open(&mut self, machine: usize) -> io::Result<()> {
        if self.handles.contains_key(&machine) {
            return Ok(());
        }
        let handle = self.open_machine(machine).map_err(|e| {
            debug!("open of machine {machine} failed: {e}");
            io::Error::new(io::ErrorKind::ConnectionRefused, e)
        })?;
        self.handles.insert(machine, handle);
        Ok(())
    }

    fn close(&mut self, machine: usize) {
        if let Some(handle) = self.handles.remove(&machine) {
            handle.release_interface(LMC_INTERFACE);
        }
    }

    fn is_open(&self, machine: usize) -> bool {
        self.handles.contains_key(&machine)
    }

    fn write(&mut self, machine: usize, data: &[u8]) -> io::Result<()> {
        let handle = self
            .handles
            .get(&machine)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "machine not open"))?;
        let written = handle.bulk_write_blocking(EP_OUT, data, WRITE_TIMEOUT)?;
        if written != data.len() {
            warn!("short bulk write: {written} of {} bytes", data.len());
            return Err(io::Error::other("short bulk write"));
        }
        Ok(())
    }

    fn read(&mut self, machine: usize) -> io::Result<[u8; REPLY_SIZE]> {
        let handle = self
            .handles
            .get(&machine)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "machine not open"))?;
        let mut buf = [0u8; REPLY_SIZE];
        let received = handle.bulk_read_blocking(EP_IN, &mut buf, READ_TIMEOUT)?;
        if received != REPLY_SIZE {
            warn!("short bulk read: {received} of {REPLY_SIZE} bytes");
            return Err(io::Error::other("short bulk read"));
        }
        Ok(buf)
    }
}
