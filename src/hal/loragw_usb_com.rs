use std::{io::{self, Read, Write}, time::Duration};

use serialport::{FlowControl, Parity, SerialPort, StopBits};

use tracing::trace;
use anyhow::Result;

const LGW_USB_BAUDRATE: u32 = 115200;
const LGW_USB_TIMEOUT_MS: u64 = 5000;

#[derive(Default)]
pub struct UsbComPort {
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for UsbComPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbComPort")
            .field("open", &self.port.is_some())
            .finish()
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Port not open")
}

impl UsbComPort {
    pub fn new() -> Self {
        Self { port: None }
    }

    pub fn open(&mut self, port_name: &str) -> Result<()> {
        let port = serialport::new(port_name, LGW_USB_BAUDRATE)
            .flow_control(FlowControl::None)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(LGW_USB_TIMEOUT_MS))
            .open()?;

        self.port = Some(port);
        Ok(())
    }

    pub fn close(&mut self) {
        self.port = None;
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        trace!(size=%data.len(), "WR: {:02X?}", data);

        match self.port.as_mut() {
            Some(port) => port.write(data),
            None => Err(not_open()),
        }
    }

    pub fn read_exact(&mut self, data: &mut [u8]) -> Result<(), io::Error> {
        match self.port.as_mut() {
            Some(port) => port.read_exact(data)?,
            None => return Err(not_open()),
        }

        trace!("RD: {:02X?}", data);
        Ok(())
    }
}
