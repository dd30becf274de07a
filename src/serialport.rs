//! Synchronous client over a local serial port.
//!
//! ```no_run
//! use jbdbms_lib::serialport::SerialJbdBms;
//! use std::time::Duration;
//!
//! let mut bms = SerialJbdBms::open("/dev/ttyUSB0", 9600)?;
//! bms.set_timeout(Duration::from_millis(500))?;
//! // RS-485 adapter with DE/!RE wired to RTS
//! bms.use_rts_direction(false)?;
//!
//! let status = bms.get_status()?;
//! println!("Voltage: {:.2}V balance: {}", status.voltage as f32 / 100.0, status.balance());
//! # Ok::<(), jbdbms_lib::Error>(())
//! ```

use crate::engine::{DirectionControl, Transport};
use crate::{Error, JbdBms};
use serialport::SerialPort;
use std::io::{self, Read};
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

pub type SerialJbdBms = JbdBms<Box<dyn SerialPort>>;

impl Transport for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self.bytes_to_read()?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self.read(buf.as_mut_slice())?;
                log::trace!("Read {} pending bytes", received);
            } else {
                break;
            }
        }
        Ok(())
    }
}

/// Switches an RS-485 transceiver through the RTS line of the port.
#[derive(Debug)]
pub struct RtsDirection {
    port: Box<dyn SerialPort>,
    inverted: bool,
}

impl RtsDirection {
    pub fn new(port: Box<dyn SerialPort>, inverted: bool) -> Self {
        Self { port, inverted }
    }
}

impl DirectionControl for RtsDirection {
    fn set_transmit(&mut self, transmit: bool) -> io::Result<()> {
        self.port
            .write_request_to_send(transmit != self.inverted)
            .map_err(io::Error::from)
    }
}

impl JbdBms<Box<dyn SerialPort>> {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, Error> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(io::Error::from)?;
        log::debug!("Opened serial port '{port}' with {baud_rate} baud");
        Ok(Self::new(serial))
    }

    /// Sets how long a read may block, the protocol itself has no timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        log::trace!("set timeout to {timeout:?}");
        self.transport_mut()
            .set_timeout(timeout)
            .map_err(io::Error::from)?;
        Ok(())
    }

    /// Drives the transceiver direction with RTS, high while transmitting
    /// unless `inverted`.
    pub fn use_rts_direction(&mut self, inverted: bool) -> Result<(), Error> {
        let port = self.transport_mut().try_clone().map_err(io::Error::from)?;
        self.set_direction_control(RtsDirection::new(port, inverted))
    }
}
