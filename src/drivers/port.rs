// src/drivers/port.rs
use std::io::{self, Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use serialport::{SerialPort, SerialPortType};

/// Port enumeration, open and release all go through this lock so two readers
/// never race for the same device. Scans themselves run outside of it.
static PORT_TABLE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// A byte link to one sweep board.
pub trait Link: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Link for T {}

/// Knows how to (re)open the link to one physical device.
pub trait PortOpener: Send {
    type Link: Link;
    fn open(&mut self) -> io::Result<Self::Link>;
    /// Called before a link is dropped so the release is serialized too.
    fn release(&mut self, link: Self::Link) {
        drop(link);
    }
    fn describe(&self) -> String;
}

/// Opens the USB serial port whose device serial number matches.
pub struct SerialOpener {
    serial_number: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialOpener {
    pub fn new(serial_number: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            serial_number: serial_number.into(),
            baud_rate,
            timeout,
        }
    }
}

fn lock_table() -> std::sync::MutexGuard<'static, ()> {
    // A poisoned lock only means another reader panicked while holding it; the
    // table itself carries no data.
    PORT_TABLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve the system port name for a device serial number.
pub fn find_port_by_serial(serial_number: &str) -> io::Result<String> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    ports
        .into_iter()
        .find(|p| match &p.port_type {
            SerialPortType::UsbPort(info) => info.serial_number.as_deref() == Some(serial_number),
            _ => false,
        })
        .map(|p| p.port_name)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no serial port with serial number {serial_number}"),
            )
        })
}

/// Serial numbers of every USB serial device currently attached.
pub fn list_device_serials() -> io::Result<Vec<String>> {
    let _guard = lock_table();
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    Ok(ports
        .into_iter()
        .filter_map(|p| match p.port_type {
            SerialPortType::UsbPort(info) => info.serial_number,
            _ => None,
        })
        .collect())
}

impl PortOpener for SerialOpener {
    type Link = Box<dyn SerialPort>;

    fn open(&mut self) -> io::Result<Self::Link> {
        let _guard = lock_table();
        let port_name = find_port_by_serial(&self.serial_number)?;
        log::debug!("opening {} for device {}", port_name, self.serial_number);
        serialport::new(&port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(io::Error::from)
    }

    fn release(&mut self, link: Self::Link) {
        let _guard = lock_table();
        drop(link);
    }

    fn describe(&self) -> String {
        format!("serial device {}", self.serial_number)
    }
}
