//! Serial port backend: configuration, opening, enumeration

use super::{SerialLink, TransportError};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl SerialParity {
    /// Single-letter code (N/O/E)
    pub fn code(self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
        }
    }
}

impl std::str::FromStr for SerialParity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(TransportError::InvalidConfiguration(format!("unknown parity '{other}'"))),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Default read timeout in milliseconds
    pub timeout_ms: u64,
}

impl SerialConfig {
    /// Create a new serial configuration with 8N1 and a 500 ms timeout
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            timeout_ms: 500,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set default read timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Default read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject settings the hardware layer cannot express
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.trim().is_empty() {
            return Err(TransportError::InvalidConfiguration("empty port path".into()));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::InvalidConfiguration("baud rate must be positive".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "unsupported data bits {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "unsupported stop bits {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    /// Short description, e.g. `/dev/ttyUSB0 @ 9600 baud (8N1)`
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.port,
            self.baud_rate,
            self.data_bits,
            self.parity.code(),
            self.stop_bits
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115_200)
    }
}

/// Enumerated serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Device path
    pub device: String,
    /// Short name (last path component)
    pub name: String,
    /// Human description (USB product string, port kind otherwise)
    pub description: String,
    /// Hardware id (VID:PID and serial for USB)
    pub hwid: String,
    /// Manufacturer if known
    pub manufacturer: String,
}

impl PortInfo {
    fn from_serialport(info: serialport::SerialPortInfo) -> Self {
        let name = info
            .port_name
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(&info.port_name)
            .to_string();
        let (description, hwid, manufacturer) = match info.port_type {
            SerialPortType::UsbPort(usb) => (
                usb.product.clone().unwrap_or_else(|| "USB Serial".to_string()),
                format!(
                    "USB VID:PID={:04X}:{:04X} SER={}",
                    usb.vid,
                    usb.pid,
                    usb.serial_number.as_deref().unwrap_or("")
                ),
                usb.manufacturer.unwrap_or_else(|| "Unknown".to_string()),
            ),
            SerialPortType::PciPort => ("PCI".to_string(), "PCI".to_string(), "Unknown".to_string()),
            SerialPortType::BluetoothPort => (
                "Bluetooth".to_string(),
                "BLUETOOTH".to_string(),
                "Unknown".to_string(),
            ),
            SerialPortType::Unknown => ("n/a".to_string(), "n/a".to_string(), "Unknown".to_string()),
        };
        Self {
            device: info.port_name,
            name,
            description,
            hwid,
            manufacturer,
        }
    }
}

/// Pick the most likely USB-serial bridge, else the first port.
///
/// Keywords are matched case-insensitively against description and hwid.
pub fn pick_port<S: AsRef<str>>(ports: &[PortInfo], keywords: &[S]) -> Option<String> {
    let bridge = ports.iter().find(|port| {
        let description = port.description.to_lowercase();
        let hwid = port.hwid.to_lowercase();
        keywords.iter().any(|k| {
            let k = k.as_ref().to_lowercase();
            description.contains(&k) || hwid.contains(&k)
        })
    });
    bridge.or_else(|| ports.first()).map(|p| p.device.clone())
}

/// Source of device links; the seam between the connection registry and hardware
pub trait PortBackend: Send + Sync {
    /// Open a link with the given settings
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>, TransportError>;

    /// Enumerate available ports
    fn list(&self) -> Result<Vec<PortInfo>, TransportError>;
}

/// Real hardware via the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortBackend for SystemPorts {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>, TransportError> {
        config.validate()?;

        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout())
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(config.port.clone()),
                serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                    TransportError::PortNotFound(config.port.clone())
                }
                serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        Ok(Box::new(PortLink { port: Some(port) }))
    }

    fn list(&self) -> Result<Vec<PortInfo>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::IoError(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(ports.into_iter().map(PortInfo::from_serialport).collect())
    }
}

/// `SerialLink` over an open `serialport` handle
struct PortLink {
    port: Option<Box<dyn SerialPort>>,
}

impl PortLink {
    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl SerialLink for PortLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn close(&mut self) {
        self.port = None;
    }
}
