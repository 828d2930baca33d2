use serialport::{SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::thread;

use crate::board_terminal::{BoardTerminal, BoardTerminalError, SerialLinkConfig};
use crate::serial_board::SerialBoard;

/// USB vendor/product pairs the bridge firmware enumerates with.
const KNOWN_USB_IDS: [(u16, u16); 2] = [(0x1b4f, 0x0041), (0x1b4f, 0x0042)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDevice {
    pub name: String,
    pub port: String,
}

impl BoardDevice {
    pub fn new(name: String, port: String) -> Self {
        Self { name, port }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardConnectorError {
    #[error("Board terminal error: {0}")]
    Terminal(#[from] BoardTerminalError),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Port {port} is not a IOIO board")]
    InvalidPort { port: String },

    #[error("No IOIO board found. Please connect a board or specify the port manually")]
    DeviceNotFound,

    #[error("Board on {port} did not answer after {attempts} attempt(s)")]
    NotResponding { port: String, attempts: u32 },
}

pub struct BoardConnector;

impl BoardConnector {
    /// Open the board on `port`, or on the first discovered board.
    pub fn connect(
        port: Option<&str>,
        config: &SerialLinkConfig,
    ) -> Result<SerialBoard<Box<dyn SerialPort>>, BoardConnectorError> {
        let port = match port {
            Some(port) => {
                log::debug!("Connecting to board on port {}", port);
                Self::validate_port(port)?;
                port.to_string()
            }
            None => Self::get_device_port()?,
        };

        let terminal = Self::get_working_terminal(&port, config)?;
        log::info!("Board ready on {}", port);
        Ok(SerialBoard::new(terminal))
    }

    /// Validate that a given port belongs to a known board
    fn validate_port(port: &str) -> Result<(), BoardConnectorError> {
        let devices = Self::get_available_devices()?;

        if !devices.iter().any(|d| d.port == port) {
            return Err(BoardConnectorError::InvalidPort {
                port: port.to_string(),
            });
        }

        Ok(())
    }

    fn is_known_device(port_type: &SerialPortType) -> Option<String> {
        let SerialPortType::UsbPort(info) = port_type else {
            return None;
        };

        KNOWN_USB_IDS
            .iter()
            .any(|&(vid, pid)| info.vid == vid && info.pid == pid)
            .then(|| info.product.clone().unwrap_or_else(|| "IOIO".to_string()))
    }

    /// Get all serial ports that look like a board
    pub fn get_available_devices() -> Result<Vec<BoardDevice>, BoardConnectorError> {
        let devices = serialport::available_ports()?
            .into_iter()
            .filter_map(|p| {
                Self::is_known_device(&p.port_type).map(|name| BoardDevice::new(name, p.port_name))
            })
            .collect();

        Ok(devices)
    }

    fn get_device_port() -> Result<String, BoardConnectorError> {
        log::debug!("Searching for a IOIO board");

        Self::get_available_devices()?
            .into_iter()
            .next()
            .map(|device| device.port)
            .ok_or(BoardConnectorError::DeviceNotFound)
    }

    /// Open the port and initialise the shell, resetting the board between
    /// attempts when it times out.
    fn get_working_terminal(
        port: &str,
        config: &SerialLinkConfig,
    ) -> Result<BoardTerminal<Box<dyn SerialPort>>, BoardConnectorError> {
        Self::initialize_with_retries(port, config, || {
            BoardTerminal::open(port, config).map_err(BoardConnectorError::from)
        })
    }

    fn initialize_with_retries<P: Read + Write + Send>(
        port: &str,
        config: &SerialLinkConfig,
        mut open: impl FnMut() -> Result<BoardTerminal<P>, BoardConnectorError>,
    ) -> Result<BoardTerminal<P>, BoardConnectorError> {
        let attempts = config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            let mut terminal = open()?;

            match terminal.initialize() {
                Ok(()) => return Ok(terminal),
                Err(BoardTerminalError::Timeout { .. }) => {
                    log::debug!(
                        "Timeout during initialization (attempt {}/{}), sending reset and retrying",
                        attempt,
                        attempts
                    );
                    if let Err(e) = terminal.send_reset() {
                        log::debug!("Sending reset to {} failed: {}", port, e);
                    }
                    thread::sleep(config.reset_delay);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BoardConnectorError::NotResponding {
            port: port.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;
    use std::io;
    use std::time::Duration;

    /// Never answers, and refuses the reset line.
    struct SilentBoard;

    impl Read for SilentBoard {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
        }
    }

    impl Write for SilentBoard {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.starts_with(b"reset") {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reset refused"));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn usb(vid: u16, pid: u16, product: Option<&str>) -> SerialPortType {
        SerialPortType::UsbPort(UsbPortInfo {
            vid,
            pid,
            serial_number: None,
            manufacturer: None,
            product: product.map(str::to_string),
        })
    }

    #[test]
    fn test_known_usb_ids_match() {
        assert_eq!(
            BoardConnector::is_known_device(&usb(0x1b4f, 0x0041, Some("IOIO-OTG"))),
            Some("IOIO-OTG".to_string())
        );
        assert_eq!(
            BoardConnector::is_known_device(&usb(0x1b4f, 0x0042, None)),
            Some("IOIO".to_string())
        );
        assert_eq!(BoardConnector::is_known_device(&usb(0x0403, 0x6001, None)), None);
        assert_eq!(BoardConnector::is_known_device(&SerialPortType::Unknown), None);
    }

    #[test]
    fn test_failed_reset_does_not_stop_retries() {
        let config = SerialLinkConfig {
            reply_timeout: Duration::from_millis(10),
            connect_attempts: 2,
            reset_delay: Duration::ZERO,
            ..SerialLinkConfig::default()
        };
        let mut opened = 0;

        let err = BoardConnector::initialize_with_retries("/dev/null", &config, || {
            opened += 1;
            Ok(BoardTerminal::new(SilentBoard, &config))
        })
        .err()
        .unwrap();

        assert_eq!(opened, 2);
        assert!(matches!(
            err,
            BoardConnectorError::NotResponding { attempts: 2, .. }
        ));
    }

    #[test]
    fn test_get_available_devices() {
        // Depends on what is plugged into the test machine
        if let Ok(devices) = BoardConnector::get_available_devices() {
            for device in devices {
                assert!(!device.name.is_empty());
                assert!(!device.port.is_empty());
            }
        }
    }
}
