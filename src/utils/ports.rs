//! Serial port device manipulation.

use console::{style, Term};
use log::{debug, info, warn};
use serialport::{available_ports, SerialPort, SerialPortType};

use std::{thread, time::Duration};

use crate::Settings;

//==============================================================================
// Public Interface
//==============================================================================

/// A serial port detected on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    pub path: String,
    /// Manufacturer and product, for USB devices.
    pub description: Option<String>,
}

impl std::fmt::Display for DetectedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: ({})", self.path, description),
            None => f.write_str(&self.path),
        }
    }
}

/// Enumerates the serial devices present on the system.
pub fn enumerate_serial_ports() -> Vec<DetectedPort> {
    match available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| match p.port_type {
                // USB ports give us more info about the connected serial
                // controller
                SerialPortType::UsbPort(info) => DetectedPort {
                    path: p.port_name,
                    description: Some(format!(
                        "{} / {}",
                        info.manufacturer.as_deref().unwrap_or(""),
                        info.product.as_deref().unwrap_or("")
                    )),
                },
                // Also keep the other devices, such as virtual ports for
                // testing
                _ => DetectedPort {
                    path: p.port_name,
                    description: None,
                },
            })
            .collect(),
        Err(e) => {
            info!("error: {}", e);
            vec![]
        }
    }
}

/// Interactively select a serial port.
///
/// The list of detected ports is refreshed until at least one device shows
/// up. Cancelling the selection (`Esc`) refreshes the list again, which
/// allows to plug the device without restarting. Returns `None` when the
/// terminal is not interactive.
pub fn select_port() -> Option<String> {
    let term = Term::stderr();
    if !term.features().is_attended() {
        return None;
    }

    loop {
        let mut waited = 0;
        let ports = loop {
            let ports = enumerate_serial_ports();
            if !ports.is_empty() {
                break ports;
            }
            let _ = term.clear_line();
            let _ = term.write_str(&format!(
                "[{:03}s] Waiting for a serial device to be connected...",
                style(waited).dim()
            ));
            thread::sleep(Duration::from_secs(1));
            waited += 1;
        };
        let _ = term.clear_line();

        match select_port_interactive(&term, &ports) {
            Ok(Some(path)) => {
                let _ = term.write_line(&format!("Serial port {} selected", style(&path).green()));
                return Some(path);
            }
            Ok(None) => {
                let _ = term.write_line("Selection canceled -> refreshing...");
            }
            Err(e) => {
                warn!("Port selection failed: {}", e);
                return None;
            }
        }
    }
}

/// Print the detected ports on stdout, one per line.
pub fn list_ports() {
    let ports = enumerate_serial_ports();
    if ports.is_empty() {
        println!("{}", style("No serial port found").yellow());
    }
    for port in ports {
        match port.description {
            Some(description) => println!("{}  {}", style(&port.path).cyan(), description),
            None => println!("{}", style(&port.path).cyan()),
        }
    }
}

/// Open the port configured in `settings`, retrying a few times since USB
/// serial devices often show up a moment after being plugged.
pub fn open_and_setup_port(
    settings: &Settings,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    use retry::{delay, retry_with_index};

    let path = settings.path.clone().ok_or_else(|| {
        serialport::Error::new(serialport::ErrorKind::NoDevice, "no serial port was given")
    })?;

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to open {} ({})", path, index);
            serialport::new(&path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .open()
        },
    );
    match result {
        Ok(mut port) => {
            // Some drivers ignore the builder values, apply them again.
            port.set_baud_rate(settings.baud_rate)?;
            port.set_data_bits(settings.data_bits)?;
            port.set_stop_bits(settings.stop_bits)?;
            port.set_parity(settings.parity)?;
            port.set_flow_control(settings.flow_control)?;

            let baud_rate = port.baud_rate()?;
            info!("Connected to {} at {} baud", path, baud_rate);
            debug!("data_bits    : {:?}", port.data_bits()?);
            debug!("stop_bits    : {:?}", port.stop_bits()?);
            debug!("parity       : {:?}", port.parity()?);
            debug!("flow control : {:?}", port.flow_control()?);

            if baud_rate != settings.baud_rate {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::InvalidInput,
                    format!(
                        "baud rate {} was not accepted by the device, {} is used instead",
                        settings.baud_rate, baud_rate
                    ),
                ));
            }

            Ok(port)
        }
        Err(err) => match err {
            retry::Error::Operation {
                error,
                total_delay,
                tries,
            } => {
                info!(
                    "Failed to open the port after {:?} and {} tries: {}",
                    total_delay, tries, error,
                );
                Err(error)
            }
            retry::Error::Internal(_) => {
                info!("Internal retry error while opening port");
                Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "internal error while retrying to open the port",
                ))
            }
        },
    }
}

//==============================================================================
// Private stuff
//==============================================================================

fn select_port_interactive(
    term: &Term,
    ports: &[DetectedPort],
) -> std::io::Result<Option<String>> {
    use dialoguer::{theme::ColorfulTheme, Select};

    let items: Vec<String> = ports.iter().map(ToString::to_string).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a port to be used")
        .items(&items)
        .default(0)
        .interact_on_opt(term)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(selection.and_then(|i| ports.get(i)).map(|p| p.path.clone()))
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_port_display() {
        let usb = DetectedPort {
            path: "/dev/ttyUSB0".into(),
            description: Some("FTDI / FT232R".into()),
        };
        assert_eq!(usb.to_string(), "/dev/ttyUSB0: (FTDI / FT232R)");

        let virt = DetectedPort {
            path: "/dev/pts/3".into(),
            description: None,
        };
        assert_eq!(virt.to_string(), "/dev/pts/3");
    }

    #[test]
    fn opening_without_path_fails_fast() {
        let settings = crate::SettingsBuilder::new().finalize();
        let err = open_and_setup_port(&settings).err().unwrap();
        assert_eq!(err.kind(), serialport::ErrorKind::NoDevice);
    }
}
