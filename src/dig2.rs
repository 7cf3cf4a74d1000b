use crate::data::{DataMode, DataReader, ReadStatus};
use crate::error::DeviceError;
use crate::felib::{dig2_url, Connector, Transport};
use log::{debug, info};

/// One connected board: its transport, its name for diagnostics, and its
/// data handle. Typed parameter access lives in [`crate::params`].
pub struct Dig2 {
    name: String,
    url: String,
    transport: Box<dyn Transport>,
    pub(crate) debug: bool,
    data: DataReader,
    connected: bool,
}

impl Dig2 {
    pub fn connect(
        connector: &dyn Connector,
        hostname: &str,
        monitor_only: bool,
    ) -> Result<Self, DeviceError> {
        let url = dig2_url(hostname, monitor_only);
        match connector.open(&url) {
            Ok(transport) => {
                info!("Connected to {url}");
                Ok(Self::with_url(hostname, &url, transport))
            }
            Err(code) => Err(DeviceError::Connect {
                url,
                message: code.to_string(),
            }),
        }
    }

    /// Wrap an already-open transport.
    pub fn from_transport(name: &str, transport: Box<dyn Transport>) -> Self {
        Self::with_url(name, &dig2_url(name, false), transport)
    }

    fn with_url(name: &str, url: &str, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            transport,
            debug: false,
            data: DataReader::new(),
            connected: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.transport.close().map_err(|code| DeviceError::Command {
            command: "close".to_string(),
            message: code.to_string(),
        })
    }

    fn check_connected(&self) -> Result<(), DeviceError> {
        if self.connected {
            Ok(())
        } else {
            Err(DeviceError::NotConnected(self.name.clone()))
        }
    }

    pub fn getvalue(&mut self, path: &str) -> Result<String, DeviceError> {
        self.getvalue_with_arg(path, "")
    }

    /// Get a parameter that takes an argument in the value buffer.
    pub fn getvalue_with_arg(&mut self, path: &str, arg: &str) -> Result<String, DeviceError> {
        self.check_connected()?;
        if self.debug {
            debug!("Getting {path} from {}", self.name);
        }

        let mut value = arg.to_string();
        match self.transport.get_value(path, &mut value) {
            Ok(()) => Ok(value),
            Err(code) => Err(DeviceError::Get {
                path: path.to_string(),
                message: DeviceError::describe(code, &self.transport.last_error()),
            }),
        }
    }

    pub fn setvalue(&mut self, path: &str, value: &str) -> Result<(), DeviceError> {
        self.check_connected()?;
        if self.debug {
            debug!("Setting {path} to {value} on {}", self.name);
        }

        self.transport
            .set_value(path, value)
            .map_err(|code| DeviceError::Set {
                path: path.to_string(),
                message: DeviceError::describe(code, &self.transport.last_error()),
            })
    }

    pub fn get_allowed_values(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        self.check_connected()?;
        self.transport
            .get_allowed_values(path)
            .map_err(|code| DeviceError::Get {
                path: format!("{path}/allowedvalues"),
                message: DeviceError::describe(code, &self.transport.last_error()),
            })
    }

    pub fn get_user_register(&mut self, address: u32) -> Result<u32, DeviceError> {
        self.check_connected()?;
        if self.debug {
            debug!("Getting user register 0x{address:x} from {}", self.name);
        }
        self.transport
            .get_user_register(address)
            .map_err(|code| DeviceError::Get {
                path: format!("User register 0x{address:x}"),
                message: DeviceError::describe(code, &self.transport.last_error()),
            })
    }

    pub fn set_user_register(&mut self, address: u32, value: u32) -> Result<(), DeviceError> {
        self.check_connected()?;
        if self.debug {
            debug!("Setting user register 0x{address:x} to {value} on {}", self.name);
        }
        self.transport
            .set_user_register(address, value)
            .map_err(|code| DeviceError::Set {
                path: format!("User register 0x{address:x}"),
                message: DeviceError::describe(code, &self.transport.last_error()),
            })
    }

    pub fn sendcommand(&mut self, path: &str) -> Result<(), DeviceError> {
        self.check_connected()?;
        if self.debug {
            debug!("Sending {path} to {}", self.name);
        }
        self.transport
            .send_command(path)
            .map_err(|code| DeviceError::Command {
                command: path.to_string(),
                message: DeviceError::describe(code, &self.transport.last_error()),
            })
    }

    pub fn run_cmd(&mut self, cmd: &str) -> Result<(), DeviceError> {
        self.sendcommand(&format!("/cmd/{cmd}"))
    }

    pub fn reset(&mut self) -> Result<(), DeviceError> {
        self.run_cmd("reset")
    }

    pub fn clear_data(&mut self) -> Result<(), DeviceError> {
        self.run_cmd("cleardata")
    }

    /// Clear stale data and arm; also start if software start is one of the
    /// board's start sources.
    pub fn start_acq(&mut self, sw_start: bool) -> Result<(), DeviceError> {
        self.clear_data()?;
        self.run_cmd("armacquisition")?;
        if sw_start {
            self.run_cmd("swstartacquisition")?;
        }
        Ok(())
    }

    pub fn stop_acq(&mut self) -> Result<(), DeviceError> {
        self.run_cmd("disarmacquisition")
    }

    pub fn send_sw_trigger(&mut self) -> Result<(), DeviceError> {
        self.run_cmd("sendswtrigger")
    }

    /// Set up the data handle: raw reads, or the decoded endpoint of the
    /// firmware the board is running.
    pub fn setup_data_handle(&mut self, raw: bool) -> Result<DataMode, DeviceError> {
        let firmware = self.get_firmware_type()?;
        self.data
            .setup_data_handle(raw, &firmware, self.transport.as_mut(), &self.name)
    }

    pub fn read_event(&mut self, timeout_ms: u32, out: &mut [u8]) -> Result<ReadStatus, DeviceError> {
        self.check_connected()?;
        self.data
            .read_event(self.transport.as_mut(), &self.name, timeout_ms, out)
    }
}

impl Drop for Dig2 {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Closing {}: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimConnector};

    #[test]
    fn connect_and_command() {
        let connector = SimConnector::new(SimConfig::default());
        let mut dig = Dig2::connect(&connector, "vx01", false).unwrap();
        assert_eq!(dig.url(), "dig2://vx01");
        dig.setvalue("/par/StartSource", "SWcmd").unwrap();
        dig.start_acq(true).unwrap();
        assert_eq!(dig.getvalue("/par/AcquisitionStatus").unwrap(), "3");
        dig.stop_acq().unwrap();

        dig.close().unwrap();
        assert!(matches!(
            dig.getvalue("/par/ModelName"),
            Err(DeviceError::NotConnected(_))
        ));
    }

    #[test]
    fn transport_failures_carry_the_path() {
        let connector = SimConnector::new(SimConfig::default());
        let mut dig = Dig2::connect(&connector, "vx01", false).unwrap();
        match dig.getvalue("/par/NoSuchThing") {
            Err(DeviceError::Get { path, message }) => {
                assert_eq!(path, "/par/NoSuchThing");
                assert!(message.contains("InvalidParam"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
