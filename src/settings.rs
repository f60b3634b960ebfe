//! Settings of the serial port, the broker connection and the bridge itself.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values. Values can also be loaded from a
//! TOML file with [`SettingsBuilder::load_file`]:
//!
//! ```toml
//! [serial]
//! path = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [mqtt]
//! host = "broker.local"
//! username = "bridge"
//! password = "secret"
//!
//! [bridge]
//! root = "home/sensors"
//! multiplexed = true
//! ```

mod file;

pub use file::{parse_data_bits, parse_flow_control, parse_parity, parse_stop_bits};
pub use serialport::{DataBits, FlowControl, Parity, StopBits};

use std::borrow::Cow;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::FrameMode;
use crate::session::{BrokerEndpoint, Credentials, Presence, SessionOptions};

// =============================================================================
// Public Interface
// =============================================================================

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "serialmq-adapter";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no serial port was given")]
    MissingPort,
    #[error("no broker host was given")]
    MissingHost,
    #[error("no topic root was given")]
    MissingRoot,
    #[error("invalid topic root '{0}': it must be non empty, without wildcards or trailing '/'")]
    InvalidRoot(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Groups all settings used by the bridge and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    // Serial port
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,
    /// Clear DTR and RTS right after opening the port. Many boards reset
    /// when these lines are asserted.
    pub disable_dtr_rts: bool,
    /// Read complete lines from the port instead of raw chunks of bytes.
    pub line_mode: bool,

    // Broker
    pub host: Option<String>,
    pub port: u16,
    /// Login, used only when both username and password are set.
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// How long to wait for the broker to acknowledge a request.
    pub ack_timeout: Duration,

    // Bridge
    /// Prefix of every topic used by the bridge.
    pub root: Option<String>,
    /// Frames carry a channel id, and topics a channel level.
    pub multiplexed: bool,
    /// Capacity of the queues between the serial port and the broker, in
    /// frames.
    pub queue_capacity: usize,
    /// Restore the subscriptions after a reconnection to the broker.
    pub resubscribe: bool,
    /// Pause between two attempts to reconnect to the broker.
    pub reconnect_delay: Duration,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

impl Settings {
    /// Check that the settings are complete and consistent.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.path.as_deref().map_or(true, str::is_empty) {
            return Err(SettingsError::MissingPort);
        }
        if self.host.as_deref().map_or(true, str::is_empty) {
            return Err(SettingsError::MissingHost);
        }
        let root = self.root.as_deref().ok_or(SettingsError::MissingRoot)?;
        if root.is_empty() || root.ends_with('/') || root.contains(|c| c == '+' || c == '#') {
            return Err(SettingsError::InvalidRoot(root.into()));
        }
        if self.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue {
                key: "queue_capacity",
                value: "0".into(),
            });
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err(SettingsError::InvalidValue {
                key: "keep_alive",
                value: format!("{:?}", self.keep_alive),
            });
        }
        Ok(())
    }

    pub fn frame_mode(&self) -> FrameMode {
        if self.multiplexed {
            FrameMode::Multiplexed
        } else {
            FrameMode::Single
        }
    }

    pub fn endpoint(&self) -> Result<BrokerEndpoint, SettingsError> {
        let host = self.host.clone().ok_or(SettingsError::MissingHost)?;
        let credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        Ok(BrokerEndpoint {
            host,
            port: self.port,
            credentials,
        })
    }

    /// Session options, with the presence announcement published under
    /// `availability`.
    pub fn session_options(&self, availability: String) -> SessionOptions {
        SessionOptions {
            presence: Some(Presence {
                topic: availability,
                online: b"1".to_vec(),
                offline: b"0".to_vec(),
            }),
            clean_session: self.clean_session,
            keep_alive: self.keep_alive,
            connect_timeout: self.ack_timeout,
            resubscribe: self.resubscribe,
            ack_timeout: self.ack_timeout,
            ..SessionOptions::new(self.client_id.clone())
        }
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use serialmq::SettingsBuilder;
///
/// let settings = SettingsBuilder::new()
///     .path("/dev/ttyUSB0")
///     .host("localhost")
///     .root("devices")
///     .finalize();
/// assert!(settings.validate().is_ok());
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder::new()
    }
}

impl SettingsBuilder {
    /// Start building the settings using default values, no port, no broker
    /// host and no topic root.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: DEFAULT_BAUD_RATE,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                disable_dtr_rts: false,
                line_mode: false,
                host: None,
                port: DEFAULT_MQTT_PORT,
                username: Some("mqtt".into()),
                password: Some("mqtt".into()),
                client_id: DEFAULT_CLIENT_ID.into(),
                keep_alive: Duration::from_secs(30),
                clean_session: true,
                ack_timeout: Duration::from_secs(10),
                root: None,
                multiplexed: true,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                resubscribe: true,
                reconnect_delay: Duration::from_secs(5),
                _private_use_builder: (),
            },
        }
    }

    /// Start from existing settings, typically to override some of them.
    pub fn from_settings(settings: Settings) -> Self {
        SettingsBuilder { settings }
    }

    /// Override the current values with those found in the TOML file at
    /// `path`. Keys missing from the file keep their current value.
    pub fn load_file(self, path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        file::load(self, path.into())
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().into_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    pub fn disable_dtr_rts(mut self, disable: bool) -> Self {
        self.settings.disable_dtr_rts = disable;
        self
    }

    /// Split the serial input on new lines
    pub fn line_mode(mut self, line_mode: bool) -> Self {
        self.settings.line_mode = line_mode;
        self
    }

    /// Set the broker host name or address
    pub fn host<'a>(mut self, host: impl Into<Cow<'a, str>>) -> Self {
        self.settings.host = Some(host.into().into_owned());
        self
    }

    /// Set the broker TCP port
    pub fn port(mut self, port: u16) -> Self {
        self.settings.port = port;
        self
    }

    pub fn username<'a>(mut self, username: impl Into<Cow<'a, str>>) -> Self {
        self.settings.username = Some(username.into().into_owned());
        self
    }

    pub fn password<'a>(mut self, password: impl Into<Cow<'a, str>>) -> Self {
        self.settings.password = Some(password.into().into_owned());
        self
    }

    /// Connect without login
    pub fn anonymous(mut self) -> Self {
        self.settings.username = None;
        self.settings.password = None;
        self
    }

    pub fn client_id<'a>(mut self, client_id: impl Into<Cow<'a, str>>) -> Self {
        self.settings.client_id = client_id.into().into_owned();
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.settings.keep_alive = keep_alive;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.settings.clean_session = clean_session;
        self
    }

    pub fn ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.settings.ack_timeout = ack_timeout;
        self
    }

    /// Set the prefix of all topics
    pub fn root<'a>(mut self, root: impl Into<Cow<'a, str>>) -> Self {
        self.settings.root = Some(root.into().into_owned());
        self
    }

    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.settings.multiplexed = multiplexed;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.settings.queue_capacity = queue_capacity;
        self
    }

    pub fn resubscribe(mut self, resubscribe: bool) -> Self {
        self.settings.resubscribe = resubscribe;
        self
    }

    pub fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.settings.reconnect_delay = reconnect_delay;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> SettingsBuilder {
        SettingsBuilder::new()
            .path("/dev/ttyUSB0")
            .host("localhost")
            .root("devices")
    }

    #[test]
    fn all_default() {
        let settings = SettingsBuilder::new().finalize();
        assert_eq!(settings.path, None);
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.flow_control, FlowControl::None);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert!(!settings.disable_dtr_rts);
        assert!(!settings.line_mode);
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.username.as_deref(), Some("mqtt"));
        assert_eq!(settings.password.as_deref(), Some("mqtt"));
        assert_eq!(settings.client_id, "serialmq-adapter");
        assert_eq!(settings.ack_timeout, Duration::from_secs(10));
        assert!(settings.multiplexed);
        assert_eq!(settings.queue_capacity, 1000);
        assert!(settings.resubscribe);
    }

    #[test]
    fn serial_line() {
        let settings = SettingsBuilder::new()
            .baud_rate(115_200)
            .data_bits(DataBits::Seven)
            .flow_control(FlowControl::Hardware)
            .parity(Parity::Even)
            .stop_bits(StopBits::Two)
            .disable_dtr_rts(true)
            .line_mode(true)
            .finalize();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.flow_control, FlowControl::Hardware);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, StopBits::Two);
        assert!(settings.disable_dtr_rts);
        assert!(settings.line_mode);
    }

    #[test]
    fn validate_reports_what_is_missing() {
        assert!(matches!(
            SettingsBuilder::new().finalize().validate(),
            Err(SettingsError::MissingPort)
        ));
        assert!(matches!(
            SettingsBuilder::new().path("COM3").finalize().validate(),
            Err(SettingsError::MissingHost)
        ));
        assert!(matches!(
            SettingsBuilder::new()
                .path("COM3")
                .host("localhost")
                .finalize()
                .validate(),
            Err(SettingsError::MissingRoot)
        ));
        assert!(complete().finalize().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        for root in ["", "a/", "a/+", "a/#"] {
            assert!(matches!(
                complete().root(root).finalize().validate(),
                Err(SettingsError::InvalidRoot(_))
            ));
        }
        assert!(matches!(
            complete().queue_capacity(0).finalize().validate(),
            Err(SettingsError::InvalidValue { key: "queue_capacity", .. })
        ));
        assert!(matches!(
            complete()
                .keep_alive(Duration::from_secs(1))
                .finalize()
                .validate(),
            Err(SettingsError::InvalidValue { key: "keep_alive", .. })
        ));
    }

    #[test]
    fn endpoint_credentials() {
        let endpoint = complete().port(8883).finalize().endpoint().unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 8883);
        assert_eq!(endpoint.credentials.unwrap().username, "mqtt");

        let endpoint = complete().anonymous().finalize().endpoint().unwrap();
        assert!(endpoint.credentials.is_none());
    }

    #[test]
    fn frame_mode() {
        assert_eq!(complete().finalize().frame_mode(), FrameMode::Multiplexed);
        assert_eq!(
            complete().multiplexed(false).finalize().frame_mode(),
            FrameMode::Single
        );
    }

    #[test]
    fn session_options_carry_presence() {
        let options = complete()
            .client_id("node-1")
            .finalize()
            .session_options("devices/available".into());
        assert_eq!(options.client_id, "node-1");
        let presence = options.presence.unwrap();
        assert_eq!(presence.topic, "devices/available");
        assert_eq!(presence.online, b"1");
        assert_eq!(presence.offline, b"0");
    }
}
