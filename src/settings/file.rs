//! TOML configuration file.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use super::{DataBits, FlowControl, Parity, SettingsBuilder, SettingsError, StopBits};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    serial: SerialSection,
    #[serde(default)]
    mqtt: MqttSection,
    #[serde(default)]
    bridge: BridgeSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerialSection {
    path: Option<String>,
    baud_rate: Option<u32>,
    data_bits: Option<u8>,
    parity: Option<String>,
    stop_bits: Option<u8>,
    flow_control: Option<String>,
    disable_dtr_rts: Option<bool>,
    line_mode: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MqttSection {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    keep_alive_secs: Option<u64>,
    clean_session: Option<bool>,
    ack_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BridgeSection {
    root: Option<String>,
    multiplexed: Option<bool>,
    queue_capacity: Option<usize>,
    resubscribe: Option<bool>,
    reconnect_delay_secs: Option<u64>,
}

pub(super) fn load(builder: SettingsBuilder, path: PathBuf) -> Result<SettingsBuilder, SettingsError> {
    let text = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
        path: path.clone(),
        source,
    })?;
    let file: ConfigFile =
        toml::from_str(&text).map_err(|source| SettingsError::Parse { path: path.clone(), source })?;
    debug!("Loaded configuration from {}", path.display());
    apply(builder, file)
}

fn apply(mut builder: SettingsBuilder, file: ConfigFile) -> Result<SettingsBuilder, SettingsError> {
    let ConfigFile {
        serial,
        mqtt,
        bridge,
    } = file;

    if let Some(path) = serial.path {
        builder = builder.path(path);
    }
    if let Some(baud_rate) = serial.baud_rate {
        builder = builder.baud_rate(baud_rate);
    }
    if let Some(bits) = serial.data_bits {
        builder = builder.data_bits(parse_data_bits(bits)?);
    }
    if let Some(parity) = serial.parity {
        builder = builder.parity(parse_parity(&parity)?);
    }
    if let Some(bits) = serial.stop_bits {
        builder = builder.stop_bits(parse_stop_bits(bits)?);
    }
    if let Some(flow_control) = serial.flow_control {
        builder = builder.flow_control(parse_flow_control(&flow_control)?);
    }
    if let Some(disable) = serial.disable_dtr_rts {
        builder = builder.disable_dtr_rts(disable);
    }
    if let Some(line_mode) = serial.line_mode {
        builder = builder.line_mode(line_mode);
    }

    if let Some(host) = mqtt.host {
        builder = builder.host(host);
    }
    if let Some(port) = mqtt.port {
        builder = builder.port(port);
    }
    if let Some(username) = mqtt.username {
        builder = builder.username(username);
    }
    if let Some(password) = mqtt.password {
        builder = builder.password(password);
    }
    if let Some(client_id) = mqtt.client_id {
        builder = builder.client_id(client_id);
    }
    if let Some(secs) = mqtt.keep_alive_secs {
        builder = builder.keep_alive(Duration::from_secs(secs));
    }
    if let Some(clean_session) = mqtt.clean_session {
        builder = builder.clean_session(clean_session);
    }
    if let Some(secs) = mqtt.ack_timeout_secs {
        builder = builder.ack_timeout(Duration::from_secs(secs));
    }

    if let Some(root) = bridge.root {
        builder = builder.root(root);
    }
    if let Some(multiplexed) = bridge.multiplexed {
        builder = builder.multiplexed(multiplexed);
    }
    if let Some(capacity) = bridge.queue_capacity {
        builder = builder.queue_capacity(capacity);
    }
    if let Some(resubscribe) = bridge.resubscribe {
        builder = builder.resubscribe(resubscribe);
    }
    if let Some(secs) = bridge.reconnect_delay_secs {
        builder = builder.reconnect_delay(Duration::from_secs(secs));
    }

    Ok(builder)
}

fn invalid(key: &'static str, value: impl ToString) -> SettingsError {
    SettingsError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

pub fn parse_data_bits(bits: u8) -> Result<DataBits, SettingsError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(invalid("data_bits", other)),
    }
}

pub fn parse_stop_bits(bits: u8) -> Result<StopBits, SettingsError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(invalid("stop_bits", other)),
    }
}

pub fn parse_parity(parity: &str) -> Result<Parity, SettingsError> {
    match parity.to_ascii_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(invalid("parity", parity)),
    }
}

pub fn parse_flow_control(flow_control: &str) -> Result<FlowControl, SettingsError> {
    match flow_control.to_ascii_lowercase().as_str() {
        "none" => Ok(FlowControl::None),
        "soft" | "software" => Ok(FlowControl::Software),
        "hard" | "hardware" => Ok(FlowControl::Hardware),
        _ => Err(invalid("flow_control", flow_control)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
