//! # Machine Registry
//!
//! Builds machines from declarative [`MachineConfig`]s. A family name such
//! as `"modbus-rtu"` selects a factory in the [`FamilyRegistry`]; the
//! family then decides transport, framing, controller and default port.
//!
//! ```yaml
//! machines:
//!   - id: boiler
//!     family: modbus-tcp
//!     connection: 192.168.1.20
//!     slave_address: 1
//!     keep_connect: true
//!     units:
//!       - { id: level, area: 4X, address: 1, data_type: uint16 }
//!       - { id: temp, area: 4X, address: 2, data_type: int16, zoom: 0.1 }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{AddressTranslator, AddressUnit, Na200hTranslator};
use crate::codec::{Endian, ValueCodec};
use crate::config::{ChannelSettings, ConfigProvider};
use crate::connector::{Channel, ChannelConnector, ConnectionPool, Connector, SerialChannel, TcpChannel, UdpChannel};
use crate::controller::select_controller;
use crate::error::{FieldbusError, FieldbusResult};
use crate::linker::ProtocolLinker;
use crate::logging::CallbackLogger;
use crate::machine::BaseMachine;
use crate::protocol::hj212::Hj212Family;
use crate::protocol::modbus::{ModbusFamily, ModbusType};
use crate::protocol::siemens::{ConnectionType, SiemensFamily};
use crate::protocol::{ProtocolFamily, TransportKind};
use crate::utils::validation::{validate_rack_slot, validate_slave_address};

fn default_slave() -> u8 {
    1
}

fn default_slot() -> u8 {
    1
}

/// How a machine batches its units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinerKind {
    #[default]
    Continuous,
    Single,
}

/// Declarative description of one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub id: String,
    #[serde(default)]
    pub alias: String,
    /// Registry name of the protocol family
    pub family: String,
    /// `host[:port]` for network families, the port name for serial ones
    pub connection: String,
    #[serde(default = "default_slave")]
    pub slave_address: u8,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "default_slot")]
    pub slot: u8,
    #[serde(default)]
    pub keep_connect: bool,
    /// Overrides the family's byte order
    #[serde(default)]
    pub endian: Option<Endian>,
    #[serde(default)]
    pub combiner: CombinerKind,
    /// Configuration path of the channel settings, the connection by default
    #[serde(default)]
    pub settings_path: Option<String>,
    /// Family specific parameters, e.g. `mn` and `password` for HJ212
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub units: Vec<AddressUnit>,
}

impl MachineConfig {
    pub fn new<I: Into<String>, F: Into<String>, C: Into<String>>(id: I, family: F, connection: C) -> Self {
        Self {
            id: id.into(),
            alias: String::new(),
            family: family.into(),
            connection: connection.into(),
            slave_address: default_slave(),
            rack: 0,
            slot: default_slot(),
            keep_connect: false,
            endian: None,
            combiner: CombinerKind::default(),
            settings_path: None,
            options: HashMap::new(),
            units: Vec::new(),
        }
    }

    pub fn with_units(mut self, units: Vec<AddressUnit>) -> Self {
        self.units = units;
        self
    }

    pub fn with_option<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    fn option(&self, key: &str) -> FieldbusResult<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| FieldbusError::configuration(format!("{}: option '{}' is required", self.id, key)))
    }

    fn settings_path(&self) -> &str {
        self.settings_path.as_deref().unwrap_or(&self.connection)
    }
}

#[derive(Debug, Deserialize)]
struct MachinesFile {
    machines: Vec<MachineConfig>,
}

/// Parse a YAML document with a top-level `machines` list
pub fn load_machines(text: &str) -> FieldbusResult<Vec<MachineConfig>> {
    let file: MachinesFile = serde_yaml::from_str(text)?;
    Ok(file.machines)
}

/// Creates the family of one machine
pub type FamilyFactory = Arc<dyn Fn(&MachineConfig) -> FieldbusResult<Arc<dyn ProtocolFamily>> + Send + Sync>;

/// Family names mapped to their factories
#[derive(Clone, Default)]
pub struct FamilyRegistry {
    factories: HashMap<String, FamilyFactory>,
}

impl FamilyRegistry {
    /// Registry without any family
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in family
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let modbus = [
            ("modbus-tcp", ModbusType::Tcp),
            ("modbus-udp", ModbusType::Udp),
            ("modbus-rtu", ModbusType::Rtu),
            ("modbus-ascii", ModbusType::Ascii),
            ("modbus-rtu-in-tcp", ModbusType::RtuInTcp),
            ("modbus-ascii-in-tcp", ModbusType::AsciiInTcp),
        ];
        for (name, kind) in modbus {
            registry.register(
                name,
                Arc::new(move |config: &MachineConfig| -> FieldbusResult<Arc<dyn ProtocolFamily>> {
                    validate_slave_address(config.slave_address)?;
                    Ok(Arc::new(ModbusFamily::new(kind, config.slave_address)))
                }),
            );
        }

        registry.register(
            "na200h",
            Arc::new(|config: &MachineConfig| -> FieldbusResult<Arc<dyn ProtocolFamily>> {
                validate_slave_address(config.slave_address)?;
                Ok(Arc::new(
                    ModbusFamily::new(ModbusType::Tcp, config.slave_address)
                        .with_translator("na200h", Arc::new(Na200hTranslator::new())),
                ))
            }),
        );

        registry.register(
            "siemens-tcp",
            Arc::new(|config: &MachineConfig| -> FieldbusResult<Arc<dyn ProtocolFamily>> {
                validate_rack_slot(config.rack, config.slot)?;
                let connection_type = match config.options.get("connection_type").map(String::as_str) {
                    None | Some("pg") => ConnectionType::Pg,
                    Some("op") => ConnectionType::Op,
                    Some("basic") => ConnectionType::Basic,
                    Some(other) => {
                        return Err(FieldbusError::configuration(format!(
                            "{}: unknown S7 connection type '{}'",
                            config.id, other
                        )))
                    }
                };
                Ok(Arc::new(
                    SiemensFamily::new(config.rack, config.slot).with_connection_type(connection_type),
                ))
            }),
        );

        registry.register(
            "hj212-tcp",
            Arc::new(|config: &MachineConfig| -> FieldbusResult<Arc<dyn ProtocolFamily>> {
                let mut family = Hj212Family::new(config.option("password")?, config.option("mn")?);
                if let Some(st) = config.options.get("st") {
                    family = family.with_system_type(st.as_str());
                }
                Ok(Arc::new(family))
            }),
        );
        registry
    }

    pub fn register<S: Into<String>>(&mut self, name: S, factory: FamilyFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Family for `config`
    pub fn create(&self, config: &MachineConfig) -> FieldbusResult<Arc<dyn ProtocolFamily>> {
        let factory = self
            .factories
            .get(&config.family)
            .ok_or_else(|| FieldbusError::configuration(format!("unknown protocol family '{}'", config.family)))?;
        factory(config)
    }

    /// Build a machine, sharing connectors through `pool`
    ///
    /// Channel settings come from `provider` under the machine's settings
    /// path. Full duplex follows the family unless the provider sets it.
    pub fn build_machine(
        &self,
        config: &MachineConfig,
        provider: &dyn ConfigProvider,
        pool: &ConnectionPool,
        logger: CallbackLogger,
    ) -> FieldbusResult<BaseMachine> {
        let family = self.create(config)?;
        // reject bad units before a connector lands in the shared pool
        let translator = family.translator();
        for unit in &config.units {
            translator.validate_unit(unit)?;
        }
        let path = config.settings_path();
        let mut settings = ChannelSettings::resolve(provider, path)?;
        if provider.get_value(path, "full_duplex").is_none() {
            settings.full_duplex = family.default_full_duplex();
        }

        let endpoint = match family.transport() {
            TransportKind::Serial => config.connection.clone(),
            TransportKind::Tcp | TransportKind::Udp => with_default_port(&config.connection, family.default_port()),
        };
        let key = format!("{}@{}", family.name(), endpoint);
        let connector = pool.get_or_create(&key, || {
            let channel: Arc<dyn Channel> = match family.transport() {
                TransportKind::Tcp => Arc::new(TcpChannel::new(endpoint.as_str())),
                TransportKind::Udp => Arc::new(UdpChannel::new(endpoint.as_str())),
                TransportKind::Serial => Arc::new(SerialChannel::new(endpoint.as_str(), settings.clone())),
            };
            let controller = select_controller(&settings, family.expects_reply(), family.correlation_key());
            debug!("new connector {} for {}", key, config.id);
            let connector: Arc<dyn Connector> = Arc::new(ChannelConnector::new(
                channel,
                controller,
                family.frame_splitter(),
                settings.clone(),
                logger.clone(),
            ));
            Ok(connector)
        })?;

        let linker = ProtocolLinker::new(family, connector);
        let mut machine = BaseMachine::new(config.id.as_str(), linker, config.units.clone())?
            .with_keep_connect(config.keep_connect)
            .with_logger(logger)
            .with_reply_timeout(settings.timeout)
            .with_concurrent_spans(settings.full_duplex);
        if let Some(endian) = config.endian {
            machine = machine.with_codec(ValueCodec::new(endian));
        }
        if config.combiner == CombinerKind::Single {
            machine = machine.with_single_combiner();
        }
        Ok(machine)
    }
}

/// Append `port` unless the connection names one
fn with_default_port(connection: &str, port: u16) -> String {
    let has_port = match connection.rsplit_once(':') {
        // bare IPv6 addresses contain colons without a port
        Some((host, tail)) => tail.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']')),
        None => false,
    };
    if has_port {
        connection.to_string()
    } else if connection.contains(':') && !connection.starts_with('[') {
        format!("[{}]:{}", connection, port)
    } else {
        format!("{}:{}", connection, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::config::{EmptyConfigProvider, TreeConfigProvider};

    const MACHINES: &str = r#"
machines:
  - id: boiler
    family: modbus-tcp
    connection: 127.0.0.1
    keep_connect: true
    endian: BigEndianLsbWordOrder
    units:
      - { id: level, area: 4X, address: 1, data_type: uint16 }
      - { id: temp, area: 4X, address: 2, data_type: int16, zoom: 0.1, decimal_pos: 1 }
  - id: plc
    family: siemens-tcp
    connection: 10.0.0.5
    rack: 0
    slot: 2
    combiner: single
    units:
      - { id: speed, area: DB1, address: 0, data_type: float32 }
  - id: station
    family: hj212-tcp
    connection: platform.example:9100
    options: { password: "123456", mn: "MN01" }
    units:
      - { id: pm25, area: a34004, address: 0, data_type: float64 }
"#;

    #[test]
    fn test_load_machines() {
        let machines = load_machines(MACHINES).unwrap();
        assert_eq!(machines.len(), 3);
        assert_eq!(machines[0].slave_address, 1);
        assert_eq!(machines[0].endian, Some(Endian::BigEndianLsbWordOrder));
        assert_eq!(machines[0].units[1].zoom, 0.1);
        assert_eq!(machines[0].units[0].name, "");
        assert_eq!(machines[1].slot, 2);
        assert_eq!(machines[1].combiner, CombinerKind::Single);
        assert_eq!(machines[2].options["mn"], "MN01");
        assert_eq!(machines[2].units[0].data_type, DataType::Float64);
    }

    #[test]
    fn test_default_registry() {
        let registry = FamilyRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec![
                "hj212-tcp",
                "modbus-ascii",
                "modbus-ascii-in-tcp",
                "modbus-rtu",
                "modbus-rtu-in-tcp",
                "modbus-tcp",
                "modbus-udp",
                "na200h",
                "siemens-tcp",
            ]
        );

        let family = registry.create(&MachineConfig::new("m", "na200h", "10.0.0.1")).unwrap();
        assert_eq!(family.name(), "na200h");
        assert_eq!(family.translator().translate("M 5", true, false).unwrap().address, 10005);

        let missing = registry.create(&MachineConfig::new("m", "opc-ua", "x"));
        assert!(matches!(missing, Err(FieldbusError::Configuration { .. })));

        let mut bad_slave = MachineConfig::new("m", "modbus-rtu", "COM1");
        bad_slave.slave_address = 250;
        assert!(registry.create(&bad_slave).is_err());

        let no_mn = registry.create(&MachineConfig::new("m", "hj212-tcp", "x").with_option("password", "1"));
        assert!(no_mn.is_err());
    }

    #[tokio::test]
    async fn test_build_machines_share_connectors() {
        let registry = FamilyRegistry::with_defaults();
        let pool = ConnectionPool::new();
        let provider = TreeConfigProvider::from_yaml_str("timeout_ms: 250\n").unwrap();
        let machines = load_machines(MACHINES).unwrap();

        let boiler = registry
            .build_machine(&machines[0], &provider, &pool, CallbackLogger::disabled())
            .unwrap();
        assert!(boiler.utility().keep_connect());
        assert_eq!(boiler.utility().codec().endian(), Endian::BigEndianLsbWordOrder);
        assert_eq!(boiler.utility().linker().connector().connection_token(), "tcp://127.0.0.1:502");

        let mut second = machines[0].clone();
        second.id = "boiler-2".to_string();
        second.slave_address = 2;
        registry
            .build_machine(&second, &EmptyConfigProvider, &pool, CallbackLogger::disabled())
            .unwrap();
        assert_eq!(pool.len(), 1);

        for config in &machines[1..] {
            registry
                .build_machine(config, &provider, &pool, CallbackLogger::disabled())
                .unwrap();
        }
        assert_eq!(pool.len(), 3);
        assert!(pool.get("siemens-tcp@10.0.0.5:102").is_some());
        assert!(pool.get("hj212-tcp@platform.example:9100").is_some());
    }

    #[test]
    fn test_invalid_units_fail_the_build() {
        let registry = FamilyRegistry::with_defaults();
        let config = MachineConfig::new("m", "modbus-tcp", "127.0.0.1")
            .with_units(vec![AddressUnit::new("x", "DB1", 0, DataType::UInt16)]);
        let result = registry.build_machine(&config, &EmptyConfigProvider, &ConnectionPool::new(), CallbackLogger::disabled());
        assert!(matches!(result, Err(FieldbusError::UnknownArea { .. })));

        let pool = ConnectionPool::new();
        let _ = registry.build_machine(&config, &EmptyConfigProvider, &pool, CallbackLogger::disabled());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("10.0.0.1", 502), "10.0.0.1:502");
        assert_eq!(with_default_port("10.0.0.1:1502", 502), "10.0.0.1:1502");
        assert_eq!(with_default_port("plc.local", 102), "plc.local:102");
        assert_eq!(with_default_port("::1", 502), "[::1]:502");
        assert_eq!(with_default_port("[::1]:1502", 502), "[::1]:1502");
    }
}
