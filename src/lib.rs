//! # Voltage Fieldbus - Unified Field Device Access
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.4.0
//! **License:** MIT
//!
//! Address/value access to industrial field devices behind one machine
//! abstraction. Callers describe points as textual addresses (`"4X 1"`,
//! `"DB1 4"`, `"M 2.3"`) with a data type and scaling; the library turns
//! them into batched protocol requests, exchanges frames over TCP, UDP or
//! serial links and hands back engineering values.
//!
//! ## Supported Families
//!
//! | Family | Transport | Framing | Replies |
//! |--------|-----------|---------|---------|
//! | `modbus-tcp` / `modbus-udp` | TCP / UDP | MBAP | ✅ |
//! | `modbus-rtu` / `modbus-rtu-in-tcp` | Serial / TCP | CRC16 | ✅ |
//! | `modbus-ascii` / `modbus-ascii-in-tcp` | Serial / TCP | LRC | ✅ |
//! | `na200h` | TCP | MBAP | ✅ |
//! | `siemens-tcp` | TCP | TPKT/COTP/S7 | ✅ |
//! | `hj212-tcp` | TCP | `##` + CRC | ❌ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use voltage_fieldbus::*;
//!
//! #[tokio::main]
//! async fn main() -> FieldbusResult<()> {
//!     let units = vec![
//!         AddressUnit::new("level", "4X", 1, DataType::UInt16),
//!         AddressUnit::new("temp", "4X", 2, DataType::Int16).with_zoom(0.1),
//!     ];
//!     let config = MachineConfig::new("boiler", "modbus-tcp", "127.0.0.1:502").with_units(units);
//!
//!     let registry = FamilyRegistry::with_defaults();
//!     let pool = ConnectionPool::new();
//!     let machine = registry.build_machine(&config, &EmptyConfigProvider, &pool, CallbackLogger::console())?;
//!
//!     let result = machine.get_datas(MachineDataType::Id).await;
//!     if let Some(datas) = result.datas {
//!         println!("level = {:?}", datas["level"].device_value);
//!     }
//!
//!     machine.set_datas(MachineDataType::Id, HashMap::from([("level".to_string(), 42.0)])).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Application   │    │ Machine Config  │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   BaseMachine   │◄───│ Family Registry │
//! │ (combine/scale) │    └─────────────────┘
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ ProtocolLinker  │◄──►│ ProtocolFamily  │
//! │ (frame checks)  │    │ (Modbus/S7/212) │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Connector     │◄──►│   Controller    │
//! │  (pooled I/O)   │    │ (FIFO / match)  │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ TCP / UDP / COM │
//! └─────────────────┘
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Logging system for the library
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

/// Typed value encoding with configurable byte order
pub mod codec;

/// Address units, address parsing and per-family translators
pub mod address;

/// Batching of address units into communication units
pub mod combiner;

/// Channel settings and configuration providers
pub mod config;

/// Request/response pairing strategies
pub mod controller;

/// Byte channels, frame splitting and pooled connectors
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod connector;

/// Protocol-aware framing on top of a connector
pub mod linker;

/// Protocol families: Modbus, Siemens S7 and HJ212
pub mod protocol;

/// Machines: the scheduler facing device abstraction
pub mod machine;

/// Declarative machine construction
pub mod registry;

/// Utility functions and performance monitoring
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod utils;

// Re-export main types for convenience
pub use address::{AddressDef, AddressTranslator, AddressUnit, GenericTranslator, ModbusTranslator, Na200hTranslator, SiemensTranslator};
pub use codec::{BitOrder, DataType, Endian, Value, ValueCodec};
pub use combiner::{AddressCombiner, CommunicationUnit, ContinuousCombiner, SingleCombiner};
pub use config::{ChannelSettings, ConfigProvider, EmptyConfigProvider, Parity, TreeConfigProvider};
pub use connector::{ChannelConnector, ConnectionPool, Connector, FrameSplitter, TransportStats};
pub use controller::{Controller, FifoController, MatchController, NoResponseController};
pub use error::{FieldbusError, FieldbusResult};
pub use linker::ProtocolLinker;
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use machine::{BaseMachine, ConnectionState, MachineDataType, MachineEvent, ReturnStruct, ReturnUnit, SubscriptionToken};
pub use protocol::hj212::{Hj212Family, Hj212Record, Hj212Value};
pub use protocol::modbus::{ModbusFamily, ModbusType};
pub use protocol::siemens::{ConnectionType, SiemensFamily};
pub use protocol::{ProtocolFamily, TransportKind, WriteMode};
pub use registry::{load_machines, CombinerKind, FamilyRegistry, MachineConfig};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Fieldbus v{} - Modbus, Siemens S7 and HJ212 device access by Evan Liu", VERSION)
}
