//! # Machines
//!
//! A machine is one field device as the scheduler sees it: a set of
//! [`AddressUnit`]s behind one [`ProtocolLinker`].
//!
//! ## Call Flow
//!
//! ```text
//! get_datas(selector)
//!   -> combiner: units -> spans
//!   -> translator: span -> AddressDef
//!   -> family: format_read -> linker: frame, exchange, validate, unframe
//!   -> family: parse_read -> span: decode per unit -> zoom / decimal_pos
//!   -> ReturnStruct<HashMap<key, ReturnUnit>>
//! ```
//!
//! ## Failure Policy
//!
//! Every entry point returns a [`ReturnStruct`]; errors never escape. Each
//! call that does not fully succeed increments the error count, and the
//! third consecutive one drops the connection so the next call starts a
//! fresh session. Without `keep_connect` a call connects, runs and
//! disconnects again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{AddressFormater, AddressFormaterBase, AddressTranslator, AddressUnit};
use crate::codec::{Value, ValueCodec};
use crate::combiner::{AddressCombiner, CommunicationUnit, ContinuousCombiner, SingleCombiner};
use crate::error::{FieldbusError, FieldbusResult};
use crate::linker::ProtocolLinker;
use crate::logging::CallbackLogger;
use crate::protocol::WriteMode;
use crate::utils::format::format_metrics;
use crate::utils::{OperationTimer, PerformanceMetrics};
use crate::DEFAULT_TIMEOUT_MS;

/// Consecutive failed calls after which the connection is dropped
pub const ERROR_THRESHOLD: u32 = 3;

/// Result envelope handed to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStruct<T> {
    pub datas: Option<T>,
    pub is_success: bool,
    /// 0 on success, see [`FieldbusError::error_code`] otherwise
    pub error_code: i32,
    pub error_msg: String,
}

impl<T> ReturnStruct<T> {
    pub fn success(datas: T) -> Self {
        Self {
            datas: Some(datas),
            is_success: true,
            error_code: 0,
            error_msg: String::new(),
        }
    }

    pub fn failure(error: &FieldbusError) -> Self {
        Self {
            datas: None,
            is_success: false,
            error_code: error.error_code(),
            error_msg: error.to_string(),
        }
    }
}

/// Value of one address unit
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnUnit {
    pub unit: AddressUnit,
    /// Decoded wire value
    pub raw_value: Option<Value>,
    /// Wire value after `zoom` and `decimal_pos`
    pub device_value: Option<f64>,
    pub is_success: bool,
    pub error_code: i32,
    pub error_msg: String,
}

impl ReturnUnit {
    fn success(unit: &AddressUnit, raw: Value) -> Self {
        let device_value = scale(&raw, unit);
        Self {
            unit: unit.clone(),
            raw_value: Some(raw),
            device_value: Some(device_value),
            is_success: true,
            error_code: 0,
            error_msg: String::new(),
        }
    }

    fn failure(unit: &AddressUnit, error: &FieldbusError) -> Self {
        Self {
            unit: unit.clone(),
            raw_value: None,
            device_value: None,
            is_success: false,
            error_code: error.error_code(),
            error_msg: error.to_string(),
        }
    }
}

/// Apply `zoom`, then round to `decimal_pos` digits when it is set
fn scale(raw: &Value, unit: &AddressUnit) -> f64 {
    let value = match raw {
        Value::Bool(_) => raw.as_f64(),
        _ => raw.as_f64() * unit.zoom,
    };
    if unit.decimal_pos == 0 || !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(unit.decimal_pos as i32);
    (value * factor).round() / factor
}

/// Inverse of [`scale`] for writes
fn unscale(value: f64, unit: &AddressUnit) -> f64 {
    if unit.zoom == 0.0 || unit.data_type == crate::codec::DataType::Bool {
        value
    } else {
        value / unit.zoom
    }
}

/// Which unit field keys the result and input maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineDataType {
    #[default]
    Id,
    Name,
    CommunicationTag,
    /// Textual address, e.g. `"4X 1"`
    Address,
}

impl MachineDataType {
    pub fn key(&self, unit: &AddressUnit) -> String {
        match self {
            MachineDataType::Id => unit.id.clone(),
            MachineDataType::Name => unit.name.clone(),
            MachineDataType::CommunicationTag => unit.communication_tag.clone(),
            MachineDataType::Address => unit.address_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications published by a machine
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    ConnectionStateChanged { machine: String, state: ConnectionState },
    /// A polled unit changed its device value; keyed by unit id
    DataChanged { machine: String, id: String, value: f64 },
}

/// Handle returned by [`EventHub::subscribe`], required to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Fan-out of machine events to subscribed channels
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<HashMap<u64, UnboundedSender<MachineEvent>>>,
    next_token: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sender: UnboundedSender<MachineEvent>) -> SubscriptionToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(token, sender);
        SubscriptionToken(token)
    }

    /// False when the token was already removed
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.subscribers.lock().remove(&token.0).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every live subscriber, forgetting closed ones
    pub fn emit(&self, event: MachineEvent) {
        self.subscribers
            .lock()
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }
}

/// Connection lifecycle and failure accounting of one device
pub struct BaseUtility {
    id: String,
    linker: ProtocolLinker,
    codec: ValueCodec,
    keep_connect: bool,
    reply_timeout: Duration,
    state: Mutex<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    error_count: AtomicU32,
    metrics: Mutex<PerformanceMetrics>,
    events: EventHub,
    logger: CallbackLogger,
}

impl BaseUtility {
    pub fn new<S: Into<String>>(id: S, linker: ProtocolLinker) -> Self {
        let codec = ValueCodec::new(linker.family().default_endian());
        Self {
            id: id.into(),
            linker,
            codec,
            keep_connect: false,
            reply_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            state: Mutex::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            error_count: AtomicU32::new(0),
            metrics: Mutex::new(PerformanceMetrics::new()),
            events: EventHub::new(),
            logger: CallbackLogger::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn linker(&self) -> &ProtocolLinker {
        &self.linker
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    pub fn keep_connect(&self) -> bool {
        self.keep_connect
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.lock().clone()
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.linker.is_connected()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.events.emit(MachineEvent::ConnectionStateChanged {
                machine: self.id.clone(),
                state,
            });
        }
    }

    /// Token of the calls currently running
    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancel every call in progress; later calls run normally
    pub fn abort(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
        self.logger.warn(&format!("{}: running calls aborted", self.id));
    }

    /// Open the link and run the family's session setup
    pub async fn connect(&self) -> FieldbusResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let cancel = self.cancel_token();
        let family = self.linker.family().clone();
        let token = self.linker.connector().connection_token();

        if !self.linker.connect(&cancel).await {
            self.set_state(ConnectionState::Disconnected);
            let error = if cancel.is_cancelled() {
                FieldbusError::cancelled(format!("connect to {}", token))
            } else {
                FieldbusError::connection(format!("cannot connect to {}", token))
            };
            self.logger.error(&format!("{}: {}", self.id, error));
            return Err(error);
        }

        if let Err(error) = family.handshake(&self.linker, &cancel).await {
            self.linker.disconnect().await;
            self.set_state(ConnectionState::Disconnected);
            self.logger.error(&format!("{}: {} session setup failed: {}", self.id, family.name(), error));
            return Err(error);
        }

        self.set_state(ConnectionState::Connected);
        self.logger.info(&format!("{}: connected to {}", self.id, token));
        Ok(())
    }

    pub async fn disconnect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        let closed = self.linker.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        self.logger.info(&format!("{}: disconnected", self.id));
        closed
    }

    /// Make sure the link is up; true when this call opened it
    async fn prepare(&self) -> FieldbusResult<bool> {
        if self.is_connected() {
            return Ok(false);
        }
        if self.state() == ConnectionState::Connected {
            debug!("{}: link dropped underneath, reconnecting", self.id);
            self.set_state(ConnectionState::Disconnected);
        }
        self.connect().await?;
        Ok(true)
    }

    /// Close a link opened by [`prepare`](Self::prepare) unless connections are kept
    async fn finish(&self, opened: bool) {
        if opened && !self.keep_connect {
            self.disconnect().await;
        }
    }

    fn record_success(&self) {
        self.error_count.store(0, Ordering::Release);
    }

    async fn record_failure(&self, error_code: i32, error_msg: &str) {
        let count = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.logger
            .error(&format!("{}: call failed ({}): {}", self.id, error_code, error_msg));
        if count >= ERROR_THRESHOLD {
            warn!("{}: {} consecutive failures, dropping connection", self.id, count);
            self.logger.warn(&format!(
                "{}: {} consecutive failures, dropping connection",
                self.id, count
            ));
            debug!("{}: {}", self.id, format_metrics(&self.metrics.lock()));
            self.error_count.store(0, Ordering::Release);
            self.disconnect().await;
        }
    }

    /// Account for a finished call and hand its result back
    async fn settle<T>(&self, result: ReturnStruct<T>, timer: OperationTimer) -> ReturnStruct<T> {
        let duration = timer.stop_and_log(result.is_success);
        if result.is_success {
            self.metrics.lock().record_success(duration);
            self.record_success();
        } else {
            self.metrics.lock().record_failure(duration, result.error_code);
            self.record_failure(result.error_code, &result.error_msg).await;
        }
        result
    }

    /// Reply or timeout, for families that always answer
    fn require_reply(&self, reply: Option<Vec<u8>>, operation: &str) -> FieldbusResult<Vec<u8>> {
        match reply {
            Some(reply) => Ok(reply),
            None if !self.linker.family().expects_reply() => Ok(Vec::new()),
            None => Err(FieldbusError::timeout(
                operation,
                self.reply_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Scheduler facing device with its address units
pub struct BaseMachine {
    utility: BaseUtility,
    units: Vec<AddressUnit>,
    translator: Arc<dyn AddressTranslator>,
    formater: Arc<dyn AddressFormater>,
    read_combiner: Box<dyn AddressCombiner>,
    write_combiner: Box<dyn AddressCombiner>,
    concurrent: bool,
    last_values: Mutex<HashMap<String, f64>>,
}

impl BaseMachine {
    /// Machine over `linker`; every unit is checked against the family's translator
    pub fn new<S: Into<String>>(id: S, linker: ProtocolLinker, units: Vec<AddressUnit>) -> FieldbusResult<Self> {
        let translator = linker.family().translator();
        for unit in &units {
            translator.validate_unit(unit)?;
        }
        let mut ids = std::collections::HashSet::new();
        if let Some(duplicate) = units.iter().find(|unit| !ids.insert(unit.id.as_str())) {
            return Err(FieldbusError::configuration(format!(
                "address unit id '{}' is used twice",
                duplicate.id
            )));
        }

        Ok(Self {
            utility: BaseUtility::new(id, linker),
            read_combiner: Box::new(ContinuousCombiner::read(translator.clone())),
            write_combiner: Box::new(ContinuousCombiner::write(translator.clone())),
            translator,
            formater: Arc::new(AddressFormaterBase),
            units,
            concurrent: false,
            last_values: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_keep_connect(mut self, keep_connect: bool) -> Self {
        self.utility.keep_connect = keep_connect;
        self
    }

    pub fn with_codec(mut self, codec: ValueCodec) -> Self {
        self.utility.codec = codec;
        self
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.utility.logger = logger;
        self
    }

    /// Timeout reported when a family that always answers stays silent
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.utility.reply_timeout = timeout;
        self
    }

    /// One span per unit instead of merging neighbours
    pub fn with_single_combiner(mut self) -> Self {
        self.read_combiner = Box::new(SingleCombiner::new(self.translator.clone()));
        self.write_combiner = Box::new(SingleCombiner::new(self.translator.clone()));
        self
    }

    /// Run the spans of one call concurrently, for full duplex links
    pub fn with_concurrent_spans(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn id(&self) -> &str {
        self.utility.id()
    }

    pub fn utility(&self) -> &BaseUtility {
        &self.utility
    }

    pub fn units(&self) -> &[AddressUnit] {
        &self.units
    }

    pub async fn connect(&self) -> ReturnStruct<bool> {
        let timer = OperationTimer::start(format!("{} connect", self.id()));
        let result = match self.utility.connect().await {
            Ok(()) => ReturnStruct::success(true),
            Err(error) => ReturnStruct::failure(&error),
        };
        self.utility.settle(result, timer).await
    }

    pub async fn disconnect(&self) -> ReturnStruct<bool> {
        ReturnStruct::success(self.utility.disconnect().await)
    }

    pub fn is_connected(&self) -> bool {
        self.utility.is_connected()
    }

    pub fn subscribe(&self, sender: UnboundedSender<MachineEvent>) -> SubscriptionToken {
        self.utility.events().subscribe(sender)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.utility.events().unsubscribe(token)
    }

    /// Cancel the calls in progress
    pub fn abort(&self) {
        self.utility.abort()
    }

    /// Read every unit, keyed by `selector`
    ///
    /// A failed span only fails its own units; the envelope reports the
    /// first failure while `datas` still carries every unit.
    pub async fn get_datas(&self, selector: MachineDataType) -> ReturnStruct<HashMap<String, ReturnUnit>> {
        let timer = OperationTimer::start(format!("{} get_datas", self.id()));
        let opened = match self.utility.prepare().await {
            Ok(opened) => opened,
            Err(error) => return self.utility.settle(ReturnStruct::failure(&error), timer).await,
        };
        let result = match self.read_units(selector).await {
            Ok(units) => {
                let first_failure = units.values().find(|unit| !unit.is_success).cloned();
                match first_failure {
                    None => ReturnStruct::success(units),
                    Some(failed) => ReturnStruct {
                        datas: Some(units),
                        is_success: false,
                        error_code: failed.error_code,
                        error_msg: failed.error_msg,
                    },
                }
            }
            Err(error) => ReturnStruct::failure(&error),
        };
        self.utility.finish(opened).await;
        self.utility.settle(result, timer).await
    }

    /// Write `values`, keyed by `selector`, as device values
    pub async fn set_datas(&self, selector: MachineDataType, values: HashMap<String, f64>) -> ReturnStruct<bool> {
        let timer = OperationTimer::start(format!("{} set_datas", self.id()));
        let writes = match self.resolve_writes(selector, &values) {
            Ok(writes) => writes,
            Err(error) => return self.utility.settle(ReturnStruct::failure(&error), timer).await,
        };
        let opened = match self.utility.prepare().await {
            Ok(opened) => opened,
            Err(error) => return self.utility.settle(ReturnStruct::failure(&error), timer).await,
        };
        let result = match self.write_units(writes).await {
            Ok(()) => ReturnStruct::success(true),
            Err(error) => ReturnStruct::failure(&error),
        };
        self.utility.finish(opened).await;
        self.utility.settle(result, timer).await
    }

    /// Read the device clock
    pub async fn get_time(&self) -> ReturnStruct<NaiveDateTime> {
        let timer = OperationTimer::start(format!("{} get_time", self.id()));
        let opened = match self.utility.prepare().await {
            Ok(opened) => opened,
            Err(error) => return self.utility.settle(ReturnStruct::failure(&error), timer).await,
        };
        let linker = self.utility.linker();
        let result = match linker.family().get_time(linker, &self.utility.cancel_token()).await {
            Ok(time) => ReturnStruct::success(time),
            Err(error) => ReturnStruct::failure(&error),
        };
        self.utility.finish(opened).await;
        self.utility.settle(result, timer).await
    }

    /// Set the device clock
    pub async fn set_time(&self, time: NaiveDateTime) -> ReturnStruct<bool> {
        let timer = OperationTimer::start(format!("{} set_time", self.id()));
        let opened = match self.utility.prepare().await {
            Ok(opened) => opened,
            Err(error) => return self.utility.settle(ReturnStruct::failure(&error), timer).await,
        };
        let linker = self.utility.linker();
        let result = match linker.family().set_time(linker, time, &self.utility.cancel_token()).await {
            Ok(()) => ReturnStruct::success(true),
            Err(error) => ReturnStruct::failure(&error),
        };
        self.utility.finish(opened).await;
        self.utility.settle(result, timer).await
    }

    async fn read_units(&self, selector: MachineDataType) -> FieldbusResult<HashMap<String, ReturnUnit>> {
        let family = self.utility.linker().family();
        let spans = self
            .read_combiner
            .combine(&self.units, family.max_span_bytes(true))?;
        let cancel = self.utility.cancel_token();

        let results: Vec<FieldbusResult<Vec<u8>>> = if self.concurrent {
            join_all(spans.iter().map(|span| self.read_span(span, &cancel))).await
        } else {
            let mut results = Vec::with_capacity(spans.len());
            let mut fatal: Option<FieldbusError> = None;
            for span in &spans {
                let result = match &fatal {
                    Some(error) => Err(error.clone()),
                    None => self.read_span(span, &cancel).await,
                };
                if let Err(error) = &result {
                    // later spans would only wait out the same dead link
                    if error.is_transport_error() || matches!(error, FieldbusError::Cancelled { .. }) {
                        fatal = Some(error.clone());
                    }
                }
                results.push(result);
            }
            results
        };

        let mut units = HashMap::with_capacity(self.units.len());
        for (span, result) in spans.iter().zip(results) {
            match result {
                Ok(data) => {
                    for (unit, value) in span.decode_units(&data, self.utility.codec()) {
                        let entry = match value {
                            Ok(raw) => ReturnUnit::success(unit, raw),
                            Err(error) => ReturnUnit::failure(unit, &error),
                        };
                        if let Some(value) = entry.device_value {
                            self.publish_value(unit, value);
                        }
                        units.insert(selector.key(unit), entry);
                    }
                }
                Err(error) => {
                    debug!("{}: span {} {} failed: {}", self.id(), span.area, span.address, error);
                    for mapping in &span.mappings {
                        units.insert(selector.key(&mapping.unit), ReturnUnit::failure(&mapping.unit, &error));
                    }
                }
            }
        }
        Ok(units)
    }

    fn publish_value(&self, unit: &AddressUnit, value: f64) {
        let changed = {
            let mut last = self.last_values.lock();
            match last.insert(unit.id.clone(), value) {
                Some(previous) => previous.to_bits() != value.to_bits(),
                None => true,
            }
        };
        if changed {
            self.utility.events().emit(MachineEvent::DataChanged {
                machine: self.id().to_string(),
                id: unit.id.clone(),
                value,
            });
        }
    }

    async fn read_span(&self, span: &CommunicationUnit, cancel: &CancellationToken) -> FieldbusResult<Vec<u8>> {
        let linker = self.utility.linker();
        let family = linker.family();
        let text = self.formater.format(&span.area, span.address, 0);
        let def = self.translator.translate(&text, true, span.count == 1)?;

        let request = family.format_read(&def, span.count)?;
        let reply = linker.send_receive(&request, cancel).await?;
        let payload = self.utility.require_reply(reply, &format!("read {}", text))?;
        family.parse_read(&payload, &def, span.count)
    }

    fn resolve_writes(
        &self,
        selector: MachineDataType,
        values: &HashMap<String, f64>,
    ) -> FieldbusResult<Vec<(AddressUnit, f64)>> {
        let by_key: HashMap<String, &AddressUnit> =
            self.units.iter().map(|unit| (selector.key(unit), unit)).collect();
        let mut writes = Vec::with_capacity(values.len());
        for (key, value) in values {
            let unit = by_key.get(key).ok_or_else(|| FieldbusError::unknown_tag(key.as_str()))?;
            writes.push(((*unit).clone(), unscale(*value, unit)));
        }
        writes.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        Ok(writes)
    }

    async fn write_units(&self, writes: Vec<(AddressUnit, f64)>) -> FieldbusResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let linker = self.utility.linker();
        let family = linker.family();
        let cancel = self.utility.cancel_token();

        if family.write_mode() == WriteMode::Record {
            let record = family.format_record(&writes, Local::now())?;
            let reply = linker.send_receive(&record, &cancel).await?;
            self.utility.require_reply(reply, "upload record")?;
            return Ok(());
        }

        let units: Vec<AddressUnit> = writes.iter().map(|(unit, _)| unit.clone()).collect();
        let values: HashMap<String, f64> = writes
            .into_iter()
            .map(|(unit, value)| (unit.id, value))
            .collect();
        let spans = self
            .write_combiner
            .combine(&units, family.max_span_bytes(false))?;

        if self.concurrent {
            let results = join_all(spans.iter().map(|span| self.write_span(span, &values, &cancel))).await;
            return results.into_iter().collect::<FieldbusResult<Vec<()>>>().map(|_| ());
        }
        for span in &spans {
            self.write_span(span, &values, &cancel).await?;
        }
        Ok(())
    }

    async fn write_span(
        &self,
        span: &CommunicationUnit,
        values: &HashMap<String, f64>,
        cancel: &CancellationToken,
    ) -> FieldbusResult<()> {
        let linker = self.utility.linker();
        let family = linker.family();
        let codec = self.utility.codec();
        let text = self.formater.format(&span.area, span.address, 0);
        let def = self.translator.translate(&text, false, span.count == 1)?;

        let request = match span.bit_in_element() {
            Some(sub) if family.supports_bit_write() => {
                let on = span
                    .mappings
                    .first()
                    .and_then(|mapping| values.get(&mapping.unit.id))
                    .map(|value| *value != 0.0)
                    .ok_or_else(|| FieldbusError::internal(format!("no value for {}", text)))?;
                family.format_write(&def, 1, &[on as u8], Some(sub))?
            }
            Some(_) => {
                // read the element back so the other bits survive the write
                let mut element = self.read_span(span, cancel).await?;
                let written = span.encode_units(values, codec)?;
                let sub = span.mappings[0].unit.sub_address;
                let on = codec.get_element_bit(&written, sub)?;
                element.truncate(span.byte_len());
                codec.set_element_bit(&mut element, sub, on)?;
                family.format_write(&def, span.count, &element, None)?
            }
            None => {
                let data = span.encode_units(values, codec)?;
                family.format_write(&def, span.count, &data, None)?
            }
        };

        let reply = linker.send_receive(&request, cancel).await?;
        let payload = self.utility.require_reply(reply, &format!("write {}", text))?;
        if family.expects_reply() {
            family.parse_write(&payload, &def)?;
        }
        Ok(())
    }
}
