//! Integration Tests for Voltage Fieldbus Library
//!
//! These tests drive complete machines (registry, linker, connector and
//! family working together) against simulated devices, either over a
//! local TCP socket or an in-memory channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_test::assert_ok;

use voltage_fieldbus::connector::{BoxedReader, BoxedWriter, Channel};
use voltage_fieldbus::protocol::hj212::{self, WriteRecordHj212Protocol};
use voltage_fieldbus::protocol::modbus::{crc16, lrc};
use voltage_fieldbus::protocol::ProtocolUnit;
use voltage_fieldbus::utils::init_test_logger;
use voltage_fieldbus::*;

type Handler = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// In-memory device: every chunk written by the connector goes through `handler`
struct SimDevice {
    handler: Handler,
    opens: AtomicUsize,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SimDevice {
    fn new(handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            opens: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Channel for SimDevice {
    async fn open(&self) -> FieldbusResult<(BoxedReader, BoxedWriter)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (client, device) = tokio::io::duplex(4096);
        let handler = self.handler.clone();
        let requests = self.requests.clone();
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(device);
            let mut buf = [0u8; 1024];
            loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                requests.lock().push(buf[..n].to_vec());
                if let Some(reply) = handler(&buf[..n]) {
                    if wr.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        let (reader, writer) = tokio::io::split(client);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        "sim://device".to_string()
    }
}

fn with_crc(payload: &[u8]) -> Vec<u8> {
    let mut frame = payload.to_vec();
    frame.extend_from_slice(&crc16(payload).to_le_bytes());
    frame
}

/// Answer one Modbus PDU (unit id first) against a register table
fn answer_modbus(request: &[u8], registers: &Mutex<Vec<u16>>) -> Vec<u8> {
    let (unit, function) = (request[0], request[1]);
    let start = u16::from_be_bytes([request[2], request[3]]) as usize;
    let value = u16::from_be_bytes([request[4], request[5]]);
    let mut registers = registers.lock();
    match function {
        0x03 | 0x04 if start + value as usize <= registers.len() => {
            let mut reply = vec![unit, function, (value * 2) as u8];
            for register in &registers[start..start + value as usize] {
                reply.extend_from_slice(&register.to_be_bytes());
            }
            reply
        }
        0x06 if start < registers.len() => {
            registers[start] = value;
            request[..6].to_vec()
        }
        0x10 if start + value as usize <= registers.len() => {
            for (i, pair) in request[7..].chunks(2).enumerate() {
                registers[start + i] = u16::from_be_bytes([pair[0], pair[1]]);
            }
            request[..6].to_vec()
        }
        _ => vec![unit, function | 0x80, 0x02],
    }
}

/// Modbus TCP server on an ephemeral port; register `n` starts at `n + 10`
async fn spawn_modbus_tcp_server() -> (u16, Arc<Mutex<Vec<u16>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let registers = Arc::new(Mutex::new((0..100u16).map(|n| n + 10).collect::<Vec<_>>()));
    let table = registers.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let table = table.clone();
            tokio::spawn(async move {
                let mut pending = Vec::new();
                let mut chunk = [0u8; 512];
                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&chunk[..n]);
                    while pending.len() >= 6 {
                        let length = u16::from_be_bytes([pending[4], pending[5]]) as usize + 6;
                        if pending.len() < length {
                            break;
                        }
                        let frame: Vec<u8> = pending.drain(..length).collect();
                        let pdu = answer_modbus(&frame[6..], &table);
                        let mut reply = frame[..4].to_vec();
                        reply.extend_from_slice(&(pdu.len() as u16).to_be_bytes());
                        reply.extend_from_slice(&pdu);
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (port, registers)
}

fn rtu_machine(device: Arc<SimDevice>, units: Vec<AddressUnit>) -> BaseMachine {
    let settings = ChannelSettings::default().with_timeout(Duration::from_millis(150));
    let connector = ChannelConnector::new(
        device,
        Arc::new(FifoController::new(settings.max_pending)),
        FrameSplitter::ModbusRtu,
        settings,
        CallbackLogger::disabled(),
    );
    let linker = ProtocolLinker::new(Arc::new(ModbusFamily::new(ModbusType::Rtu, 1)), Arc::new(connector));
    BaseMachine::new("rtu-device", linker, units)
        .unwrap()
        .with_reply_timeout(Duration::from_millis(150))
}

#[test]
fn test_checksum_vectors() {
    let vectors: [(&[u8], [u8; 2]); 5] = [
        (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], [0xC4, 0x0B]),
        (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], [0x31, 0xCA]),
        (&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03], [0x98, 0x0B]),
        (&[0x11, 0x06, 0x00, 0x01, 0x00, 0x03], [0x9A, 0x9B]),
        (&[0x01, 0x01, 0x00, 0x13, 0x00, 0x25], [0x0C, 0x14]),
    ];
    for (frame, expected) in vectors {
        assert_eq!(crc16(frame).to_le_bytes(), expected, "CRC of {:02X?}", frame);
    }

    assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0xFA);
    assert_eq!(hj212::crc16(b"QN=1;CP=&&&&"), 0x6900);
}

#[tokio::test]
async fn test_modbus_tcp_machine_from_yaml() {
    init_test_logger();
    let (port, registers) = spawn_modbus_tcp_server().await;
    let yaml = format!(
        r#"
machines:
  - id: boiler
    family: modbus-tcp
    connection: "127.0.0.1:{port}"
    units:
      - {{ id: level, area: 4X, address: 1, data_type: uint16 }}
      - {{ id: temp, area: 4X, address: 2, data_type: int16, zoom: 0.1, decimal_pos: 1 }}
      - {{ id: missing, area: 4X, address: 1001, data_type: uint16 }}
"#
    );
    let configs = assert_ok!(load_machines(&yaml));
    let provider = assert_ok!(TreeConfigProvider::from_yaml_str("timeout_ms: 1000\n"));
    let pool = ConnectionPool::new();
    let machine = FamilyRegistry::with_defaults()
        .build_machine(&configs[0], &provider, &pool, CallbackLogger::disabled())
        .unwrap();

    let result = machine.get_datas(MachineDataType::Id).await;
    let datas = result.datas.unwrap();
    assert_eq!(datas["level"].device_value, Some(10.0));
    assert_eq!(datas["temp"].device_value, Some(1.1));
    // the out-of-range span fails alone
    assert!(!datas["missing"].is_success);
    assert_eq!(datas["missing"].error_code, 2);
    assert!(!result.is_success);
    assert_eq!(result.error_code, 2);

    let written = machine
        .set_datas(MachineDataType::Id, HashMap::from([("temp".to_string(), 25.5)]))
        .await;
    assert!(written.is_success, "{}", written.error_msg);
    assert_eq!(registers.lock()[1], 255);

    let reread = machine.get_datas(MachineDataType::Id).await.datas.unwrap();
    assert_eq!(reread["temp"].device_value, Some(25.5));
    // machines without keep_connect close the link after each call
    assert!(!machine.is_connected());
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_rtu_read_through_channel() {
    let device = SimDevice::new(Arc::new(|request: &[u8]| -> Option<Vec<u8>> {
        if request[1] == 0x03 {
            Some(with_crc(&[0x01, 0x03, 0x04, 0x00, 0xAB, 0x00, 0xCD]))
        } else {
            None
        }
    }));
    let machine = rtu_machine(
        device.clone(),
        vec![
            AddressUnit::new("a", "4X", 1, DataType::UInt16),
            AddressUnit::new("b", "4X", 2, DataType::UInt16),
        ],
    );

    let result = machine.get_datas(MachineDataType::Id).await;
    assert!(result.is_success, "{}", result.error_msg);
    let datas = result.datas.unwrap();
    assert_eq!(datas["a"].device_value, Some(171.0));
    assert_eq!(datas["b"].device_value, Some(205.0));
    assert_eq!(device.requests.lock()[0], vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
}

#[tokio::test]
async fn test_rtu_corrupted_reply_reports_crc_error() {
    let device = SimDevice::new(Arc::new(|_: &[u8]| -> Option<Vec<u8>> {
        let mut reply = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x0A]);
        reply[3] ^= 0x10;
        Some(reply)
    }));
    let machine = rtu_machine(device, vec![AddressUnit::new("a", "4X", 1, DataType::UInt16)]);

    let result = machine.get_datas(MachineDataType::Id).await;
    assert!(!result.is_success);
    assert_eq!(result.error_code, 501);
    assert!(!machine.is_connected());
}

#[tokio::test]
async fn test_rtu_exception_reply() {
    let device = SimDevice::new(Arc::new(|_: &[u8]| -> Option<Vec<u8>> { Some(with_crc(&[0x01, 0x90, 0x02])) }));
    let machine = rtu_machine(device, vec![AddressUnit::new("a", "4X", 1, DataType::Float32)]);

    let result = machine
        .set_datas(MachineDataType::Id, HashMap::from([("a".to_string(), 1.5)]))
        .await;
    assert!(!result.is_success);
    assert_eq!(result.error_code, 2);
    assert_eq!(machine.utility().metrics().failed_requests, 1);
}

#[tokio::test]
async fn test_silent_device_times_out_and_reconnects() {
    let device = SimDevice::new(Arc::new(|_: &[u8]| -> Option<Vec<u8>> { None }));
    let machine = rtu_machine(device.clone(), vec![AddressUnit::new("a", "4X", 1, DataType::UInt16)])
        .with_keep_connect(true);

    assert!(machine.connect().await.is_success);
    for _ in 0..3 {
        let result = machine.get_datas(MachineDataType::Id).await;
        assert!(!result.is_success);
    }
    // the third consecutive failure drops the kept connection
    assert!(!machine.is_connected());
    assert_eq!(machine.utility().error_count(), 0);

    let _ = machine.get_datas(MachineDataType::Id).await;
    assert_eq!(device.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_siemens_handshake_and_read() {
    fn tpkt(pdu: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x03, 0x00];
        frame.extend_from_slice(&((pdu.len() + 7) as u16).to_be_bytes());
        frame.extend_from_slice(&[0x02, 0xF0, 0x80]);
        frame.extend_from_slice(pdu);
        frame
    }

    fn ack(request: &[u8], params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut pdu = vec![0x32, 0x03, 0x00, 0x00, request[11], request[12]];
        pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&[0x00, 0x00]);
        pdu.extend_from_slice(params);
        pdu.extend_from_slice(data);
        tpkt(&pdu)
    }

    let device = SimDevice::new(Arc::new(|request: &[u8]| -> Option<Vec<u8>> {
        if request[5] == 0xE0 {
            let mut confirm = request.to_vec();
            confirm[5] = 0xD0;
            return Some(confirm);
        }
        match request[17] {
            0xF0 => Some(ack(request, &[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0], &[])),
            0x04 => Some(ack(request, &[0x04, 0x01], &[0xFF, 0x04, 0x00, 0x10, 0x01, 0x2C])),
            _ => None,
        }
    }));

    let family = Arc::new(SiemensFamily::new(0, 1));
    let settings = ChannelSettings::default().with_timeout(Duration::from_millis(200));
    let connector = ChannelConnector::new(
        device.clone(),
        Arc::new(FifoController::new(settings.max_pending)),
        family.frame_splitter(),
        settings,
        CallbackLogger::disabled(),
    );
    let linker = ProtocolLinker::new(family.clone(), Arc::new(connector));
    let machine = BaseMachine::new("plc", linker, vec![AddressUnit::new("speed", "DB1", 4, DataType::Int16)])
        .unwrap()
        .with_keep_connect(true);

    let connected = machine.connect().await;
    assert!(connected.is_success, "{}", connected.error_msg);
    assert_eq!(family.pdu_length(), 480);

    let result = machine.get_datas(MachineDataType::Id).await;
    assert!(result.is_success, "{}", result.error_msg);
    assert_eq!(result.datas.unwrap()["speed"].device_value, Some(300.0));

    let requests = device.requests.lock();
    assert_eq!(requests[0].len(), 22);
    // read item: byte transport, 2 bytes of DB1 from bit address 32
    assert_eq!(
        &requests[2][19..],
        &[0x12, 0x0A, 0x10, 0x02, 0x00, 0x02, 0x00, 0x01, 0x84, 0x00, 0x00, 0x20]
    );
}

#[tokio::test]
async fn test_hj212_upload_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut frame = Vec::new();
        let mut chunk = [0u8; 512];
        while !frame.ends_with(b"\r\n") {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "uploader closed before a full frame");
            frame.extend_from_slice(&chunk[..n]);
        }
        frame
    });

    let config = MachineConfig::new("station", "hj212-tcp", format!("127.0.0.1:{}", port))
        .with_option("password", "123456")
        .with_option("mn", "010000A8900016F000169DC0")
        .with_units(vec![
            AddressUnit::new("pm25", "a34004", 0, DataType::Float64).with_decimal_pos(1),
            AddressUnit::new("so2", "a21026", 0, DataType::Float64).with_decimal_pos(2),
        ]);
    let pool = ConnectionPool::new();
    let machine = FamilyRegistry::with_defaults()
        .build_machine(&config, &EmptyConfigProvider, &pool, CallbackLogger::disabled())
        .unwrap();

    let result = machine
        .set_datas(
            MachineDataType::Id,
            HashMap::from([("pm25".to_string(), 35.27), ("so2".to_string(), 0.5)]),
        )
        .await;
    assert!(result.is_success, "{}", result.error_msg);

    let frame = tokio::time::timeout(Duration::from_secs(2), received).await.unwrap().unwrap();
    let family = Hj212Family::new("123456", "010000A8900016F000169DC0");
    assert_eq!(assert_ok!(family.check_right(Some(&frame))), Some(true));
    let segment = assert_ok!(family.contract_bytes(&frame));
    let record = assert_ok!(WriteRecordHj212Protocol.unformat(&segment, &mut 0));
    assert_eq!(record.cn, "2011");
    assert_eq!(record.mn, "010000A8900016F000169DC0");
    let pm25 = record.values.iter().find(|v| v.code == "a34004").unwrap();
    assert_eq!(pm25.value, 35.3);
    let so2 = record.values.iter().find(|v| v.code == "a21026").unwrap();
    assert_eq!(so2.value, 0.5);
}

#[tokio::test]
async fn test_unknown_family_and_bad_units() {
    let registry = FamilyRegistry::with_defaults();
    let pool = ConnectionPool::new();

    let unknown = MachineConfig::new("m", "profibus", "127.0.0.1");
    let err = registry
        .build_machine(&unknown, &EmptyConfigProvider, &pool, CallbackLogger::disabled())
        .err()
        .unwrap();
    assert!(err.is_configuration_error());

    let bad_area = MachineConfig::new("m", "modbus-tcp", "127.0.0.1")
        .with_units(vec![AddressUnit::new("x", "9X", 1, DataType::UInt16)]);
    let err = registry
        .build_machine(&bad_area, &EmptyConfigProvider, &pool, CallbackLogger::disabled())
        .err()
        .unwrap();
    assert_eq!(err.error_code(), -11);
    assert!(pool.is_empty());

    for (family, unit) in [
        ("modbus-tcp", AddressUnit::new("x", "4X", 65537, DataType::UInt16)),
        ("siemens-tcp", AddressUnit::new("x", "DB1", 2_097_152, DataType::UInt16)),
    ] {
        let out_of_range = MachineConfig::new("m", family, "127.0.0.1").with_units(vec![unit]);
        let err = registry
            .build_machine(&out_of_range, &EmptyConfigProvider, &pool, CallbackLogger::disabled())
            .err()
            .unwrap();
        assert_eq!(err.error_code(), -10, "{}", family);
    }
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_half_duplex_pairs_replies_in_send_order() {
    let device = SimDevice::new(Arc::new(|request: &[u8]| -> Option<Vec<u8>> {
        let mut reply = b"re:".to_vec();
        reply.extend_from_slice(request);
        Some(reply)
    }));
    let settings = ChannelSettings::default().with_timeout(Duration::from_millis(500));
    let connector = ChannelConnector::new(
        device.clone(),
        Arc::new(FifoController::new(settings.max_pending)),
        FrameSplitter::Delimited {
            start: None,
            end: b"\n".to_vec(),
        },
        settings,
        CallbackLogger::disabled(),
    );
    let cancel = tokio_util::sync::CancellationToken::new();
    assert!(connector.connect(&cancel).await);

    let messages: Vec<Vec<u8>> = (b'a'..=b'e').map(|c| vec![c, b'\n']).collect();
    let replies = futures::future::join_all(messages.iter().map(|m| connector.send_msg(m, &cancel))).await;

    for (message, reply) in messages.iter().zip(replies) {
        let reply = assert_ok!(reply).unwrap();
        assert_eq!(&reply[3..], message.as_slice());
    }
    // the gate keeps one request on the wire at a time
    let seen = device.requests.lock();
    assert_eq!(seen.len(), messages.len());
    assert!(seen.iter().all(|chunk| chunk.len() == 2));
    assert_eq!(connector.get_stats().requests_sent, 5);
}
