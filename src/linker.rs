//! Framing layer between protocol units and the connector.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connector::Connector;
use crate::error::{FieldbusError, FieldbusResult};
use crate::protocol::{ProtocolFamily, ProtocolUnit};

/// Owns one connector and applies a family's framing around every exchange
pub struct ProtocolLinker {
    family: Arc<dyn ProtocolFamily>,
    connector: Arc<dyn Connector>,
}

impl ProtocolLinker {
    pub fn new(family: Arc<dyn ProtocolFamily>, connector: Arc<dyn Connector>) -> Self {
        Self { family, connector }
    }

    pub fn family(&self) -> &Arc<dyn ProtocolFamily> {
        &self.family
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub async fn connect(&self, cancel: &CancellationToken) -> bool {
        self.connector.connect(cancel).await
    }

    pub async fn disconnect(&self) -> bool {
        self.connector.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    pub fn bytes_extend(&self, payload: &[u8]) -> FieldbusResult<Vec<u8>> {
        self.family.extend_bytes(payload)
    }

    pub fn bytes_decact(&self, frame: &[u8]) -> FieldbusResult<Vec<u8>> {
        self.family.contract_bytes(frame)
    }

    pub fn check_right(&self, frame: Option<&[u8]>) -> FieldbusResult<Option<bool>> {
        self.family.check_right(frame)
    }

    /// Frame `content`, exchange it and return the unframed reply
    pub async fn send_receive(&self, content: &[u8], cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>> {
        let frame = self.bytes_extend(content)?;
        match self.exchange(&frame, cancel).await? {
            Some(reply) => Ok(Some(self.bytes_decact(&reply)?)),
            None => Ok(None),
        }
    }

    /// Exchange an already complete frame and return the raw reply
    pub async fn send_receive_raw(&self, frame: &[u8], cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>> {
        self.exchange(frame, cancel).await
    }

    /// Format, exchange and parse one protocol unit
    pub async fn send_receive_unit<U>(
        &self,
        unit: &U,
        input: &U::Input,
        cancel: &CancellationToken,
    ) -> FieldbusResult<Option<U::Output>>
    where
        U: ProtocolUnit + Sync,
        U::Input: Sync,
    {
        let content = unit.format(input)?;
        let reply = if unit.is_special() {
            self.send_receive_raw(&content, cancel).await?
        } else {
            self.send_receive(&content, cancel).await?
        };
        match reply {
            Some(reply) => {
                let mut cursor = 0;
                Ok(Some(unit.unformat(&reply, &mut cursor)?))
            }
            None => Ok(None),
        }
    }

    async fn exchange(&self, frame: &[u8], cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>> {
        let reply = match self.connector.send_msg(frame, cancel).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };

        match self.check_right(reply.as_deref()) {
            Ok(None) => Ok(None),
            Ok(Some(true)) => Ok(reply),
            Ok(Some(false)) => {
                self.connector.disconnect().await;
                Err(FieldbusError::frame(format!(
                    "{} rejected a malformed reply",
                    self.family.name()
                )))
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn fail(&self, error: FieldbusError) -> FieldbusError {
        if error.forces_disconnect() {
            debug!("{}: dropping link after {}", self.family.name(), error);
            self.connector.disconnect().await;
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::TransportStats;
    use crate::protocol::modbus::{crc16, ModbusFamily, ModbusType};
    use crate::protocol::siemens::{CreateReferenceSiemensInputStruct, CreateReferenceSiemensProtocol, SiemensFamily};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every message with the same canned reply
    struct CannedConnector {
        reply: Option<Vec<u8>>,
        sent: Mutex<Vec<Vec<u8>>>,
        disconnects: AtomicUsize,
    }

    impl CannedConnector {
        fn new(reply: Option<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                sent: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector for CannedConnector {
        fn connection_token(&self) -> String {
            "canned".to_string()
        }

        async fn connect(&self, _cancel: &CancellationToken) -> bool {
            true
        }

        async fn disconnect(&self) -> bool {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn send_msg(&self, message: &[u8], _cancel: &CancellationToken) -> FieldbusResult<Option<Vec<u8>>> {
            self.sent.lock().push(message.to_vec());
            Ok(self.reply.clone())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn rtu_linker(connector: Arc<CannedConnector>) -> ProtocolLinker {
        ProtocolLinker::new(Arc::new(ModbusFamily::new(ModbusType::Rtu, 1)), connector)
    }

    #[tokio::test]
    async fn test_send_receive_frames_both_ways() {
        let reply = vec![0x01, 0x03, 0x02, 0x00, 0x0A, 0x38, 0x43];
        let connector = CannedConnector::new(Some(reply));
        let linker = rtu_linker(connector.clone());

        let payload = linker
            .send_receive(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload, Some(vec![0x01, 0x03, 0x02, 0x00, 0x0A]));
        assert_eq!(
            connector.sent.lock()[0],
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_reply_is_not_an_error() {
        let connector = CannedConnector::new(None);
        let linker = rtu_linker(connector.clone());
        let reply = linker.send_receive(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], &CancellationToken::new()).await;
        assert_eq!(reply.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checksum_failure_drops_the_link() {
        let mut reply = vec![0x01, 0x03, 0x02, 0x00, 0x0A];
        reply.extend_from_slice(&crc16(&reply).to_le_bytes());
        reply[4] ^= 0x01;
        let connector = CannedConnector::new(Some(reply));
        let linker = rtu_linker(connector.clone());

        let err = linker
            .send_receive(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), 501);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exception_keeps_the_link() {
        let connector = CannedConnector::new(Some(vec![0x01, 0x83, 0x02, 0xC0, 0xF1]));
        let linker = rtu_linker(connector.clone());

        let err = linker
            .send_receive(&[0x01, 0x03, 0x00, 0x64, 0x00, 0x01], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), 2);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_reply_drops_the_link() {
        let connector = CannedConnector::new(Some(vec![0x01, 0x83, 0xC0]));
        let linker = rtu_linker(connector.clone());

        let err = linker
            .send_receive(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FieldbusError::Frame { .. }));
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_special_units_skip_framing() {
        let family = SiemensFamily::new(0, 1);
        let input = CreateReferenceSiemensInputStruct {
            local_tsap: family.local_tsap(),
            remote_tsap: family.remote_tsap(),
        };
        let mut confirm = CreateReferenceSiemensProtocol.format(&input).unwrap();
        confirm[5] = 0xD0;
        let connector = CannedConnector::new(Some(confirm));
        let linker = ProtocolLinker::new(Arc::new(family), connector.clone());

        let result = linker
            .send_receive_unit(&CreateReferenceSiemensProtocol, &input, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, Some(()));
        // the connection request goes out without a TPKT/COTP data header in front
        assert_eq!(connector.sent.lock()[0][5], 0xE0);
        assert_eq!(connector.sent.lock()[0].len(), 22);
    }
}
