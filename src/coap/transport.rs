//! Plain-CoAP transport over UDP.
//!
//! Speaks confirmable CoAP to the device: `GET sys/dev/status` returns the
//! shadow-style `{"state":{"reported":{...}}}` document together with the
//! Max-Age cache hint, `POST sys/dev/control` pushes a
//! `{"state":{"desired":{...}}}` document. Requests are retransmitted with the
//! protocol's doubling timeout; separate (non-piggybacked) responses are
//! acknowledged and awaited. One exchange is in flight per session (NSTART=1),
//! so status polls and control writes on the same socket cannot interleave.

use super::{CoapClient, CoapConnector, CoapError};
use crate::device::{RawStatus, RawValue};
use async_trait::async_trait;
use coap_lite::{CoapOption, CoapRequest, MessageClass, MessageType, Packet, RequestType, ResponseType};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tracing::debug;

pub const DEFAULT_COAP_PORT: u16 = 5683;

const STATUS_PATH: &str = "sys/dev/status";
const CONTROL_PATH: &str = "sys/dev/control";

const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RETRANSMIT: u32 = 4;
const PING_RETRANSMIT: u32 = 2;
/// Grace period for a separate response after the peer acknowledged.
const SEPARATE_RESPONSE_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_AGE: u64 = 60;
const MAX_MESSAGE_SIZE: usize = 1152;
/// Content-Format code for application/json.
const CONTENT_FORMAT_JSON: u8 = 50;

struct ExchangeIds {
    message_id: u16,
    token: u16,
}

pub struct UdpCoapClient {
    socket: UdpSocket,
    /// Held for a whole request/response exchange: NSTART=1.
    exchange: Mutex<ExchangeIds>,
    open: AtomicBool,
}

impl UdpCoapClient {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            exchange: Mutex::new(ExchangeIds {
                message_id: 0,
                token: 0,
            }),
            open: AtomicBool::new(true),
        }
    }

    /// CoAP ping: an Empty confirmable message the peer answers with Reset.
    /// Confirms the device is reachable before the session is handed out.
    pub async fn ping(&self) -> Result<(), CoapError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CoapError::Shutdown);
        }
        let mut ids = self.exchange.lock().await;
        ids.message_id = ids.message_id.wrapping_add(1);
        let message_id = ids.message_id;

        let mut message = Packet::new();
        message.header.set_type(MessageType::Confirmable);
        message.header.code = MessageClass::Empty;
        message.header.message_id = message_id;
        let datagram = message
            .to_bytes()
            .map_err(|e| CoapError::Validation(format!("could not encode ping: {:?}", e)))?;

        let mut window = ACK_TIMEOUT;
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        for _ in 0..=PING_RETRANSMIT {
            self.socket
                .send(&datagram)
                .await
                .map_err(|e| CoapError::Network(e.to_string()))?;
            let deadline = Instant::now() + window;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let received = match timeout(remaining, self.socket.recv(&mut buffer)).await {
                    Err(_) => break,
                    Ok(Err(e)) => return Err(CoapError::Network(e.to_string())),
                    Ok(Ok(len)) => len,
                };
                let Ok(reply) = Packet::from_bytes(&buffer[..received]) else {
                    continue;
                };
                if reply.header.message_id == message_id
                    && matches!(
                        reply.header.get_type(),
                        MessageType::Reset | MessageType::Acknowledgement
                    )
                {
                    return Ok(());
                }
            }
            window *= 2;
        }
        Err(CoapError::Timeout)
    }

    /// Sends one confirmable request and waits for its response, following
    /// the retransmission schedule.
    async fn roundtrip(&self, mut message: Packet) -> Result<Packet, CoapError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CoapError::Shutdown);
        }
        let mut ids = self.exchange.lock().await;
        ids.message_id = ids.message_id.wrapping_add(1);
        ids.token = ids.token.wrapping_add(1);
        let message_id = ids.message_id;
        let token = ids.token.to_be_bytes().to_vec();

        message.header.message_id = message_id;
        message.set_token(token.clone());
        let datagram = message
            .to_bytes()
            .map_err(|e| CoapError::Validation(format!("could not encode request: {:?}", e)))?;

        let mut window = ACK_TIMEOUT;
        for _ in 0..=MAX_RETRANSMIT {
            self.socket
                .send(&datagram)
                .await
                .map_err(|e| CoapError::Network(e.to_string()))?;
            if let Some(response) = self.await_response(message_id, &token, window).await? {
                return Ok(response);
            }
            window *= 2;
        }
        Err(CoapError::Timeout)
    }

    /// Waits one retransmission window for the matching response; `Ok(None)`
    /// means the window elapsed silently.
    async fn await_response(
        &self,
        message_id: u16,
        token: &[u8],
        window: Duration,
    ) -> Result<Option<Packet>, CoapError> {
        let mut deadline = Instant::now() + window;
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        loop {
            if !self.open.load(Ordering::SeqCst) {
                return Err(CoapError::Shutdown);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let received = match timeout(remaining, self.socket.recv(&mut buffer)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(CoapError::Network(e.to_string())),
                Ok(Ok(len)) => len,
            };
            let Ok(response) = Packet::from_bytes(&buffer[..received]) else {
                debug!("Skipping undecodable datagram");
                continue;
            };
            if response.header.message_id == message_id
                && response.header.get_type() == MessageType::Reset
            {
                return Err(CoapError::Network("reset by device".to_string()));
            }
            // Empty ACK: the peer will follow up with a separate response
            if response.header.message_id == message_id
                && response.header.code == MessageClass::Empty
                && response.header.get_type() == MessageType::Acknowledgement
            {
                deadline = Instant::now() + SEPARATE_RESPONSE_WAIT;
                continue;
            }
            if response.get_token().to_vec() != token {
                continue;
            }
            if matches!(response.header.code, MessageClass::Response(_)) {
                if response.header.get_type() == MessageType::Confirmable {
                    self.acknowledge(&response).await;
                }
                return Ok(Some(response));
            }
        }
    }

    async fn acknowledge(&self, response: &Packet) {
        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.code = MessageClass::Empty;
        ack.header.message_id = response.header.message_id;
        if let Ok(datagram) = ack.to_bytes() {
            let _ = self.socket.send(&datagram).await;
        }
    }
}

fn successful(code: &MessageClass) -> bool {
    matches!(
        code,
        MessageClass::Response(
            ResponseType::Content
                | ResponseType::Changed
                | ResponseType::Valid
                | ResponseType::Created
                | ResponseType::Deleted
        )
    )
}

fn decode_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0, |value, byte| value << 8 | u64::from(*byte))
}

fn parse_status_document(payload: &[u8]) -> Result<RawStatus, CoapError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| CoapError::Validation("status payload is not UTF-8".to_string()))?;
    let document: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| CoapError::Validation(format!("status payload is not JSON: {}", e)))?;
    let reported = document.pointer("/state/reported").unwrap_or(&document);
    let object = reported
        .as_object()
        .ok_or_else(|| CoapError::Validation("status document is not an object".to_string()))?;

    let mut status = RawStatus::new();
    for (key, value) in object {
        let raw = match value {
            serde_json::Value::Number(number) if number.is_i64() => {
                RawValue::Int(number.as_i64().unwrap_or_default())
            }
            serde_json::Value::Number(number) => {
                RawValue::Float(number.as_f64().unwrap_or_default())
            }
            serde_json::Value::String(text) => RawValue::Text(text.clone()),
            serde_json::Value::Bool(flag) => RawValue::Int(i64::from(*flag)),
            other => {
                debug!("Skipping status key {} with unsupported value {}", key, other);
                continue;
            }
        };
        status.insert(key.clone(), raw);
    }
    Ok(status)
}

#[async_trait]
impl CoapClient for UdpCoapClient {
    async fn get_status(&self) -> Result<(RawStatus, u64), CoapError> {
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Get);
        request.set_path(STATUS_PATH);
        request.message.header.set_type(MessageType::Confirmable);

        let response = self.roundtrip(request.message).await?;
        if !successful(&response.header.code) {
            return Err(CoapError::Validation(format!(
                "status request failed: {:?}",
                response.header.code
            )));
        }
        let max_age = response
            .get_option(CoapOption::MaxAge)
            .and_then(|values| values.front())
            .map(|bytes| decode_uint(bytes))
            .unwrap_or(DEFAULT_MAX_AGE);
        let status = parse_status_document(&response.payload)?;
        Ok((status, max_age))
    }

    async fn set_control_values(&self, data: &RawStatus) -> Result<(), CoapError> {
        let document = serde_json::json!({ "state": { "desired": data } });
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Post);
        request.set_path(CONTROL_PATH);
        request.message.header.set_type(MessageType::Confirmable);
        request
            .message
            .add_option(CoapOption::ContentFormat, vec![CONTENT_FORMAT_JSON]);
        request.message.payload = document.to_string().into_bytes();

        let response = self.roundtrip(request.message).await?;
        if !successful(&response.header.code) {
            return Err(CoapError::Validation(format!(
                "control request rejected: {:?}",
                response.header.code
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct UdpCoapConnector {
    port: u16,
}

impl UdpCoapConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for UdpCoapConnector {
    fn default() -> Self {
        Self::new(DEFAULT_COAP_PORT)
    }
}

#[async_trait]
impl CoapConnector for UdpCoapConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn CoapClient>, CoapError> {
        let mut addresses = lookup_host((host, self.port))
            .await
            .map_err(|e| CoapError::Network(e.to_string()))?;
        let address = addresses
            .next()
            .ok_or_else(|| CoapError::Network(format!("no address found for {}", host)))?;
        let local: SocketAddr = match address {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| CoapError::Network(e.to_string()))?;
        socket
            .connect(address)
            .await
            .map_err(|e| CoapError::Network(e.to_string()))?;

        let client = UdpCoapClient::new(socket);
        client.ping().await?;
        debug!("CoAP session to {} established", host);
        Ok(Arc::new(client))
    }
}
