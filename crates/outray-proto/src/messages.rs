//! Protocol message types

use crate::encoding::{base64_body, base64_bytes, null_as_default};
use crate::ProtoError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const MSG_OPEN_TUNNEL: &str = "open_tunnel";
pub const MSG_TUNNEL_OPENED: &str = "tunnel_opened";
pub const MSG_REQUEST: &str = "request";
pub const MSG_RESPONSE: &str = "response";
pub const MSG_ERROR: &str = "error";
pub const MSG_TCP_CONNECTION: &str = "tcp_connection";
pub const MSG_TCP_DATA: &str = "tcp_data";
pub const MSG_UDP_DATA: &str = "udp_data";
pub const MSG_UDP_RESPONSE: &str = "udp_response";

/// Kind of traffic a tunnel carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Http,
    Tcp,
    Udp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelProtocol::Http),
            "tcp" => Ok(TunnelProtocol::Tcp),
            "udp" => Ok(TunnelProtocol::Udp),
            other => Err(format!("unknown protocol '{}' (expected http, tcp or udp)", other)),
        }
    }
}

/// Handshake sent by the client right after the control connection opens
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenTunnel {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub protocol: TunnelProtocol,
    pub port: u16,
    #[serde(rename = "remotePort", default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(rename = "customDomain", default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    #[serde(rename = "forceTakeover", default, skip_serializing_if = "is_false")]
    pub force_takeover: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// HTTP request forwarded from the public tunnel endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingRequest {
    #[serde(rename = "requestId", alias = "id")]
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl IncomingRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP response returned to the relay for a forwarded request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingResponse {
    #[serde(rename = "requestId", default)]
    pub request_id: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl OutgoingResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            request_id: String::new(),
            status_code,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Plain-text response, used for gateway and handler failures
    pub fn text(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(status_code)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(message.into().into_bytes())
    }
}

impl Default for OutgoingResponse {
    fn default() -> Self {
        Self::new(200)
    }
}

/// A single UDP datagram received by the relay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpPacket {
    #[serde(rename = "packetId")]
    pub packet_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "sourceAddress", default)]
    pub source_address: String,
    #[serde(rename = "sourcePort", default)]
    pub source_port: u16,
}

/// Frames sent from the client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    OpenTunnel(OpenTunnel),
    Response(OutgoingResponse),
    TcpData {
        #[serde(rename = "connectionId")]
        connection_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    UdpResponse {
        #[serde(rename = "packetId")]
        packet_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::OpenTunnel(_) => MSG_OPEN_TUNNEL,
            ClientMessage::Response(_) => MSG_RESPONSE,
            ClientMessage::TcpData { .. } => MSG_TCP_DATA,
            ClientMessage::UdpResponse { .. } => MSG_UDP_RESPONSE,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frames sent from the relay to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TunnelOpened {
        url: String,
    },
    Request(IncomingRequest),
    TcpConnection {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    TcpData {
        #[serde(rename = "connectionId")]
        connection_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    UdpData(UdpPacket),
    Error {
        message: String,
    },
}

/// First decoding stage: only the discriminator
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl ServerMessage {
    /// Frame kinds this client understands
    pub const KINDS: [&'static str; 6] = [
        MSG_TUNNEL_OPENED,
        MSG_REQUEST,
        MSG_TCP_CONNECTION,
        MSG_TCP_DATA,
        MSG_UDP_DATA,
        MSG_ERROR,
    ];

    /// Decode a text frame from the relay.
    ///
    /// The discriminator is read first; frames with an unrecognized kind yield
    /// `Ok(None)` so newer relays can add message types. A recognized kind whose
    /// fields do not match is an error.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtoError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = envelope.kind.ok_or(ProtoError::MissingType)?;

        if !Self::KINDS.contains(&kind.as_str()) {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(text)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::TunnelOpened { .. } => MSG_TUNNEL_OPENED,
            ServerMessage::Request(_) => MSG_REQUEST,
            ServerMessage::TcpConnection { .. } => MSG_TCP_CONNECTION,
            ServerMessage::TcpData { .. } => MSG_TCP_DATA,
            ServerMessage::UdpData(_) => MSG_UDP_DATA,
            ServerMessage::Error { .. } => MSG_ERROR,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_decode_tunnel_opened() {
        let msg = ServerMessage::decode(r#"{"type":"tunnel_opened","url":"https://abc.outray.app"}"#)
            .unwrap()
            .unwrap();

        assert_eq!(
            msg,
            ServerMessage::TunnelOpened {
                url: "https://abc.outray.app".to_string()
            }
        );
    }

    #[test]
    fn test_decode_minimal_request() {
        let msg =
            ServerMessage::decode(r#"{"type":"request","requestId":"123","method":"GET","path":"/"}"#)
                .unwrap()
                .unwrap();

        match msg {
            ServerMessage::Request(req) => {
                assert_eq!(req.request_id, "123");
                assert_eq!(req.method, "GET");
                assert_eq!(req.path, "/");
                assert!(req.headers.is_empty());
                assert!(req.body.is_empty());
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_request_with_legacy_id_and_nulls() {
        let msg = ServerMessage::decode(
            r#"{"type":"request","id":"7","method":"POST","path":"/x","headers":null,"body":null}"#,
        )
        .unwrap()
        .unwrap();

        let ServerMessage::Request(req) = msg else {
            panic!("Expected request");
        };
        assert_eq!(req.request_id, "7");
        assert!(req.headers.is_empty());
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_decode_tcp_data_payload() {
        let msg = ServerMessage::decode(
            r#"{"type":"tcp_data","connectionId":"abc","data":"SGVsbG8="}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            msg,
            ServerMessage::TcpData {
                connection_id: "abc".to_string(),
                data: b"Hello".to_vec(),
            }
        );
    }

    #[test]
    fn test_decode_udp_data() {
        let msg = ServerMessage::decode(
            r#"{"type":"udp_data","packetId":"p1","data":"AAEC","sourceAddress":"1.2.3.4","sourcePort":5353}"#,
        )
        .unwrap()
        .unwrap();

        let ServerMessage::UdpData(packet) = msg else {
            panic!("Expected udp_data");
        };
        assert_eq!(packet.packet_id, "p1");
        assert_eq!(packet.data, vec![0, 1, 2]);
        assert_eq!(packet.source_address, "1.2.3.4");
        assert_eq!(packet.source_port, 5353);
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        assert!(ServerMessage::decode(r#"{"type":"stats","bytes":10}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(
            ServerMessage::decode(r#"{"url":"x"}"#),
            Err(ProtoError::MissingType)
        ));
        assert!(ServerMessage::decode("not json").is_err());
        assert!(ServerMessage::decode(r#"{"type":"tcp_data","connectionId":"a","data":"%%%"}"#).is_err());
        assert!(ServerMessage::decode(r#"{"type":"tcp_connection"}"#).is_err());
    }

    #[test]
    fn test_handshake_omits_unset_options() {
        let msg = ClientMessage::OpenTunnel(OpenTunnel {
            api_key: "key".to_string(),
            protocol: TunnelProtocol::Http,
            port: 8080,
            ..Default::default()
        });

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "open_tunnel", "apiKey": "key", "protocol": "http", "port": 8080})
        );
    }

    #[test]
    fn test_handshake_with_all_options() {
        let msg = ClientMessage::OpenTunnel(OpenTunnel {
            api_key: "key".to_string(),
            protocol: TunnelProtocol::Tcp,
            port: 5432,
            remote_port: Some(20000),
            subdomain: Some("db".to_string()),
            custom_domain: Some("db.example.com".to_string()),
            force_takeover: true,
        });

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["protocol"], "tcp");
        assert_eq!(value["remotePort"], 20000);
        assert_eq!(value["subdomain"], "db");
        assert_eq!(value["customDomain"], "db.example.com");
        assert_eq!(value["forceTakeover"], true);
    }

    #[test]
    fn test_response_frame_shape() {
        let mut response = OutgoingResponse::new(200)
            .with_header("Content-Type", "text/plain")
            .with_body(b"ok".to_vec());
        response.request_id = "123".to_string();

        let value: Value =
            serde_json::from_str(&ClientMessage::Response(response.clone()).to_json().unwrap())
                .unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["requestId"], "123");
        assert_eq!(value["statusCode"], 200);
        assert_eq!(value["headers"]["Content-Type"], "text/plain");
        assert_eq!(value["body"], "b2s=");

        let back = ClientMessage::from_json(&value.to_string()).unwrap();
        assert_eq!(back, ClientMessage::Response(response));
    }

    #[test]
    fn test_empty_response_round_trip() {
        let response = OutgoingResponse::new(204);
        let json = ClientMessage::Response(response.clone()).to_json().unwrap();
        assert_eq!(ClientMessage::from_json(&json).unwrap(), ClientMessage::Response(response));
    }

    #[test]
    fn test_relay_frames_encode_for_decode() {
        let request = IncomingRequest {
            request_id: "r1".to_string(),
            method: "PUT".to_string(),
            path: "/items/1?x=y".to_string(),
            headers: HashMap::from([("X-Test".to_string(), "1".to_string())]),
            body: vec![0, 159, 146, 150],
        };
        let json = ServerMessage::Request(request.clone()).to_json().unwrap();

        assert_eq!(
            ServerMessage::decode(&json).unwrap(),
            Some(ServerMessage::Request(request))
        );
    }

    #[test]
    fn test_udp_response_frame_shape() {
        let msg = ClientMessage::UdpResponse {
            packet_id: "p9".to_string(),
            data: b"pong".to_vec(),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "udp_response", "packetId": "p9", "data": "cG9uZw=="}));
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("HTTP".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Http);
        assert_eq!("udp".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Udp);
        assert!("quic".parse::<TunnelProtocol>().is_err());
        assert_eq!(TunnelProtocol::Tcp.to_string(), "tcp");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = IncomingRequest {
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            ..Default::default()
        };
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("accept"), None);
    }
}
