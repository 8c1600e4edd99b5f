//! Request, session and frame types shared by every component.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

use crate::error::{FabricError, Rejection};

/// Stable identifier of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of request types accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    TradeExecution,
    MarketDataCritical,
    MarketData,
    SessionConnect,
    UserCommand,
    AgentUpdate,
    Notification,
    Analytics,
    HistoricalData,
    Maintenance,
}

impl RequestType {
    pub const ALL: [RequestType; 10] = [
        RequestType::TradeExecution,
        RequestType::MarketDataCritical,
        RequestType::MarketData,
        RequestType::SessionConnect,
        RequestType::UserCommand,
        RequestType::AgentUpdate,
        RequestType::Notification,
        RequestType::Analytics,
        RequestType::HistoricalData,
        RequestType::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::TradeExecution => "trade_execution",
            RequestType::MarketDataCritical => "market_data_critical",
            RequestType::MarketData => "market_data",
            RequestType::SessionConnect => "session_connect",
            RequestType::UserCommand => "user_command",
            RequestType::AgentUpdate => "agent_update",
            RequestType::Notification => "notification",
            RequestType::Analytics => "analytics",
            RequestType::HistoricalData => "historical_data",
            RequestType::Maintenance => "maintenance",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Types still admitted while the fabric is in EMERGENCY.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            RequestType::TradeExecution | RequestType::MarketDataCritical
        )
    }

    /// Base priority before class and flag modifiers.
    pub fn base_priority(&self) -> i32 {
        match self {
            RequestType::TradeExecution => 100,
            RequestType::MarketDataCritical => 95,
            RequestType::SessionConnect => 80,
            RequestType::UserCommand => 75,
            RequestType::MarketData => 70,
            RequestType::AgentUpdate => 60,
            RequestType::Notification => 40,
            RequestType::Analytics => 30,
            RequestType::HistoricalData => 20,
            RequestType::Maintenance => 10,
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commercial classification of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionClass {
    #[default]
    Standard,
    Premium,
    Vip,
    System,
}

impl SessionClass {
    pub fn priority_bonus(&self) -> i32 {
        match self {
            SessionClass::Standard => 0,
            SessionClass::Premium => 10,
            SessionClass::Vip => 20,
            SessionClass::System => 30,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            "vip" => Some(Self::Vip),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Who sent a request, as seen by the admission pipeline.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    pub session: Option<SessionId>,
    pub remote: IpAddr,
    pub user_agent: Option<String>,
    pub class: SessionClass,
    pub authenticated: bool,
}

impl RequestOrigin {
    pub fn anonymous(remote: IpAddr) -> Self {
        Self {
            session: None,
            remote,
            user_agent: None,
            class: SessionClass::Standard,
            authenticated: false,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_class(mut self, class: SessionClass) -> Self {
        self.class = class;
        self
    }
}

/// A typed request bound to a session.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Option<String>,
    pub kind: RequestType,
    pub payload: serde_json::Value,
    pub size_bytes: usize,
    pub urgent: bool,
    pub realtime: bool,
    pub arrived_at: Instant,
    pub latency_hint_ms: Option<u32>,
}

impl Request {
    pub fn new(kind: RequestType, payload: serde_json::Value) -> Self {
        let size_bytes = payload.to_string().len();
        Self {
            id: None,
            kind,
            payload,
            size_bytes,
            urgent: false,
            realtime: false,
            arrived_at: Instant::now(),
            latency_hint_ms: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    pub fn with_latency_hint(mut self, ms: u32) -> Self {
        self.latency_hint_ms = Some(ms);
        self
    }

    pub fn with_size(mut self, size_bytes: usize) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    urgent: bool,
    #[serde(default)]
    realtime: bool,
    #[serde(default)]
    latency_hint_ms: Option<u32>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Ping { timestamp: Option<i64> },
    Pong,
    Request(Request),
}

impl ClientFrame {
    /// Decode a text frame. `max_bytes` is the payload cap.
    pub fn decode(text: &str, max_bytes: usize) -> Result<Self, FabricError> {
        if text.len() > max_bytes {
            return Err(FabricError::PayloadTooLarge {
                size: text.len(),
                limit: max_bytes,
            });
        }
        let raw: RawClientFrame = serde_json::from_str(text)
            .map_err(|e| FabricError::BadRequest(format!("invalid frame: {}", e)))?;

        match raw.kind.as_str() {
            "ping" => return Ok(ClientFrame::Ping {
                timestamp: raw.timestamp,
            }),
            "pong" => return Ok(ClientFrame::Pong),
            _ => {}
        }

        let kind = RequestType::from_str(&raw.kind)
            .ok_or_else(|| FabricError::BadRequest(format!("unknown type {}", raw.kind)))?;

        Ok(ClientFrame::Request(Request {
            id: raw.request_id,
            kind,
            payload: raw.payload,
            size_bytes: text.len(),
            urgent: raw.urgent,
            realtime: raw.realtime,
            arrived_at: Instant::now(),
            latency_hint_ms: raw.latency_hint_ms,
        }))
    }
}

/// Frames the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    ConnectionAck {
        connection_id: SessionId,
        shard_id: u32,
        timestamp: i64,
        compression: bool,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        success: bool,
        data: serde_json::Value,
    },
    Queued {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        queue: String,
        estimated_wait_ms: u64,
    },
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        rejection: Rejection,
    },
    Event {
        topic: String,
        data: serde_json::Value,
    },
    Close {
        reason: String,
    },
}

impl ServerFrame {
    pub fn pong() -> Self {
        ServerFrame::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn ping() -> Self {
        ServerFrame::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize server frame: {}", e);
            "{}".to_string()
        })
    }
}
