//! Gateway wire types.
//!
//! The gateway speaks newline-delimited JSON frames over TCP. Only the
//! callback subset this service consumes is modelled; everything else the
//! gateway may emit is rejected at decode and logged by the session.

use serde::{Deserialize, Serialize};

/// Tick field id carrying the last trade price.
pub const TICK_FIELD_LAST: u32 = 4;
/// Tick field id carrying the last trade size.
pub const TICK_FIELD_LAST_SIZE: u32 = 5;

/// Instrument description sent with every market-data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
}

impl Contract {
    /// US stock routed through SMART.
    pub fn stock(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }
    }
}

/// Outbound request frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayRequest {
    Connect {
        client_id: i64,
    },
    MarketData {
        req_id: i64,
        contract: Contract,
    },
    MarketDepth {
        req_id: i64,
        contract: Contract,
        rows: u32,
        smart_depth: bool,
    },
    HistoricalData {
        req_id: i64,
        contract: Contract,
        end_datetime: String,
        duration: String,
        bar_size: String,
        what_to_show: String,
        use_rth: bool,
        format_date: u8,
    },
    Cancel {
        req_id: i64,
    },
}

/// One historical OHLCV bar as delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBarData {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Inbound callback frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    TickPrice {
        req_id: i64,
        field: u32,
        price: f64,
    },
    TickSize {
        req_id: i64,
        field: u32,
        size: f64,
    },
    MarketDepth {
        req_id: i64,
        position: i32,
        operation: i32,
        side: i32,
        price: f64,
        size: f64,
    },
    HistoricalBar {
        req_id: i64,
        bar: HistoricalBarData,
    },
    HistoricalEnd {
        req_id: i64,
        start: String,
        end: String,
    },
    NextValidId {
        id: i64,
    },
    Error {
        id: i64,
        code: i32,
        message: String,
    },
}

/// Semantic class of a gateway error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("connection to the gateway lost")]
    ConnectionLost,
    #[error("connection restored by the gateway")]
    ConnectionRestored,
    #[error("informational notice")]
    Informational,
    #[error("data farm degraded")]
    Degraded,
    #[error("market data subscription missing")]
    MissingSubscription,
    #[error("contract not recognized")]
    BadContract,
    #[error("duplicate request id")]
    DuplicateRequest,
    #[error("not connected")]
    NotConnected,
    #[error("request rate limit exceeded")]
    RateLimited,
    #[error("missing permissions")]
    MissingPermissions,
    #[error("unclassified gateway warning")]
    Other,
}

impl ErrorKind {
    /// Map a gateway error code onto its semantic class.
    pub fn classify(code: i32) -> Self {
        match code {
            1100 | 1101 => ErrorKind::ConnectionLost,
            1102 => ErrorKind::ConnectionRestored,
            2104 | 2106 => ErrorKind::Informational,
            2105 | 2107 => ErrorKind::Degraded,
            10090 => ErrorKind::MissingSubscription,
            200 => ErrorKind::BadContract,
            322 => ErrorKind::DuplicateRequest,
            504 => ErrorKind::NotConnected,
            509 => ErrorKind::RateLimited,
            2152 => ErrorKind::MissingPermissions,
            _ => ErrorKind::Other,
        }
    }

    /// Errors that abandon the request they refer to.
    pub fn abandons_request(&self) -> bool {
        matches!(
            self,
            ErrorKind::BadContract
                | ErrorKind::DuplicateRequest
                | ErrorKind::MissingPermissions
                | ErrorKind::MissingSubscription
        )
    }
}

/// Encode a frame (request or event) as one JSON line.
pub fn encode<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

/// Decode one inbound line.
pub fn decode_event(line: &str) -> serde_json::Result<GatewayEvent> {
    serde_json::from_str(line)
}
