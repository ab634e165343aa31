//! Broker gateway edge: wire types and the session state machine.

pub mod protocol;
pub mod session;

pub use protocol::{Contract, ErrorKind, GatewayEvent, GatewayRequest, HistoricalBarData};
pub use session::{BrokerSession, SessionConfig, SessionEvent, SessionMetrics, SessionState};
