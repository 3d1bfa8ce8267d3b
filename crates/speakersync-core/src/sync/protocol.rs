//! Time-exchange messages for the reference server
//!
//! Every frame is a JSON object `{"type": ..., "payload": {...}}`. Timestamps
//! are integer microseconds on the sender's clock.

use super::clock::TimeExchangeSample;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors at the message boundary
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected non-text frame")]
    NonTextFrame,
}

/// Greeting sent by the server once a connection is accepted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerHello {
    /// Server identifier, if the server reports one
    pub server_id: Option<String>,
    /// Protocol version string, if reported
    pub version: Option<String>,
}

/// Server half of a time exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTime {
    /// Echo of the client's `t1`
    pub client_transmitted: i64,
    /// `t2`
    pub server_received: i64,
    /// `t3`
    pub server_transmitted: i64,
}

impl ServerTime {
    /// Complete the exchange with the local receive time `t4`
    pub fn into_sample(self, client_received: i64) -> TimeExchangeSample {
        TimeExchangeSample {
            t1: self.client_transmitted,
            t2: self.server_received,
            t3: self.server_transmitted,
            t4: client_received,
        }
    }
}

/// Client half of a time exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTime {
    /// `t1`
    pub client_transmitted: i64,
}

/// Messages the reference server sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "server/hello")]
    Hello(ServerHello),
    #[serde(rename = "server/time")]
    Time(ServerTime),
}

/// Messages this client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "client/time")]
    Time(ClientTime),
}

impl ServerMessage {
    /// Decode one text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientMessage {
    /// Time request stamped with local send time `t1`
    pub fn time_request(client_transmitted: i64) -> Self {
        Self::Time(ClientTime { client_transmitted })
    }

    /// Decode one text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
