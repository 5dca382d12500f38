//! Wire frames for the streaming channel
//!
//! Everything on the socket is JSON with a `type` tag. Inbound messages are
//! validated against the schema before any side effect; unknown types or
//! stray fields are rejected, never coerced.

use serde::{Deserialize, Serialize};

/// Client-to-server actions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Bet {
        amount: f64,
        #[serde(default, rename = "autoCashout")]
        auto_cashout: Option<f64>,
    },
    CashOut,
    Ping,
}

/// Shared per-round state, serialized once per engine event.
#[derive(Debug, Clone, Serialize)]
pub struct PublicFrame {
    pub phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_number: Option<i64>,
    pub multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u64>,
    pub players: usize,
    /// Recent crash points, newest first.
    pub history: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed_hash: Option<String>,
    pub maintenance: bool,
}

/// Server-to-client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Handshake acknowledgement.
    Connected {
        authenticated: bool,
        balance: f64,
    },
    /// The shared public frame.
    GameState {
        #[serde(flatten)]
        frame: PublicFrame,
    },
    /// Per-session view on top of the public frame.
    PlayerOverlay {
        has_wager: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        wager_amount: Option<f64>,
        cashed_out: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        cashout_multiplier: Option<f64>,
        balance: f64,
        authenticated: bool,
    },
    /// Bet acknowledgement on the placing socket.
    BetPlaced {
        amount: f64,
        balance: f64,
    },
    /// Cashout acknowledgement (manual or auto).
    CashedOut {
        multiplier: f64,
        payout: f64,
        balance: f64,
    },
    Error {
        code: String,
        message: String,
    },
    Warning {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(err: &crate::errors::Error) -> ServerMessage {
        ServerMessage::Error {
            code: err.code().to_string(),
            // Internal detail stays in the logs.
            message: match err {
                crate::errors::Error::Internal(_) => "internal error".to_string(),
                other => other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[test]
    fn client_messages_parse() {
        let bet: ClientMessage =
            serde_json::from_str(r#"{"type":"bet","amount":10.5,"autoCashout":2.0}"#).unwrap();
        assert_eq!(
            bet,
            ClientMessage::Bet {
                amount: 10.5,
                auto_cashout: Some(2.0)
            }
        );

        let bare: ClientMessage = serde_json::from_str(r#"{"type":"bet","amount":1}"#).unwrap();
        assert_eq!(
            bare,
            ClientMessage::Bet {
                amount: 1.0,
                auto_cashout: None
            }
        );

        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"cashOut"}"#).unwrap(),
            ClientMessage::CashOut
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn malformed_client_messages_rejected() {
        // Unknown type.
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"steal"}"#).is_err());
        // Missing amount.
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bet"}"#).is_err());
        // Wrong field type is rejected, not coerced.
        assert!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"bet","amount":"ten"}"#).is_err()
        );
        // No tag at all.
        assert!(serde_json::from_str::<ClientMessage>(r#"{"amount":5}"#).is_err());
    }

    #[test]
    fn game_state_flattens_frame() {
        let message = ServerMessage::GameState {
            frame: PublicFrame {
                phase: "running",
                round_number: Some(12),
                multiplier: 1.5,
                countdown: None,
                players: 3,
                history: vec![2.45, 1.02],
                server_seed_hash: Some("abc".to_string()),
                maintenance: false,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "gameState");
        assert_eq!(json["phase"], "running");
        assert_eq!(json["round_number"], 12);
        assert_eq!(json["multiplier"], 1.5);
        assert_eq!(json["history"][0], 2.45);
        assert!(json.get("countdown").is_none());
    }

    #[test]
    fn error_frames_hide_internal_detail() {
        let message = ServerMessage::error(&Error::internal("sqlite exploded at row 4"));
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("INTERNAL"));
        assert!(!json.contains("sqlite"));

        let message = ServerMessage::error(&Error::InsufficientFunds);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("INSUFFICIENT_FUNDS"));
    }

    #[test]
    fn server_message_tags() {
        let json = serde_json::to_string(&ServerMessage::Connected {
            authenticated: false,
            balance: 1000.0,
        })
        .unwrap();
        assert!(json.contains(r#""type":"connected""#));

        let json = serde_json::to_string(&ServerMessage::CashedOut {
            multiplier: 1.5,
            payout: 150.0,
            balance: 1050.0,
        })
        .unwrap();
        assert!(json.contains(r#""type":"cashedOut""#));
    }
}
