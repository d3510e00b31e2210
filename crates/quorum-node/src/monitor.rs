//! heartbeat monitor
//!
//! one round: sign and broadcast `{nonce, deadline}`, wait one monitoring
//! interval, then register every address whose ack signature over the exact
//! heartbeat payload recovers cleanly. states cycle
//! `Idle -> Sent -> Awaiting -> (Registered | TimedOut) -> Idle`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use quorum_primitives::{identity, Address, KeyPair, RecoverableSignature};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::message::{decode_reply, Heartbeat, SignedMessage, WireMessage};
use crate::registry::NodeRegistry;
use crate::topic::Topics;
use crate::transport::GossipTransport;
use crate::worker::{unix_now, Shutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Sent,
    Awaiting,
    Registered,
    TimedOut,
}

/// one heartbeat broadcast; lives for a single cycle
#[derive(Debug, Clone)]
pub struct HeartbeatRound {
    pub nonce: Uuid,
    pub deadline: u64,
    pub sent_at: u64,
    /// exact bytes that were signed and that acks must sign too
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Registered { nonce: Uuid, count: usize },
    TimedOut { nonce: Uuid },
    SendFailed,
    /// shutdown arrived while waiting for acks
    Interrupted,
}

pub struct Monitor {
    key: KeyPair,
    transport: Arc<dyn GossipTransport>,
    registry: Arc<dyn NodeRegistry>,
    topics: Topics,
    monitoring_interval: Duration,
    polling_interval: Duration,
    state: MonitorState,
}

impl Monitor {
    pub fn new(
        config: &Config,
        key: KeyPair,
        transport: Arc<dyn GossipTransport>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        Self {
            key,
            transport,
            registry,
            topics: config.topics(),
            monitoring_interval: config.monitoring_interval(),
            polling_interval: config.polling_interval(),
            state: MonitorState::Idle,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// sign and broadcast a fresh heartbeat
    pub async fn send_heartbeat(&mut self, now: u64) -> Result<HeartbeatRound> {
        let heartbeat = Heartbeat {
            nonce: Uuid::new_v4(),
            deadline: now + self.monitoring_interval.as_secs(),
        };
        let signed = SignedMessage::sign(&self.key, WireMessage::Heartbeat(heartbeat.clone()))?;
        self.transport
            .push_message(&signed.encode(), &self.topics.heartbeat())
            .await?;

        self.state = MonitorState::Sent;
        debug!(nonce = %heartbeat.nonce, deadline = heartbeat.deadline, "heartbeat sent");
        Ok(HeartbeatRound {
            nonce: heartbeat.nonce,
            deadline: heartbeat.deadline,
            sent_at: now,
            payload: signed.payload,
        })
    }

    /// recover the distinct responders of a round; bad acks are dropped
    pub async fn collect(&mut self, round: &HeartbeatRound) -> Result<Vec<Address>> {
        self.state = MonitorState::Awaiting;
        let messages = self
            .transport
            .fetch_messages(&self.topics.heartbeat_responses(&round.nonce))
            .await?;

        let mut responders = BTreeSet::new();
        for message in &messages {
            match recover_responder(&message.payload, &round.payload) {
                Ok(address) => {
                    responders.insert(address);
                }
                Err(e) => debug!(nonce = %round.nonce, "dropping heartbeat ack: {}", e),
            }
        }
        Ok(responders.into_iter().collect())
    }

    /// send, wait one monitoring interval, collect and register
    pub async fn run_round(&mut self, shutdown: &mut Shutdown) -> RoundOutcome {
        self.state = MonitorState::Idle;
        let round = match self.send_heartbeat(unix_now()).await {
            Ok(round) => round,
            Err(e) => {
                warn!("heartbeat send failed: {}", e);
                return RoundOutcome::SendFailed;
            }
        };

        if shutdown.sleep(self.monitoring_interval).await {
            return RoundOutcome::Interrupted;
        }
        self.finish_round(&round, unix_now()).await
    }

    /// the part of a round after the wait
    pub async fn finish_round(&mut self, round: &HeartbeatRound, now: u64) -> RoundOutcome {
        let responders = match self.collect(round).await {
            Ok(r) => r,
            Err(e) => {
                warn!(nonce = %round.nonce, "heartbeat collection failed: {}", e);
                Vec::new()
            }
        };

        if responders.is_empty() {
            self.state = MonitorState::TimedOut;
            info!(nonce = %round.nonce, "heartbeat timed out with no valid responses");
            return RoundOutcome::TimedOut { nonce: round.nonce };
        }

        if let Err(e) = self.registry.register(&responders, now).await {
            warn!(nonce = %round.nonce, "registering responders failed: {}", e);
            self.state = MonitorState::TimedOut;
            return RoundOutcome::TimedOut { nonce: round.nonce };
        }
        self.state = MonitorState::Registered;
        info!(nonce = %round.nonce, count = responders.len(), "registered live participants");
        RoundOutcome::Registered {
            nonce: round.nonce,
            count: responders.len(),
        }
    }
}

fn recover_responder(encoded: &str, heartbeat_payload: &[u8]) -> Result<Address> {
    let ack = match decode_reply(encoded)? {
        WireMessage::HeartbeatAck(ack) => ack,
        other => {
            return Err(NodeError::Validation(format!(
                "expected heartbeat_ack, got {}",
                other.kind()
            )))
        }
    };
    let signature = RecoverableSignature::from_hex(&ack.signature)?;
    Ok(identity::recover_signer(&signature, heartbeat_payload)?)
}
