//! One conversation at a time between the local user and a peer.
//!
//! The session moves `Closed -> Opening -> Ready` and back to `Closed`. An
//! open is split into [`ChatSession::begin_open`], a detached
//! [`ConversationLoader::load`] and [`ChatSession::finish_open`] so a host can
//! run the network part without holding the session; a newer open or a close
//! bumps the generation and the stale result is dropped.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::{
    cipher, derive_session_key, EncryptedMessage, LocalKeyPair, PeerPublicKey, SessionKey,
};
use crate::error::ChatResult;
use crate::exchange::KeyExchange;
use crate::models::input::{OpenConversationInput, SendMessageInput, ValidateExt};
use crate::models::{DeliveryStatus, MessageBody, Notification, TranscriptEntry};
use crate::transport::{InboundCiphertext, MessageHistory, Transport};

/// Oldest notifications are dropped past this many
pub const MAX_NOTIFICATIONS: usize = 100;

/// An open conversation: peer key, session key and visible transcript
pub struct Conversation {
    peer: PeerPublicKey,
    session_key: SessionKey,
    transcript: Vec<TranscriptEntry>,
    /// Ciphertexts already in the transcript, from history or sent live
    seen: HashSet<String>,
}

impl Conversation {
    pub fn peer_id(&self) -> &str {
        &self.peer.peer_id
    }

    pub fn peer_fingerprint(&self) -> String {
        self.peer.fingerprint()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("peer_id", &self.peer.peer_id)
            .field("messages", &self.transcript.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum SessionState {
    Closed,
    Opening { peer_id: String, generation: u64 },
    Ready(Conversation),
}

/// Handle for an open started by [`ChatSession::begin_open`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTicket {
    pub peer_id: String,
    generation: u64,
}

/// Where an inbound ciphertext ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Decrypted (or replaced by the placeholder) into the active transcript
    Displayed,
    /// Not for the active conversation; recorded as a notification
    Notified,
    /// Already in the transcript, usually because history loaded it first
    Duplicate,
}

/// Network half of opening a conversation, detached from the session
#[derive(Clone)]
pub struct ConversationLoader {
    user_id: String,
    local: Arc<LocalKeyPair>,
    exchange: KeyExchange,
    history: Arc<dyn MessageHistory>,
}

impl ConversationLoader {
    /// Fetch the peer key, derive the session key and decrypt the history.
    ///
    /// History decryption is best-effort; every other failure aborts.
    pub async fn load(&self, peer_id: &str) -> ChatResult<Conversation> {
        let peer = self.exchange.fetch_peer_public_key(peer_id).await?;
        let session_key = derive_session_key(&self.local, &peer)?;
        let records = self.history.fetch_messages(peer_id).await?;

        let transcript: Vec<TranscriptEntry> = records
            .iter()
            .map(|record| self.history_entry(&session_key, record))
            .collect();

        let unreadable = transcript
            .iter()
            .filter(|entry| entry.body == MessageBody::Undecryptable)
            .count();
        if unreadable > 0 {
            warn!(peer_id, unreadable, "Some history messages could not be decrypted");
        }
        debug!(peer_id, count = transcript.len(), "Loaded conversation history");

        let seen = records
            .into_iter()
            .map(|record| record.ciphertext)
            .collect();
        Ok(Conversation {
            peer,
            session_key,
            transcript,
            seen,
        })
    }

    fn history_entry(&self, key: &SessionKey, record: &EncryptedMessage) -> TranscriptEntry {
        let delivery = if record.sender == self.user_id {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Received
        };
        TranscriptEntry {
            sender: record.sender.clone(),
            timestamp: record.timestamp,
            body: decrypt_body(key, &record.ciphertext),
            delivery,
        }
    }
}

fn decrypt_body(key: &SessionKey, ciphertext: &str) -> MessageBody {
    match cipher::decrypt(key, ciphertext) {
        Ok(text) => MessageBody::Plaintext(text),
        Err(e) => {
            debug!(error = %e, "Showing placeholder for undecryptable message");
            MessageBody::Undecryptable
        }
    }
}

/// Encrypted one-to-one chat for the local user
pub struct ChatSession {
    user_id: String,
    local: Arc<LocalKeyPair>,
    exchange: KeyExchange,
    history: Arc<dyn MessageHistory>,
    transport: Arc<dyn Transport>,
    state: SessionState,
    generation: u64,
    notifications: Vec<Notification>,
}

impl ChatSession {
    pub fn new(
        local: Arc<LocalKeyPair>,
        exchange: KeyExchange,
        history: Arc<dyn MessageHistory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            user_id: exchange.user_id().to_string(),
            local,
            exchange,
            history,
            transport,
            state: SessionState::Closed,
            generation: 0,
            notifications: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn local_fingerprint(&self) -> String {
        self.local.fingerprint()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Peer of the `Ready` conversation
    pub fn active_peer(&self) -> Option<&str> {
        match &self.state {
            SessionState::Ready(conversation) => Some(conversation.peer_id()),
            _ => None,
        }
    }

    /// The composer accepts input only once a session key exists
    pub fn is_composer_enabled(&self) -> bool {
        matches!(self.state, SessionState::Ready(_))
    }

    /// Visible transcript; empty unless `Ready`
    pub fn transcript(&self) -> &[TranscriptEntry] {
        match &self.state {
            SessionState::Ready(conversation) => conversation.transcript(),
            _ => &[],
        }
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        mem::take(&mut self.notifications)
    }

    /// Enter `Opening` for `peer_id`, superseding any open or active conversation
    pub fn begin_open(&mut self, peer_id: &str) -> ChatResult<OpenTicket> {
        OpenConversationInput {
            peer_id: peer_id.to_string(),
        }
        .validate_input()?;

        self.generation += 1;
        // Dropping a Ready conversation zeroizes its session key
        self.state = SessionState::Opening {
            peer_id: peer_id.to_string(),
            generation: self.generation,
        };
        debug!(peer_id, generation = self.generation, "Opening conversation");

        Ok(OpenTicket {
            peer_id: peer_id.to_string(),
            generation: self.generation,
        })
    }

    pub fn loader(&self) -> ConversationLoader {
        ConversationLoader {
            user_id: self.user_id.clone(),
            local: self.local.clone(),
            exchange: self.exchange.clone(),
            history: self.history.clone(),
        }
    }

    /// Apply the result of a load.
    ///
    /// Returns `Ok(false)` when the ticket was superseded; the result is
    /// discarded and the state is untouched. A current failure leaves the
    /// session `Closed`.
    pub fn finish_open(
        &mut self,
        ticket: OpenTicket,
        result: ChatResult<Conversation>,
    ) -> ChatResult<bool> {
        let current = matches!(
            &self.state,
            SessionState::Opening { generation, .. } if *generation == ticket.generation
        );
        if !current {
            debug!(
                peer_id = %ticket.peer_id,
                generation = ticket.generation,
                "Discarding superseded open"
            );
            return Ok(false);
        }

        match result {
            Ok(conversation) => {
                info!(
                    peer_id = %ticket.peer_id,
                    fingerprint = %conversation.peer_fingerprint(),
                    messages = conversation.transcript.len(),
                    "Conversation ready"
                );
                self.state = SessionState::Ready(conversation);
                Ok(true)
            }
            Err(e) => {
                warn!(peer_id = %ticket.peer_id, error = %e, "Failed to open conversation");
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Open a conversation with `peer_id` and wait until it is `Ready`
    pub async fn open(&mut self, peer_id: &str) -> ChatResult<()> {
        let ticket = self.begin_open(peer_id)?;
        let result = self.loader().load(&ticket.peer_id).await;
        self.finish_open(ticket, result).map(|_| ())
    }

    /// Encrypt and send to the active peer.
    ///
    /// `Ok(None)` when there is nothing to send (not `Ready`, or blank input).
    /// The entry is appended before dispatch and marked `Failed` if the
    /// transport rejects it.
    pub async fn send(&mut self, plaintext: &str) -> ChatResult<Option<TranscriptEntry>> {
        let text = plaintext.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let conversation = match &mut self.state {
            SessionState::Ready(conversation) => conversation,
            _ => {
                debug!("Ignoring send without an open conversation");
                return Ok(None);
            }
        };

        SendMessageInput {
            content: text.to_string(),
        }
        .validate_input()?;

        let ciphertext = cipher::encrypt(&conversation.session_key, text)?;
        let entry = TranscriptEntry {
            sender: self.user_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body: MessageBody::Plaintext(text.to_string()),
            delivery: DeliveryStatus::Sent,
        };
        conversation.transcript.push(entry.clone());
        conversation.seen.insert(ciphertext.clone());
        let index = conversation.transcript.len() - 1;

        match self
            .transport
            .send_message(&conversation.peer.peer_id, &ciphertext)
            .await
        {
            Ok(()) => {
                debug!(peer_id = %conversation.peer.peer_id, "Message sent");
                Ok(Some(entry))
            }
            Err(e) => {
                warn!(
                    peer_id = %conversation.peer.peer_id,
                    error = %e,
                    "Message not delivered to relay"
                );
                conversation.transcript[index].delivery = DeliveryStatus::Failed;
                Err(e)
            }
        }
    }

    /// Route a ciphertext from the transport.
    ///
    /// Only the active peer's messages are decrypted; anything else becomes
    /// a notification and stays encrypted. A ciphertext already in the
    /// transcript is ignored.
    pub fn on_inbound_ciphertext(
        &mut self,
        from: &str,
        payload: &str,
        timestamp: i64,
    ) -> InboundOutcome {
        match &mut self.state {
            SessionState::Ready(conversation) if conversation.peer.peer_id == from => {
                if !conversation.seen.insert(payload.to_string()) {
                    debug!(peer_id = from, "Skipping message already in transcript");
                    return InboundOutcome::Duplicate;
                }
                let body = decrypt_body(&conversation.session_key, payload);
                if body == MessageBody::Undecryptable {
                    warn!(peer_id = from, "Inbound message could not be decrypted");
                }
                conversation.transcript.push(TranscriptEntry {
                    sender: from.to_string(),
                    timestamp,
                    body,
                    delivery: DeliveryStatus::Received,
                });
                InboundOutcome::Displayed
            }
            _ => {
                debug!(from, "Message for inactive conversation");
                if self.notifications.len() >= MAX_NOTIFICATIONS {
                    let excess = self.notifications.len() + 1 - MAX_NOTIFICATIONS;
                    self.notifications.drain(..excess);
                }
                self.notifications.push(Notification {
                    from: from.to_string(),
                    received_at: timestamp,
                });
                InboundOutcome::Notified
            }
        }
    }

    pub fn on_inbound(&mut self, inbound: &InboundCiphertext) -> InboundOutcome {
        self.on_inbound_ciphertext(&inbound.from, &inbound.message, inbound.timestamp)
    }

    /// Drop the session key and transcript and return to `Closed`
    pub fn close(&mut self) {
        self.generation += 1;
        if let Some(peer_id) = self.active_peer() {
            info!(peer_id, "Conversation closed");
        }
        self.state = SessionState::Closed;
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("user_id", &self.user_id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
