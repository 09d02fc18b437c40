//! Relay events and the batches handed to the sink
//!
//! Events follow the NIP-01 layout. The id is the sha256 of the canonical
//! array `[0, pubkey, created_at, kind, tags, content]`; an event whose id
//! does not match its content is rejected as malformed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{RelayId, Timestamp};
use crate::error::ItemError;

/// A single relay event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Build an event with a correct id and an all-zero signature
    pub fn build(
        pubkey: impl Into<String>,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: impl Into<String>,
    ) -> Self {
        let mut event = Self {
            id: String::new(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: "0".repeat(128),
        };
        event.id = event.compute_id();
        event
    }

    /// Parse and validate a raw relay payload
    pub fn parse(raw: &serde_json::Value) -> Result<Self, ItemError> {
        let event: Event = serde_json::from_value(raw.clone())
            .map_err(|e| ItemError::Shape(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Check field shapes and the content-derived id
    pub fn validate(&self) -> Result<(), ItemError> {
        check_hex("id", &self.id, 64)?;
        check_hex("pubkey", &self.pubkey, 64)?;
        check_hex("sig", &self.sig, 128)?;

        let computed = self.compute_id();
        if computed != self.id {
            return Err(ItemError::IdMismatch {
                claimed: self.id.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// sha256 over the canonical serialization, lowercase hex
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp(self.created_at)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn check_hex(field: &'static str, value: &str, expected: usize) -> Result<(), ItemError> {
    let ok = value.len() == expected
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(ItemError::BadHex { field, expected })
    }
}

/// Ordered events from one relay, the unit of sink delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub relay: RelayId,
    pub observed_at: Timestamp,
    pub events: Vec<Event>,
}

impl EventBatch {
    pub fn new(relay: RelayId) -> Self {
        Self {
            relay,
            observed_at: Timestamp::now(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Move the accumulated events out, leaving an empty batch behind
    pub fn take(&mut self) -> EventBatch {
        EventBatch {
            relay: self.relay.clone(),
            observed_at: Timestamp::now(),
            events: std::mem::take(&mut self.events),
        }
    }
}

/// An event as persisted, with the relay it was first seen on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    pub first_relay: String,
    pub observed_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn test_built_event_validates() {
        let event = Event::build(pubkey(), 1_700_000_000, 1, vec![], "hello");
        assert_eq!(event.id.len(), 64);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_parse_roundtrips_through_json() {
        let event = Event::build(
            pubkey(),
            1_700_000_000,
            1,
            vec![vec!["t".into(), "rust".into()]],
            "tagged",
        );
        let parsed = Event::parse(&event.to_value()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_tampered_content_is_rejected() {
        let mut event = Event::build(pubkey(), 1_700_000_000, 1, vec![], "original");
        event.content = "tampered".into();
        let err = Event::parse(&event.to_value()).unwrap_err();
        assert!(matches!(err, ItemError::IdMismatch { .. }));
    }

    #[test]
    fn test_bad_pubkey_is_rejected() {
        let mut value = Event::build(pubkey(), 1, 1, vec![], "x").to_value();
        value["pubkey"] = serde_json::json!("not-hex");
        let err = Event::parse(&value).unwrap_err();
        assert_eq!(
            err,
            ItemError::BadHex {
                field: "pubkey",
                expected: 64
            }
        );
    }

    #[test]
    fn test_non_object_is_shape_error() {
        let err = Event::parse(&serde_json::json!("just a string")).unwrap_err();
        assert!(matches!(err, ItemError::Shape(_)));
    }

    #[test]
    fn test_batch_take_empties_source() {
        let mut batch = EventBatch::new(RelayId::new("r:1"));
        batch.push(Event::build(pubkey(), 1, 1, vec![], "a"));
        batch.push(Event::build(pubkey(), 2, 1, vec![], "b"));

        let taken = batch.take();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty());
        assert_eq!(taken.relay, batch.relay);
    }
}
