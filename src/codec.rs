//! MessagePack codec for profile events.
//!
//! The body is a single map: `id`, `action`, then every payload field at the
//! top level. Decoding is permissive: keys other than `id` and `action` are
//! kept in the payload, so fields added by newer front-ends survive a trip
//! through older consumers.

use serde::{Deserialize, Serialize};

use crate::event::{Action, Payload, ProfileEvent};

/// Content type set on published messages.
pub const CONTENT_TYPE: &str = "application/msgpack";

/// Errors raised while encoding an event.
#[derive(Debug, thiserror::Error)]
#[error("Failed to encode event: {0}")]
pub struct EncodeError(String);

/// Errors raised while decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed event body: {0}")]
    Malformed(String),

    #[error("Unrecognized action tag '{0}'")]
    UnknownAction(String),
}

#[derive(Serialize)]
struct WireEventRef<'a> {
    id: i64,
    action: &'static str,
    #[serde(flatten)]
    payload: &'a Payload,
}

#[derive(Deserialize)]
struct WireEvent {
    id: i64,
    action: String,
    #[serde(flatten)]
    payload: Payload,
}

/// Encode an event to MessagePack bytes.
pub fn encode(event: &ProfileEvent) -> Result<Vec<u8>, EncodeError> {
    let wire = WireEventRef {
        id: event.entity_id(),
        action: event.action().as_tag(),
        payload: event.payload(),
    };
    rmp_serde::to_vec_named(&wire).map_err(|e| EncodeError(e.to_string()))
}

/// Decode MessagePack bytes into an event.
pub fn decode(bytes: &[u8]) -> Result<ProfileEvent, DecodeError> {
    let wire: WireEvent =
        rmp_serde::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let action: Action = wire.action.parse().map_err(DecodeError::UnknownAction)?;

    // Reserved keys were consumed by the named fields, so this cannot collide.
    ProfileEvent::new(wire.id, action, wire.payload)
        .map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RESERVED_KEYS;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::{json, Value};

    fn form_payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("name".to_string(), json!("Alice"));
        payload.insert("age".to_string(), json!(27));
        payload.insert("gender".to_string(), json!("female"));
        payload.insert("city".to_string(), json!("Kazan"));
        payload.insert("interests".to_string(), json!(["chess", "hiking"]));
        payload.insert("photo".to_string(), json!(null));
        payload.insert("preferred_age_min".to_string(), json!(25));
        payload.insert("score".to_string(), json!(4.5));
        payload
    }

    #[test]
    fn test_round_trip_create() {
        let event = ProfileEvent::create(1_234_567_890, form_payload()).unwrap();
        let bytes = encode(&event).unwrap();
        assert_eq!(decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_round_trip_negative_id_and_nested_values() {
        let mut payload = Payload::new();
        payload.insert("meta".to_string(), json!({"source": "bot", "tags": [1, -2, 3]}));
        let event = ProfileEvent::update(-100_200_300, payload).unwrap();

        let bytes = encode(&event).unwrap();
        assert_eq!(decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_round_trip_delete() {
        let event = ProfileEvent::delete(42);
        let bytes = encode(&event).unwrap();
        assert_eq!(decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_encoding_is_compact_binary_map() {
        let event = ProfileEvent::delete(42);
        let bytes = encode(&event).unwrap();

        // fixmap with two entries: id, action
        assert_eq!(bytes[0], 0x82);
        let as_json = serde_json::to_vec(&json!({"id": 42, "action": "delete_profile"})).unwrap();
        assert!(bytes.len() < as_json.len());
    }

    #[test]
    fn test_decodes_flat_body_from_other_producers() {
        let bytes = rmp_serde::to_vec_named(&json!({
            "id": 42,
            "action": "delete_profile",
        }))
        .unwrap();

        let event = decode(&bytes).unwrap();
        assert_eq!(event, ProfileEvent::delete(42));
    }

    #[test]
    fn test_short_action_tag_accepted() {
        let bytes = rmp_serde::to_vec_named(&json!({"id": 42, "action": "delete"})).unwrap();
        assert_eq!(decode(&bytes).unwrap().action(), Action::Delete);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let bytes = rmp_serde::to_vec_named(&json!({
            "id": 7,
            "action": "create_profile",
            "name": "Bob",
            "zodiac": "leo",
        }))
        .unwrap();

        let event = decode(&bytes).unwrap();
        assert_eq!(event.payload().get("zodiac"), Some(&json!("leo")));
        assert_eq!(event.payload().get("name"), Some(&json!("Bob")));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let bytes = rmp_serde::to_vec_named(&json!({"id": 7, "action": "archive_profile"})).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownAction(tag) if tag == "archive_profile"));
    }

    #[test]
    fn test_missing_id_rejected() {
        let bytes = rmp_serde::to_vec_named(&json!({"action": "delete_profile"})).unwrap();
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(decode(b"not msgpack at all"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&[]), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let bytes = encode(&ProfileEvent::create(9, form_payload()).unwrap()).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(decode(truncated), Err(DecodeError::Malformed(_))));
    }

    const ALPHABET: &[char] = &['a', 'z', 'Q', '_', ' ', '0', '"', '\\', 'я', 'é', '🙂'];

    fn random_string(rng: &mut StdRng) -> String {
        let len = rng.random_range(0..8);
        (0..len)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())])
            .collect()
    }

    fn random_value(rng: &mut StdRng, depth: u32) -> Value {
        let kinds = if depth == 0 { 6 } else { 8 };
        match rng.random_range(0..kinds) {
            0 => Value::Null,
            1 => Value::Bool(rng.random()),
            2 => json!(rng.random::<i64>()),
            // Covers unsigned values above i64::MAX.
            3 => json!(rng.random::<u64>()),
            4 => json!(rng.random_range(-1.0e12..1.0e12)),
            5 => Value::String(random_string(rng)),
            6 => Value::Array(
                (0..rng.random_range(0..4))
                    .map(|_| random_value(rng, depth - 1))
                    .collect(),
            ),
            _ => Value::Object(
                (0..rng.random_range(0..4))
                    .map(|_| (random_string(rng), random_value(rng, depth - 1)))
                    .collect(),
            ),
        }
    }

    fn random_event(rng: &mut StdRng) -> ProfileEvent {
        let action = match rng.random_range(0..3) {
            0 => Action::Create,
            1 => Action::Update,
            _ => Action::Delete,
        };
        let payload: Payload = (0..rng.random_range(0..6))
            .map(|_| (random_string(rng), random_value(rng, 3)))
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .collect();

        ProfileEvent::new(rng.random(), action, payload).unwrap()
    }

    #[test]
    fn test_round_trip_random_events() {
        let mut rng = StdRng::seed_from_u64(0x5eed_f0e5);

        for case in 0..500 {
            let event = random_event(&mut rng);
            let bytes = encode(&event).unwrap();
            assert_eq!(decode(&bytes).unwrap(), event, "case {}", case);
        }
    }
}
