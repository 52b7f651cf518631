//! Turns change events into record captures.

use serde_json::{Map, Value};

use crate::models::{ChangeEvent, ChangeOperation, EntityType, FacilityRecord, RawProviderRecord};
use crate::store::Capture;
use crate::{GoldrecError, Result};

/// Decodes one event into the capture it describes.
///
/// Deletes become retractions. Inserts and updates need an `after` object;
/// `source`, `natural_key` and `captured_at` are taken from the event when the
/// payload omits them, and must agree with the event when present.
///
/// # Errors
/// Returns `MalformedRecord` for blank keys, a missing or non-object `after`
/// image, identity fields that contradict the event, or a payload that does
/// not deserialize into the entity's record type.
pub fn decode_event(event: &ChangeEvent) -> Result<Capture> {
    if event.source.trim().is_empty() {
        return Err(GoldrecError::malformed(format!(
            "event {} has an empty source",
            event.sequence
        )));
    }
    if event.entity_key.trim().is_empty() {
        return Err(GoldrecError::malformed(format!(
            "event {} has an empty entity key",
            event.sequence
        )));
    }

    if event.operation == ChangeOperation::Delete {
        return Ok(Capture::Retraction {
            entity_type: event.entity_type,
            key: event.record_key(),
            captured_at: event.captured_at,
        });
    }

    let Some(Value::Object(after)) = &event.after else {
        return Err(GoldrecError::malformed(format!(
            "{} event {} for {} has no after image",
            event.operation.as_str(),
            event.sequence,
            event.record_key()
        )));
    };

    let mut payload = after.clone();
    reconcile_identity(&mut payload, "source", &event.source, event)?;
    reconcile_identity(&mut payload, "natural_key", &event.entity_key, event)?;
    payload.insert(
        "captured_at".to_string(),
        Value::String(event.captured_at.to_rfc3339()),
    );

    let payload = Value::Object(payload);
    let invalid = |e: serde_json::Error| {
        GoldrecError::malformed(format!(
            "event {} for {}: {}",
            event.sequence,
            event.record_key(),
            e
        ))
    };
    match event.entity_type {
        EntityType::Provider => serde_json::from_value::<RawProviderRecord>(payload)
            .map(Capture::Provider)
            .map_err(invalid),
        EntityType::Facility => serde_json::from_value::<FacilityRecord>(payload)
            .map(Capture::Facility)
            .map_err(invalid),
    }
}

fn reconcile_identity(
    payload: &mut Map<String, Value>,
    field: &str,
    expected: &str,
    event: &ChangeEvent,
) -> Result<()> {
    match payload.get(field) {
        None | Some(Value::Null) => {
            payload.insert(field.to_string(), Value::String(expected.to_string()));
            Ok(())
        }
        Some(Value::String(value)) if value == expected => Ok(()),
        Some(other) => Err(GoldrecError::malformed(format!(
            "event {} carries {} {} but targets {}",
            event.sequence,
            field,
            other,
            event.record_key()
        ))),
    }
}
