//! Boundary decoding of loose store documents into typed records.
//!
//! The document database hands back untyped JSON whose timestamp fields come
//! in three shapes depending on which path wrote them: a `{_seconds,
//! _nanoseconds}` map, an epoch-milliseconds number, or an RFC 3339 string.
//! Everything is validated and coerced exactly once here; nothing downstream
//! re-inspects raw payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use snafu::OptionExt;

use super::error::{
    InvalidTimestampSnafu, MissingFieldSnafu, StoreResult, UnknownMessageKindSnafu,
    UnknownSenderRoleSnafu,
};
use super::ids::{AccountId, ConversationId, MessageId, RequestId};
use super::types::{
    ConversationRecord, LastMessageSummary, MessageKind, MessageRecord, SenderRole,
};

pub fn decode_message(
    conversation_id: ConversationId,
    document: &Value,
) -> StoreResult<MessageRecord> {
    let id = MessageId::parse(require_str(document, "id")?)?;
    let body = require_str(document, "message")?.to_string();

    let kind_token = require_str(document, "message_type")?;
    let kind = MessageKind::from_wire_token(kind_token).context(UnknownMessageKindSnafu {
        stage: "decode-message-kind",
        raw: kind_token.to_string(),
    })?;

    let role_token = require_str(document, "sender_type")?;
    let sender_role = SenderRole::from_wire_token(role_token).context(UnknownSenderRoleSnafu {
        stage: "decode-message-sender-role",
        raw: role_token.to_string(),
    })?;
    let sender_id = AccountId::parse(require_str(document, "sender_id")?)?;

    let created_at = decode_timestamp(document, "created_at")?;
    // Legacy rows predate the updated_at column; fall back to creation time.
    let updated_at = match document.get("updated_at") {
        Some(Value::Null) | None => created_at,
        Some(_) => decode_timestamp(document, "updated_at")?,
    };

    Ok(MessageRecord {
        id,
        conversation_id,
        body,
        kind,
        sender_role,
        sender_id,
        created_at,
        updated_at,
        edited: optional_bool(document, "edited"),
        seen: optional_bool(document, "seen"),
    })
}

pub fn decode_conversation(document: &Value) -> StoreResult<ConversationRecord> {
    let id = ConversationId::parse(require_str(document, "id")?)?;
    let request_id = RequestId::parse(require_str(document, "request_id")?)?;
    let student_id = AccountId::parse(require_str(document, "student_id")?)?;
    let tutor_id = AccountId::parse(require_str(document, "tutor_id")?)?;

    let operator_id = match document.get("operator_id") {
        Some(Value::String(raw)) if !raw.is_empty() => Some(AccountId::parse(raw)?),
        _ => None,
    };

    let last_message = decode_last_message(document)?;

    Ok(ConversationRecord {
        id,
        request_id,
        student_id,
        tutor_id,
        operator_id,
        last_message,
        unread_student: optional_u32(document, "unread_count_student"),
        unread_tutor: optional_u32(document, "unread_count_tutor"),
    })
}

fn decode_last_message(document: &Value) -> StoreResult<Option<LastMessageSummary>> {
    let Some(Value::String(body)) = document.get("last_message") else {
        return Ok(None);
    };

    let kind_token = require_str(document, "last_message_type")?;
    let kind = MessageKind::from_wire_token(kind_token).context(UnknownMessageKindSnafu {
        stage: "decode-last-message-kind",
        raw: kind_token.to_string(),
    })?;
    let at = decode_timestamp(document, "last_message_at")?;

    Ok(Some(LastMessageSummary {
        body: body.clone(),
        kind,
        at,
    }))
}

fn decode_timestamp(document: &Value, field: &'static str) -> StoreResult<DateTime<Utc>> {
    let value = document.get(field).context(MissingFieldSnafu {
        stage: "decode-timestamp",
        field,
    })?;

    let decoded = match value {
        Value::Object(map) => {
            let seconds = map.get("_seconds").and_then(Value::as_i64);
            let nanoseconds = map
                .get("_nanoseconds")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            // A sub-second offset never reaches a full second; anything
            // larger would wrap through the u32 cast into a plausible value.
            u32::try_from(nanoseconds)
                .ok()
                .filter(|nanoseconds| *nanoseconds < 1_000_000_000)
                .zip(seconds)
                .and_then(|(nanoseconds, seconds)| {
                    Utc.timestamp_opt(seconds, nanoseconds).single()
                })
        }
        Value::Number(_) => {
            // Numbers are epoch milliseconds; floats appear when a JSON
            // serializer widened them.
            value
                .as_i64()
                .or_else(|| value.as_f64().map(|millis| millis as i64))
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        }
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    };

    decoded.context(InvalidTimestampSnafu {
        stage: "decode-timestamp",
        field,
        raw: value.to_string(),
    })
}

fn require_str<'a>(document: &'a Value, field: &'static str) -> StoreResult<&'a str> {
    document
        .get(field)
        .and_then(Value::as_str)
        .context(MissingFieldSnafu {
            stage: "decode-require-field",
            field,
        })
}

fn optional_bool(document: &Value, field: &str) -> bool {
    document
        .get(field)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn optional_u32(document: &Value, field: &str) -> u32 {
    document
        .get(field)
        .and_then(Value::as_u64)
        .map(|count| count.min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}
