use crate::model::{now_millis, MessageId, MessageStatus};
use crate::store::StoreResult;
use rusqlite::{params, params_from_iter, types::Value, Connection};

/// Flip the given messages to `read` on behalf of `reader_id`. Messages the
/// reader sent and ids from other rooms are left alone.
pub fn mark_messages_read(
    conn: &Connection,
    chat_id: &str,
    reader_id: &str,
    message_ids: &[MessageId],
) -> StoreResult<usize> {
    if message_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = (0..message_ids.len())
        .map(|i| format!("?{}", i + 5))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE chat_messages SET status = ?1, updated_at = ?2 \
         WHERE chat_id = ?3 AND sender_id <> ?4 AND id IN ({placeholders})"
    );
    let mut values: Vec<Value> = vec![
        Value::Text(MessageStatus::Read.as_str().into()),
        Value::Integer(now_millis()),
        Value::Text(chat_id.into()),
        Value::Text(reader_id.into()),
    ];
    values.extend(message_ids.iter().cloned().map(Value::Text));
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed)
}

/// Messages from others in the room that the user has not read yet.
pub fn unread_count(conn: &Connection, chat_id: &str, user_id: &str) -> StoreResult<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM chat_messages WHERE chat_id = ?1 AND sender_id <> ?2 \
         AND status <> ?3 AND deleted_at IS NULL",
        params![chat_id, user_id, MessageStatus::Read.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}
