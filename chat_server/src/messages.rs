use crate::model::{now_millis, ChatMessage, ContentKind, MessageStatus, NewMessage};
use crate::rooms;
use crate::store::{Deletion, StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub const MAX_PAGE: usize = 200;

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, sender_name, content, content_kind, file_url, file_name, reply_to, status, created_at, updated_at, deleted_at";

/// Persist a message and bump the room's `updated_at` / last message.
pub fn create_message(conn: &mut Connection, new: &NewMessage) -> StoreResult<ChatMessage> {
    if new.kind == ContentKind::Text && new.content.trim().is_empty() {
        return Err(StoreError::Invalid("empty_message"));
    }
    let tx = conn.transaction()?;
    if !rooms::chat_exists(&tx, &new.chat_id)? {
        return Err(StoreError::ChatNotFound);
    }
    let id = Uuid::new_v4().to_string();
    let now = now_millis();
    tx.execute(
        &format!("INSERT INTO chat_messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, NULL)"),
        params![
            id,
            new.chat_id,
            new.sender_id,
            new.sender_name,
            new.content,
            new.kind.as_str(),
            new.file_url,
            new.file_name,
            new.reply_to,
            MessageStatus::Sent.as_str(),
            now,
        ],
    )?;
    tx.execute(
        "UPDATE chat_rooms SET updated_at = ?2, last_message_id = ?3 WHERE id = ?1",
        params![new.chat_id, now, id],
    )?;
    tx.commit()?;
    Ok(ChatMessage {
        message_id: id,
        chat_id: new.chat_id.clone(),
        sender_id: new.sender_id.clone(),
        sender_name: new.sender_name.clone(),
        content: new.content.clone(),
        message_type: new.kind,
        file_url: new.file_url.clone(),
        file_name: new.file_name.clone(),
        reply_to: new.reply_to.clone(),
        status: MessageStatus::Sent,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    })
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        message_id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        message_type: ContentKind::parse(&row.get::<_, String>(5)?).unwrap_or_default(),
        file_url: row.get(6)?,
        file_name: row.get(7)?,
        reply_to: row.get(8)?,
        status: MessageStatus::parse(&row.get::<_, String>(9)?).unwrap_or_default(),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        deleted_at: row.get(12)?,
    })
}

pub fn get_message(conn: &Connection, message_id: &str) -> StoreResult<Option<ChatMessage>> {
    let msg = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?1"),
            [message_id],
            row_to_msg,
        )
        .optional()?;
    Ok(msg)
}

/// Page through a room's history. Pages are counted from the newest message;
/// each page comes back in chronological order.
pub fn list_messages(
    conn: &Connection,
    chat_id: &str,
    skip: usize,
    limit: usize,
) -> StoreResult<Vec<ChatMessage>> {
    let limit = limit.min(MAX_PAGE);
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ?1 AND deleted_at IS NULL \
         ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let mut msgs = stmt
        .query_map(params![chat_id, limit as i64, skip as i64], row_to_msg)?
        .collect::<Result<Vec<_>, _>>()?;
    msgs.reverse();
    Ok(msgs)
}

/// Soft-delete a message of `chat_id`. Deleting twice returns the same row
/// with `newly_deleted` unset.
pub fn delete_message(
    conn: &Connection,
    chat_id: &str,
    message_id: &str,
    requester: &str,
) -> StoreResult<Deletion> {
    let mut msg = get_message(conn, message_id)?
        .filter(|m| m.chat_id == chat_id)
        .ok_or(StoreError::MessageNotFound)?;
    if msg.sender_id != requester {
        return Err(StoreError::Forbidden);
    }
    if msg.deleted_at.is_some() {
        return Ok(Deletion {
            message: msg,
            newly_deleted: false,
        });
    }
    let now = now_millis();
    conn.execute(
        "UPDATE chat_messages SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
        params![message_id, now],
    )?;
    msg.deleted_at = Some(now);
    msg.updated_at = now;
    Ok(Deletion {
        message: msg,
        newly_deleted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::{ChatType, NewChat};

    fn setup() -> (Connection, String) {
        let mut conn = db::init_db(":memory:").unwrap();
        let room = rooms::create_chat(
            &mut conn,
            "alice",
            &NewChat {
                name: None,
                chat_type: ChatType::Direct,
                participants: vec!["bob".into()],
            },
        )
        .unwrap();
        (conn, room.chat_id)
    }

    fn text(chat_id: &str, sender: &str, content: &str) -> NewMessage {
        NewMessage {
            chat_id: chat_id.into(),
            sender_id: sender.into(),
            sender_name: sender.to_uppercase(),
            content: content.into(),
            kind: ContentKind::Text,
            reply_to: None,
            file_url: None,
            file_name: None,
        }
    }

    #[test]
    fn create_and_validate() {
        let (mut conn, chat_id) = setup();
        assert!(matches!(
            create_message(&mut conn, &text(&chat_id, "alice", "  ")),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            create_message(&mut conn, &text("nope", "alice", "hi")),
            Err(StoreError::ChatNotFound)
        ));
        let m = create_message(&mut conn, &text(&chat_id, "alice", "hi")).unwrap();
        assert_eq!(m.status, MessageStatus::Sent);
        assert_eq!(get_message(&conn, &m.message_id).unwrap(), Some(m.clone()));
        let room = rooms::get_chat(&conn, &chat_id).unwrap().unwrap();
        assert_eq!(room.last_message, Some(m));
    }

    #[test]
    fn image_may_have_empty_caption() {
        let (mut conn, chat_id) = setup();
        let mut new = text(&chat_id, "alice", "");
        new.kind = ContentKind::Image;
        new.file_url = Some("https://cdn.example/cat.png".into());
        let m = create_message(&mut conn, &new).unwrap();
        assert_eq!(m.message_type, ContentKind::Image);
    }

    #[test]
    fn pagination_order() {
        let (mut conn, chat_id) = setup();
        for body in ["m1", "m2", "m3"] {
            create_message(&mut conn, &text(&chat_id, "alice", body)).unwrap();
        }
        let contents = |v: Vec<ChatMessage>| v.into_iter().map(|m| m.content).collect::<Vec<_>>();
        assert_eq!(contents(list_messages(&conn, &chat_id, 0, 50).unwrap()), ["m1", "m2", "m3"]);
        assert_eq!(contents(list_messages(&conn, &chat_id, 0, 2).unwrap()), ["m2", "m3"]);
        assert_eq!(contents(list_messages(&conn, &chat_id, 2, 2).unwrap()), ["m1"]);
    }

    #[test]
    fn soft_delete_hides_from_history() {
        let (mut conn, chat_id) = setup();
        let m = create_message(&mut conn, &text(&chat_id, "alice", "oops")).unwrap();
        assert!(matches!(
            delete_message(&conn, &chat_id, &m.message_id, "bob"),
            Err(StoreError::Forbidden)
        ));
        assert!(matches!(
            delete_message(&conn, &chat_id, "missing", "alice"),
            Err(StoreError::MessageNotFound)
        ));
        assert!(matches!(
            delete_message(&conn, "elsewhere", &m.message_id, "alice"),
            Err(StoreError::MessageNotFound)
        ));
        let first = delete_message(&conn, &chat_id, &m.message_id, "alice").unwrap();
        assert!(first.newly_deleted);
        assert!(first.message.deleted_at.is_some());
        assert!(list_messages(&conn, &chat_id, 0, 50).unwrap().is_empty());
        assert!(get_message(&conn, &m.message_id).unwrap().unwrap().deleted_at.is_some());

        let again = delete_message(&conn, &chat_id, &m.message_id, "alice").unwrap();
        assert!(!again.newly_deleted);
        assert_eq!(again.message.deleted_at, first.message.deleted_at);
    }
}
