use crate::messages;
use crate::model::{now_millis, ChatRoom, ChatType, NewChat, UserId};
use crate::store::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use uuid::Uuid;

/// Order-preserving de-duplication with the creator always first.
fn participant_list(creator: &str, requested: &[UserId]) -> Vec<UserId> {
    let mut seen = HashSet::new();
    std::iter::once(creator)
        .chain(requested.iter().map(String::as_str))
        .map(str::trim)
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// Create a chat room owned by `creator`.
pub fn create_chat(conn: &mut Connection, creator: &str, chat: &NewChat) -> StoreResult<ChatRoom> {
    if creator.trim().is_empty() {
        return Err(StoreError::Invalid("creator"));
    }
    let participants = participant_list(creator, &chat.participants);
    let name = chat
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    let id = Uuid::new_v4().to_string();
    let now = now_millis();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO chat_rooms (id, name, chat_type, created_by, is_active, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        params![id, name, chat.chat_type.as_str(), creator, now],
    )?;
    for (position, user_id) in participants.iter().enumerate() {
        tx.execute(
            "INSERT INTO chat_participants (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![id, user_id, position as i64],
        )?;
    }
    tx.commit()?;
    Ok(ChatRoom {
        chat_id: id,
        name,
        chat_type: chat.chat_type,
        participants,
        created_by: creator.to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
        last_message: None,
    })
}

pub fn chat_exists(conn: &Connection, chat_id: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM chat_rooms WHERE id = ?1",
            [chat_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Participant ids in join order.
pub fn participants_of(conn: &Connection, chat_id: &str) -> StoreResult<Vec<UserId>> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY position")?;
    let ids = stmt
        .query_map([chat_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

struct RoomRow {
    id: String,
    name: Option<String>,
    chat_type: String,
    created_by: String,
    is_active: bool,
    created_at: i64,
    updated_at: i64,
    last_message_id: Option<String>,
}

const ROOM_COLUMNS: &str =
    "r.id, r.name, r.chat_type, r.created_by, r.is_active, r.created_at, r.updated_at, r.last_message_id";

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        chat_type: row.get(2)?,
        created_by: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        last_message_id: row.get(7)?,
    })
}

fn hydrate(conn: &Connection, row: RoomRow) -> StoreResult<ChatRoom> {
    let participants = participants_of(conn, &row.id)?;
    let last_message = match row.last_message_id.as_deref() {
        Some(id) => messages::get_message(conn, id)?,
        None => None,
    };
    Ok(ChatRoom {
        chat_id: row.id,
        name: row.name,
        chat_type: ChatType::parse(&row.chat_type).unwrap_or_default(),
        participants,
        created_by: row.created_by,
        is_active: row.is_active,
        created_at: row.created_at,
        updated_at: row.updated_at,
        last_message,
    })
}

pub fn get_chat(conn: &Connection, chat_id: &str) -> StoreResult<Option<ChatRoom>> {
    let row = conn
        .query_row(
            &format!("SELECT {ROOM_COLUMNS} FROM chat_rooms r WHERE r.id = ?1"),
            [chat_id],
            row_to_room,
        )
        .optional()?;
    row.map(|r| hydrate(conn, r)).transpose()
}

/// Active rooms containing `user_id`, most recently updated first.
pub fn rooms_containing(conn: &Connection, user_id: &str) -> StoreResult<Vec<ChatRoom>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROOM_COLUMNS} FROM chat_rooms r JOIN chat_participants p ON p.chat_id = r.id \
         WHERE p.user_id = ?1 AND r.is_active = 1 ORDER BY r.updated_at DESC, r.rowid DESC"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_room)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|r| hydrate(conn, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn new_chat(participants: &[&str]) -> NewChat {
        NewChat {
            name: Some("  Study group ".into()),
            chat_type: ChatType::Group,
            participants: participants.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn participants_are_ordered_and_unique() {
        let mut conn = db::init_db(":memory:").unwrap();
        let room = create_chat(&mut conn, "alice", &new_chat(&["carol", "alice", "bob", "carol", " "]))
            .unwrap();
        assert_eq!(room.participants, vec!["alice", "carol", "bob"]);
        assert_eq!(room.name.as_deref(), Some("Study group"));
        assert_eq!(participants_of(&conn, &room.chat_id).unwrap(), room.participants);
        let fetched = get_chat(&conn, &room.chat_id).unwrap().unwrap();
        assert_eq!(fetched, room);
        assert!(get_chat(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn rooms_containing_filters_by_membership() {
        let mut conn = db::init_db(":memory:").unwrap();
        let r1 = create_chat(&mut conn, "alice", &new_chat(&["bob"])).unwrap();
        let r2 = create_chat(&mut conn, "alice", &new_chat(&["carol"])).unwrap();
        let alice: Vec<_> = rooms_containing(&conn, "alice")
            .unwrap()
            .into_iter()
            .map(|r| r.chat_id)
            .collect();
        assert_eq!(alice.len(), 2);
        assert!(alice.contains(&r1.chat_id) && alice.contains(&r2.chat_id));
        let bob = rooms_containing(&conn, "bob").unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].chat_id, r1.chat_id);
        assert!(rooms_containing(&conn, "dave").unwrap().is_empty());

        conn.execute("UPDATE chat_rooms SET is_active = 0 WHERE id = ?1", [&r1.chat_id])
            .unwrap();
        assert!(rooms_containing(&conn, "bob").unwrap().is_empty());
    }
}
