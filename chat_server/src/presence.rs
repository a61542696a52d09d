use crate::model::{now_millis, ChatRoom, PresenceStatus, UserId, UserPresence};
use crate::store::StoreResult;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Upsert a user's last-known presence.
pub fn set_presence(conn: &Connection, user_id: &str, online: bool) -> StoreResult<()> {
    let status = if online {
        PresenceStatus::Online
    } else {
        PresenceStatus::Offline
    };
    conn.execute(
        "INSERT INTO user_presence (user_id, is_online, status, last_seen) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(user_id) DO UPDATE SET is_online = excluded.is_online, \
         status = excluded.status, last_seen = excluded.last_seen",
        params![user_id, online, status.as_str(), now_millis()],
    )?;
    Ok(())
}

pub fn presence_of(
    conn: &Connection,
    user_ids: &[UserId],
) -> StoreResult<HashMap<UserId, UserPresence>> {
    if user_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = (1..=user_ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT user_id, is_online, last_seen FROM user_presence WHERE user_id IN ({placeholders})"
    ))?;
    let rows = stmt.query_map(params_from_iter(user_ids.iter()), |row| {
        let is_online: bool = row.get(1)?;
        Ok(UserPresence {
            user_id: row.get(0)?,
            is_online,
            status: if is_online {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            },
            last_seen: row.get(2)?,
        })
    })?;
    let mut out = HashMap::new();
    for p in rows {
        let p = p?;
        out.insert(p.user_id.clone(), p);
    }
    Ok(out)
}

/// Users flagged online whose presence was written within `within`.
pub fn online_users(conn: &Connection, within: Duration) -> StoreResult<Vec<UserId>> {
    let threshold = now_millis() - within.as_millis() as i64;
    let mut stmt = conn.prepare(
        "SELECT user_id FROM user_presence WHERE is_online = 1 AND last_seen >= ?1 ORDER BY user_id",
    )?;
    let ids = stmt
        .query_map([threshold], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Everyone who should hear about `user_id` changing status: the distinct
/// other participants across `rooms`, in first-seen order.
pub fn presence_audience(user_id: &str, rooms: &[ChatRoom]) -> Vec<UserId> {
    let mut seen = HashSet::new();
    rooms
        .iter()
        .flat_map(|room| room.participants.iter())
        .filter(|p| p.as_str() != user_id && seen.insert(p.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::ChatType;

    fn room(id: &str, participants: &[&str]) -> ChatRoom {
        ChatRoom {
            chat_id: id.into(),
            name: None,
            chat_type: ChatType::Group,
            participants: participants.iter().map(|p| p.to_string()).collect(),
            created_by: participants[0].into(),
            is_active: true,
            created_at: 0,
            updated_at: 0,
            last_message: None,
        }
    }

    #[test]
    fn audience_is_deduplicated_and_excludes_self() {
        let rooms = vec![
            room("r1", &["alice", "bob"]),
            room("r2", &["carol", "alice", "bob"]),
        ];
        assert_eq!(presence_audience("alice", &rooms), vec!["bob", "carol"]);
        assert!(presence_audience("alice", &[]).is_empty());
    }

    #[test]
    fn presence_round_trip_and_online_window() {
        let conn = db::init_db(":memory:").unwrap();
        set_presence(&conn, "alice", true).unwrap();
        set_presence(&conn, "bob", true).unwrap();
        set_presence(&conn, "bob", false).unwrap();
        let map = presence_of(&conn, &["alice".into(), "bob".into(), "zed".into()]).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map["alice"].is_online);
        assert_eq!(map["bob"].status, PresenceStatus::Offline);
        assert_eq!(online_users(&conn, Duration::from_secs(300)).unwrap(), vec!["alice"]);

        conn.execute("UPDATE user_presence SET last_seen = 0 WHERE user_id = 'alice'", [])
            .unwrap();
        assert!(online_users(&conn, Duration::from_secs(300)).unwrap().is_empty());
    }
}
