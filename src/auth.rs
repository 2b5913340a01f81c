use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The four account roles. Every account belongs to exactly one; an
/// account matching none is an integrity failure the caller must surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
    Principal,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
            Role::Principal => "principal",
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

pub fn username_taken(conn: &Connection, username: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM users WHERE username = ?", [username], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

/// Inserts an account row and returns its id. Callers check
/// `username_taken` first; the UNIQUE constraint still backstops races.
pub fn insert_user(conn: &Connection, username: &str, password: &str) -> rusqlite::Result<String> {
    let user_id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, salt) VALUES(?, ?, ?, ?)",
        (&user_id, username, hash_password(password, &salt), &salt),
    )?;
    Ok(user_id)
}

/// Returns the account id when the credentials match.
pub fn verify_login(
    conn: &Connection,
    username: &str,
    password: &str,
) -> rusqlite::Result<Option<String>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, password_hash, salt FROM users WHERE username = ?",
            [username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    Ok(row.and_then(|(id, stored, salt)| {
        if hash_password(password, &salt) == stored {
            Some(id)
        } else {
            None
        }
    }))
}

pub fn set_password(conn: &Connection, user_id: &str, new_password: &str) -> rusqlite::Result<()> {
    let salt = Uuid::new_v4().to_string();
    conn.execute(
        "UPDATE users SET password_hash = ?, salt = ? WHERE id = ?",
        (hash_password(new_password, &salt), &salt, user_id),
    )?;
    Ok(())
}

/// Classifies an account against the role tables, probed in the same
/// order the landing redirect uses. `None` means the account matches no
/// role table; callers must report that as an integrity failure, never
/// default it.
pub fn classify_role(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<Role>> {
    let probes: [(&str, Role); 4] = [
        ("SELECT 1 FROM students WHERE user_id = ?", Role::Student),
        ("SELECT 1 FROM teachers WHERE user_id = ?", Role::Teacher),
        ("SELECT 1 FROM admins WHERE user_id = ?", Role::Admin),
        ("SELECT 1 FROM principals WHERE user_id = ?", Role::Principal),
    ];
    for (sql, role) in probes {
        let hit = conn
            .query_row(sql, [user_id], |r| r.get::<_, i64>(0))
            .optional()?;
        if hit.is_some() {
            return Ok(Some(role));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn mem_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    #[test]
    fn login_roundtrip_and_rejects_wrong_password() {
        let conn = mem_db();
        let user_id = insert_user(&conn, "msmith", "chalkdust").expect("insert");
        assert_eq!(
            verify_login(&conn, "msmith", "chalkdust").expect("verify"),
            Some(user_id.clone())
        );
        assert_eq!(verify_login(&conn, "msmith", "wrong").expect("verify"), None);
        assert_eq!(verify_login(&conn, "nobody", "chalkdust").expect("verify"), None);

        set_password(&conn, &user_id, "erasers").expect("set password");
        assert_eq!(verify_login(&conn, "msmith", "chalkdust").expect("verify"), None);
        assert_eq!(
            verify_login(&conn, "msmith", "erasers").expect("verify"),
            Some(user_id)
        );
    }

    #[test]
    fn classify_role_reports_unclassified_accounts() {
        let conn = mem_db();
        let orphan = insert_user(&conn, "orphan", "pw").expect("insert");
        assert_eq!(classify_role(&conn, &orphan).expect("classify"), None);

        let admin_user = insert_user(&conn, "head", "pw").expect("insert");
        conn.execute(
            "INSERT INTO admins(id, user_id) VALUES(?, ?)",
            ("a1", &admin_user),
        )
        .expect("insert admin");
        assert_eq!(
            classify_role(&conn, &admin_user).expect("classify"),
            Some(Role::Admin)
        );
    }

    #[test]
    fn salts_differ_between_accounts() {
        let conn = mem_db();
        insert_user(&conn, "a", "same").expect("insert");
        insert_user(&conn, "b", "same").expect("insert");
        let hashes: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT password_hash FROM users ORDER BY username")
                .expect("prepare");
            stmt.query_map([], |r| r.get(0))
                .expect("query")
                .collect::<Result<Vec<_>, _>>()
                .expect("collect")
        };
        assert_ne!(hashes[0], hashes[1]);
    }
}
