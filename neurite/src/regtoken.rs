//! Registration tokens.
//!
//! A registration token authorizes account creation through the
//! `m.login.registration_token` UIA stage. Each token records how many uses
//! remain (negative = unlimited), how often it has been used, when it
//! expires (0 = never), and which privileges it grants the accounts it
//! creates.

use serde_json::{json, Value};

use crate::users::Privileges;
use neurite_core::{now_ms, random_string};
use neurite_db::{Db, DbError};

/// Length of a generated token name when the creator does not pick one.
pub const GENERATED_NAME_LEN: usize = 16;

/// A registration token record.
#[derive(Debug, Clone, PartialEq)]
pub struct RegToken {
    pub name: String,
    pub created_by: Option<String>,
    /// Unix ms; 0 means the token never expires.
    pub expires_on: u64,
    /// Remaining uses; negative means unlimited.
    pub uses: i64,
    /// How many times the token has authenticated a registration.
    pub used: i64,
    pub grants: Privileges,
}

impl RegToken {
    /// A token is usable while it has uses left and has not expired.
    pub fn valid(&self) -> bool {
        self.uses != 0 && (self.expires_on == 0 || now_ms() < self.expires_on)
    }

    /// The wire/storage form of the record.
    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("name".into(), json!(self.name));
        if let Some(created_by) = &self.created_by {
            out.insert("createdBy".into(), json!(created_by));
        }
        out.insert("expiresOn".into(), json!(self.expires_on));
        out.insert("uses".into(), json!(self.uses));
        out.insert("used".into(), json!(self.used));
        out.insert("grants".into(), self.grants.encode());
        Value::Object(out)
    }

    fn from_json(name: &str, json: &serde_json::Map<String, Value>) -> RegToken {
        RegToken {
            name: name.to_string(),
            created_by: json
                .get("createdBy")
                .and_then(Value::as_str)
                .map(String::from),
            expires_on: json.get("expiresOn").and_then(Value::as_u64).unwrap_or(0),
            uses: json.get("uses").and_then(Value::as_i64).unwrap_or(0),
            used: json.get("used").and_then(Value::as_i64).unwrap_or(0),
            grants: Privileges::decode(json.get("grants")),
        }
    }
}

/// A token name must survive the store's path sanitization unchanged, or
/// the stored record would answer to a different name than it advertises.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '.'])
}

/// Create a token. Fails with [`DbError::Exists`] if the name is taken and
/// `Ok(None)` if the name is unusable.
pub async fn create(
    db: &Db,
    name: &str,
    created_by: Option<&str>,
    expires_on: u64,
    uses: i64,
    grants: Privileges,
) -> Result<Option<RegToken>, DbError> {
    if !valid_name(name) {
        return Ok(None);
    }

    let token = RegToken {
        name: name.to_string(),
        created_by: created_by.map(String::from),
        expires_on,
        uses,
        used: 0,
        grants,
    };

    let mut r = db.create(&["tokens", "registration", name]).await?;
    match token.to_json() {
        Value::Object(map) => r.set_json(map),
        _ => unreachable!("to_json builds an object"),
    }
    db.unlock(r).await?;
    Ok(Some(token))
}

/// Generate an unused random token name.
pub fn generate_name() -> String {
    random_string(GENERATED_NAME_LEN)
}

/// Fetch a token record.
pub async fn get(db: &Db, name: &str) -> Result<Option<RegToken>, DbError> {
    let Some(r) = db.lock(&["tokens", "registration", name]).await? else {
        return Ok(None);
    };
    let token = RegToken::from_json(name, r.json());
    db.unlock(r).await?;
    Ok(Some(token))
}

/// Atomically consume one use of a token, under its lock.
///
/// Returns the post-use record if the token was valid, `Ok(None)` if it was
/// missing, spent, or expired.
pub async fn use_once(db: &Db, name: &str) -> Result<Option<RegToken>, DbError> {
    let Some(mut r) = db.lock(&["tokens", "registration", name]).await? else {
        return Ok(None);
    };

    let mut token = RegToken::from_json(name, r.json());
    if !token.valid() {
        db.unlock(r).await?;
        return Ok(None);
    }

    if token.uses > 0 {
        token.uses -= 1;
    }
    token.used += 1;

    let json = r.json_mut();
    json.insert("uses".into(), json!(token.uses));
    json.insert("used".into(), json!(token.used));
    db.unlock(r).await?;

    Ok(Some(token))
}

/// Remove a token record. Returns whether one existed.
pub async fn delete(db: &Db, name: &str) -> Result<bool, DbError> {
    db.delete(&["tokens", "registration", name]).await
}

/// Every token name in the store.
pub fn list(db: &Db) -> Result<Vec<String>, DbError> {
    db.list(&["tokens", "registration"])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), 0).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (_dir, db) = open_db();
        let token = create(&db, "welcome", Some("admin"), 0, 5, Privileges::ALIAS)
            .await
            .unwrap()
            .unwrap();
        assert!(token.valid());

        let fetched = get(&db, "welcome").await.unwrap().unwrap();
        assert_eq!(fetched, token);
        assert_eq!(fetched.created_by.as_deref(), Some("admin"));
        assert_eq!(fetched.uses, 5);
        assert_eq!(fetched.used, 0);
    }

    #[tokio::test]
    async fn limited_token_runs_out() {
        let (_dir, db) = open_db();
        create(&db, "twice", None, 0, 2, Privileges::NONE)
            .await
            .unwrap()
            .unwrap();

        assert!(use_once(&db, "twice").await.unwrap().is_some());
        assert!(use_once(&db, "twice").await.unwrap().is_some());
        assert!(use_once(&db, "twice").await.unwrap().is_none());

        let spent = get(&db, "twice").await.unwrap().unwrap();
        assert_eq!(spent.uses, 0);
        assert_eq!(spent.used, 2);
        assert!(!spent.valid());
    }

    #[tokio::test]
    async fn negative_uses_means_unlimited() {
        let (_dir, db) = open_db();
        create(&db, "open", None, 0, -1, Privileges::NONE)
            .await
            .unwrap()
            .unwrap();

        for _ in 0..20 {
            assert!(use_once(&db, "open").await.unwrap().is_some());
        }
        let token = get(&db, "open").await.unwrap().unwrap();
        assert_eq!(token.uses, -1);
        assert_eq!(token.used, 20);
        assert!(token.valid());
    }

    #[tokio::test]
    async fn expired_token_is_invalid() {
        let (_dir, db) = open_db();
        create(&db, "old", None, now_ms() - 1, 5, Privileges::NONE)
            .await
            .unwrap()
            .unwrap();

        assert!(!get(&db, "old").await.unwrap().unwrap().valid());
        assert!(use_once(&db, "old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn names_that_would_be_mangled_are_rejected() {
        let (_dir, db) = open_db();
        assert!(create(&db, "a/b", None, 0, 1, Privileges::NONE)
            .await
            .unwrap()
            .is_none());
        assert!(create(&db, "a.b", None, 0, 1, Privileges::NONE)
            .await
            .unwrap()
            .is_none());
        assert!(create(&db, "", None, 0, 1, Privileges::NONE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_and_list() {
        let (_dir, db) = open_db();
        create(&db, "one", None, 0, 1, Privileges::NONE)
            .await
            .unwrap()
            .unwrap();
        create(&db, "two", None, 0, 1, Privileges::NONE)
            .await
            .unwrap()
            .unwrap();

        let mut names = list(&db).unwrap();
        names.sort();
        assert_eq!(names, ["one", "two"]);

        assert!(delete(&db, "one").await.unwrap());
        assert!(!delete(&db, "one").await.unwrap());
        assert_eq!(list(&db).unwrap(), ["two"]);
    }

    #[tokio::test]
    async fn use_of_missing_token_is_none() {
        let (_dir, db) = open_db();
        assert!(use_once(&db, "ghost").await.unwrap().is_none());
        assert!(get(&db, "ghost").await.unwrap().is_none());
    }
}
