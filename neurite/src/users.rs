//! Users, devices, and access tokens.
//!
//! A user is the object at `(users, <localpart>)`. Its `devices` map ties
//! device ids to the access (and optional refresh) token issued for them;
//! every `devices[d].accessToken` has a matching record under
//! `(tokens, access, ...)` and vice versa, and all mutation here keeps the
//! two sides in step. Users are never deleted, only deactivated, so a
//! localpart is never reused.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use neurite_core::{now_ms, random_string};
use neurite_db::{Db, DbError, DbRef};

/// Access tokens are 64 random alphanumeric characters.
const ACCESS_TOKEN_LEN: usize = 64;
/// Refresh tokens likewise.
const REFRESH_TOKEN_LEN: usize = 64;
/// Generated device ids are short but unique enough per user.
const DEVICE_ID_LEN: usize = 10;
/// Password salts.
const SALT_LEN: usize = 16;
/// Lifetime of an access token issued alongside a refresh token.
const REFRESHABLE_TOKEN_LIFETIME_MS: u64 = 1000 * 60 * 60 * 24 * 7;

// ---------------------------------------------------------------------------
// Privileges
// ---------------------------------------------------------------------------

/// A user's privilege bitmask.
///
/// Stored in JSON as an array of grant names; the synthetic `ALL` encodes as
/// the single string `"ALL"` when every real privilege is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Privileges(u32);

impl Privileges {
    pub const NONE: Privileges = Privileges(0);
    pub const DEACTIVATE: Privileges = Privileges(1 << 0);
    pub const ISSUE_TOKENS: Privileges = Privileges(1 << 1);
    pub const CONFIG: Privileges = Privileges(1 << 2);
    pub const GRANT_PRIVILEGES: Privileges = Privileges(1 << 3);
    pub const PROC_CONTROL: Privileges = Privileges(1 << 4);
    pub const ALIAS: Privileges = Privileges(1 << 5);
    pub const ALL: Privileges = Privileges(
        Self::DEACTIVATE.0
            | Self::ISSUE_TOKENS.0
            | Self::CONFIG.0
            | Self::GRANT_PRIVILEGES.0
            | Self::PROC_CONTROL.0
            | Self::ALIAS.0,
    );

    const NAMES: [(Privileges, &'static str); 6] = [
        (Self::DEACTIVATE, "DEACTIVATE"),
        (Self::ISSUE_TOKENS, "ISSUE_TOKENS"),
        (Self::CONFIG, "CONFIG"),
        (Self::GRANT_PRIVILEGES, "GRANT_PRIVILEGES"),
        (Self::PROC_CONTROL, "PROC_CONTROL"),
        (Self::ALIAS, "ALIAS"),
    ];

    pub fn contains(self, other: Privileges) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn from_name(name: &str) -> Privileges {
        if name == "ALL" {
            return Self::ALL;
        }
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(p, _)| *p)
            .unwrap_or(Self::NONE)
    }

    /// Decode a stored `privileges` value; anything unrecognized is ignored.
    pub fn decode(value: Option<&Value>) -> Privileges {
        let Some(Value::Array(items)) = value else {
            return Self::NONE;
        };
        items
            .iter()
            .filter_map(Value::as_str)
            .fold(Self::NONE, |acc, name| {
                Privileges(acc.0 | Self::from_name(name).0)
            })
    }

    /// Encode to the stored form.
    pub fn encode(self) -> Value {
        if self.contains(Self::ALL) {
            return json!(["ALL"]);
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, n)| *n)
            .collect();
        json!(names)
    }
}

impl std::ops::BitOr for Privileges {
    type Output = Privileges;

    fn bitor(self, rhs: Privileges) -> Privileges {
        Privileges(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Lowercase hex of SHA-256 over `password + salt`. This is the on-disk
/// password format; changing it would orphan every stored credential.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Access tokens
// ---------------------------------------------------------------------------

/// A freshly generated access token, not yet necessarily persisted.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub user: String,
    pub device_id: String,
    pub token: String,
    /// 0 means the token never expires.
    pub lifetime_ms: u64,
}

impl AccessToken {
    /// Generate a token for `user`/`device_id`. Refresh-capable logins get
    /// a bounded lifetime; plain logins get a token that never expires.
    pub fn generate(user: &str, device_id: &str, with_refresh: bool) -> AccessToken {
        AccessToken {
            user: user.to_string(),
            device_id: device_id.to_string(),
            token: random_string(ACCESS_TOKEN_LEN),
            lifetime_ms: if with_refresh {
                REFRESHABLE_TOKEN_LIFETIME_MS
            } else {
                0
            },
        }
    }

    /// Persist under `(tokens, access, <token>)`.
    pub async fn save(&self, db: &Db) -> Result<(), DbError> {
        let mut r = db.create(&["tokens", "access", &self.token]).await?;
        let json = r.json_mut();
        json.insert("user".into(), json!(self.user));
        json.insert("device".into(), json!(self.device_id));
        if self.lifetime_ms > 0 {
            json.insert("expires".into(), json!(now_ms() + self.lifetime_ms));
        }
        db.unlock(r).await
    }
}

/// What a successful login hands back to the endpoint.
#[derive(Debug)]
pub struct LoginInfo {
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// An exclusively locked user record.
pub struct User {
    name: String,
    device_id: Option<String>,
    r: DbRef,
}

impl User {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device the presented access token was issued for. Only set on
    /// users obtained through [`User::authenticate`].
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn exists(db: &Db, name: &str) -> bool {
        db.exists(&["users", name])
    }

    /// Lock an existing user.
    pub async fn lock(db: &Db, name: &str) -> Result<Option<User>, DbError> {
        let Some(r) = db.lock(&["users", name]).await? else {
            return Ok(None);
        };
        Ok(Some(User {
            name: name.to_string(),
            device_id: None,
            r,
        }))
    }

    /// Release the user, persisting any mutation.
    pub async fn unlock(self, db: &Db) -> Result<(), DbError> {
        db.unlock(self.r).await
    }

    /// Create a new user with the given password. A missing name draws a
    /// random localpart. Fails with [`DbError::Exists`] when taken.
    pub async fn create(db: &Db, name: Option<&str>, password: &str) -> Result<User, DbError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => random_string(12).to_lowercase(),
        };

        let r = db.create(&["users", &name]).await?;
        let mut user = User {
            name,
            device_id: None,
            r,
        };

        user.set_password(password);
        let json = user.r.json_mut();
        json.insert("createdOn".into(), json!(now_ms()));
        json.insert("deactivated".into(), json!(false));

        Ok(user)
    }

    /// Resolve an access token to its user.
    ///
    /// Returns `Ok(None)` for unknown or expired tokens. The token record is
    /// read and released before the user is locked, to keep the user →
    /// token lock order acyclic with the login path.
    pub async fn authenticate(db: &Db, token: &str) -> Result<Option<User>, DbError> {
        let Some(token_ref) = db.lock(&["tokens", "access", token]).await? else {
            return Ok(None);
        };

        let json = token_ref.json();
        let user_name = json.get("user").and_then(Value::as_str).map(String::from);
        let device_id = json.get("device").and_then(Value::as_str).map(String::from);
        let expires = json.get("expires").and_then(Value::as_u64).unwrap_or(0);
        db.unlock(token_ref).await?;

        let Some(user_name) = user_name else {
            return Ok(None);
        };
        if expires > 0 && now_ms() >= expires {
            return Ok(None);
        }

        let Some(mut user) = User::lock(db, &user_name).await? else {
            return Ok(None);
        };
        user.device_id = device_id;
        Ok(Some(user))
    }

    pub fn check_password(&self, password: &str) -> bool {
        let json = self.r.json();
        let stored = json.get("password").and_then(Value::as_str);
        let salt = json.get("salt").and_then(Value::as_str);
        match (stored, salt) {
            (Some(stored), Some(salt)) => hash_password(password, salt) == stored,
            _ => false,
        }
    }

    pub fn set_password(&mut self, password: &str) {
        let salt = random_string(SALT_LEN);
        let hash = hash_password(password, &salt);
        let json = self.r.json_mut();
        json.insert("salt".into(), json!(salt));
        json.insert("password".into(), json!(hash));
    }

    pub fn deactivated(&self) -> bool {
        self.r
            .json()
            .get("deactivated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Mark the user deactivated, recording who did it and why. The record
    /// itself stays: localparts are never reused.
    pub fn deactivate(&mut self, by: Option<&str>, reason: Option<&str>) {
        let by = by.unwrap_or(&self.name).to_string();
        let json = self.r.json_mut();
        json.insert("deactivated".into(), json!(true));

        let mut info = Map::new();
        info.insert("by".into(), json!(by));
        if let Some(reason) = reason {
            info.insert("reason".into(), json!(reason));
        }
        json.insert("deactivate".into(), Value::Object(info));
    }

    pub fn reactivate(&mut self) {
        let json = self.r.json_mut();
        json.insert("deactivated".into(), json!(false));
        json.remove("deactivate");
    }

    /// Verify the password and issue tokens for a device.
    ///
    /// Returns `Ok(None)` on a bad password or a deactivated account. A
    /// device logging in again has its previous access and refresh token
    /// records deleted before the new ones are recorded.
    pub async fn login(
        &mut self,
        db: &Db,
        password: &str,
        device_id: Option<&str>,
        display_name: Option<&str>,
        with_refresh: bool,
    ) -> Result<Option<LoginInfo>, DbError> {
        if !self.check_password(password) || self.deactivated() {
            return Ok(None);
        }

        let device_id = match device_id {
            Some(id) => id.to_string(),
            None => random_string(DEVICE_ID_LEN),
        };

        let access_token = AccessToken::generate(&self.name, &device_id, with_refresh);
        access_token.save(db).await?;

        let refresh_token = if with_refresh {
            let refresh = random_string(REFRESH_TOKEN_LEN);
            let mut r = db.create(&["tokens", "refresh", &refresh]).await?;
            r.json_mut()
                .insert("refreshes".into(), json!(access_token.token));
            db.unlock(r).await?;
            Some(refresh)
        } else {
            None
        };

        // Retire the device's previous tokens, then record the new ones.
        let old_device = self
            .devices_mut()
            .get(&device_id)
            .and_then(Value::as_object)
            .cloned();
        if let Some(old) = &old_device {
            if let Some(old_access) = old.get("accessToken").and_then(Value::as_str) {
                db.delete(&["tokens", "access", old_access]).await?;
            }
            if let Some(old_refresh) = old.get("refreshToken").and_then(Value::as_str) {
                db.delete(&["tokens", "refresh", old_refresh]).await?;
            }
        }

        let mut device = match old_device {
            Some(mut old) => {
                old.remove("accessToken");
                old.remove("refreshToken");
                old
            }
            None => {
                let mut device = Map::new();
                if let Some(display_name) = display_name {
                    device.insert("displayName".into(), json!(display_name));
                }
                device
            }
        };

        device.insert("accessToken".into(), json!(access_token.token));
        if let Some(refresh) = &refresh_token {
            device.insert("refreshToken".into(), json!(refresh));
        }
        self.devices_mut()
            .insert(device_id, Value::Object(device));

        Ok(Some(LoginInfo {
            access_token,
            refresh_token,
        }))
    }

    /// The live `devices` subtree, created on first use. Borrowed from the
    /// locked record, so it is only valid while this user is held.
    fn devices_mut(&mut self) -> &mut Map<String, Value> {
        let json = self.r.json_mut();
        if !matches!(json.get("devices"), Some(Value::Object(_))) {
            json.insert("devices".into(), Value::Object(Map::new()));
        }
        match json.get_mut("devices") {
            Some(Value::Object(devices)) => devices,
            _ => unreachable!("devices was just inserted as an object"),
        }
    }

    fn devices(&self) -> Option<&Map<String, Value>> {
        self.r.json().get("devices").and_then(Value::as_object)
    }

    /// Delete one access token belonging to this user, along with its
    /// paired refresh token and device entry. Returns whether anything was
    /// deleted.
    pub async fn delete_token(&mut self, db: &Db, token: &str) -> Result<bool, DbError> {
        let Some(token_ref) = db.lock(&["tokens", "access", token]).await? else {
            return Ok(false);
        };
        let json = token_ref.json();
        let owner = json.get("user").and_then(Value::as_str).map(String::from);
        let device_id = json.get("device").and_then(Value::as_str).map(String::from);
        db.unlock(token_ref).await?;

        if owner.as_deref() != Some(self.name.as_str()) {
            // Token does not match this user; leave it alone.
            return Ok(false);
        }
        let Some(device_id) = device_id else {
            return Ok(false);
        };

        let refresh = self
            .devices()
            .and_then(|devices| devices.get(&device_id))
            .and_then(|device| device.get("refreshToken"))
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(refresh) = refresh {
            db.delete(&["tokens", "refresh", &refresh]).await?;
        }

        if self.devices_mut().remove(&device_id).is_none() {
            return Ok(false);
        }

        db.delete(&["tokens", "access", token]).await?;
        Ok(true)
    }

    /// Delete every token this user has, optionally sparing the one the
    /// request came in on.
    pub async fn delete_tokens(&mut self, db: &Db, exempt: Option<&str>) -> Result<(), DbError> {
        let devices = match self.devices() {
            Some(devices) => devices.clone(),
            None => return Ok(()),
        };

        for (device_id, device) in &devices {
            let access = device.get("accessToken").and_then(Value::as_str);
            if exempt.is_some() && access == exempt {
                continue;
            }

            if let Some(access) = access {
                db.delete(&["tokens", "access", access]).await?;
            }
            if let Some(refresh) = device.get("refreshToken").and_then(Value::as_str) {
                db.delete(&["tokens", "refresh", refresh]).await?;
            }
            self.devices_mut().remove(device_id);
        }
        Ok(())
    }

    pub fn get_profile(&self, key: &str) -> Option<&str> {
        self.r
            .json()
            .get("profile")
            .and_then(Value::as_object)?
            .get(key)
            .and_then(Value::as_str)
    }

    pub fn set_profile(&mut self, key: &str, value: &str) {
        let json = self.r.json_mut();
        if !matches!(json.get("profile"), Some(Value::Object(_))) {
            json.insert("profile".into(), Value::Object(Map::new()));
        }
        if let Some(Value::Object(profile)) = json.get_mut("profile") {
            profile.insert(key.to_string(), json!(value));
        }
    }

    /// Record the presented token's access token on a device entry,
    /// replacing whatever was there. Used by the refresh exchange.
    fn set_device_access_token(&mut self, device_id: &str, token: &str) -> bool {
        match self.devices_mut().get_mut(device_id) {
            Some(Value::Object(device)) => {
                device.insert("accessToken".into(), json!(token));
                true
            }
            _ => false,
        }
    }

    pub fn privileges(&self) -> Privileges {
        Privileges::decode(self.r.json().get("privileges"))
    }

    pub fn set_privileges(&mut self, privileges: Privileges) {
        let json = self.r.json_mut();
        if privileges.is_empty() {
            json.remove("privileges");
        } else {
            json.insert("privileges".into(), privileges.encode());
        }
    }
}

/// Exchange a refresh token for a fresh access token.
///
/// The old access token record is deleted, the device entry is repointed,
/// and the refresh token stays valid, now refreshing the new token.
/// Returns `Ok(None)` when the refresh token, its access token, or the
/// device entry no longer exist.
pub async fn refresh_token_exchange(
    db: &Db,
    refresh: &str,
) -> Result<Option<AccessToken>, DbError> {
    let Some(r) = db.lock(&["tokens", "refresh", refresh]).await? else {
        return Ok(None);
    };
    let old_access = r
        .json()
        .get("refreshes")
        .and_then(Value::as_str)
        .map(String::from);
    db.unlock(r).await?;
    let Some(old_access) = old_access else {
        return Ok(None);
    };

    let Some(r) = db.lock(&["tokens", "access", &old_access]).await? else {
        return Ok(None);
    };
    let user_name = r.json().get("user").and_then(Value::as_str).map(String::from);
    let device_id = r.json().get("device").and_then(Value::as_str).map(String::from);
    db.unlock(r).await?;
    let (Some(user_name), Some(device_id)) = (user_name, device_id) else {
        return Ok(None);
    };

    let Some(mut user) = User::lock(db, &user_name).await? else {
        return Ok(None);
    };

    let token = AccessToken::generate(&user_name, &device_id, true);
    if !user.set_device_access_token(&device_id, &token.token) {
        // The device was logged out from under this refresh token.
        return Ok(None);
    }
    token.save(db).await?;
    db.delete(&["tokens", "access", &old_access]).await?;
    user.unlock(db).await?;

    let Some(mut r) = db.lock(&["tokens", "refresh", refresh]).await? else {
        return Ok(None);
    };
    r.json_mut().insert("refreshes".into(), json!(token.token));
    db.unlock(r).await?;

    Ok(Some(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path(), 0).unwrap();
        (dir, db)
    }

    #[test]
    fn privileges_encode_decode() {
        let p = Privileges::ISSUE_TOKENS | Privileges::ALIAS;
        let encoded = p.encode();
        assert_eq!(encoded, json!(["ISSUE_TOKENS", "ALIAS"]));
        assert_eq!(Privileges::decode(Some(&encoded)), p);
    }

    #[test]
    fn all_privileges_collapse_to_all() {
        let encoded = Privileges::ALL.encode();
        assert_eq!(encoded, json!(["ALL"]));
        let decoded = Privileges::decode(Some(&encoded));
        assert!(decoded.contains(Privileges::CONFIG));
        assert!(decoded.contains(Privileges::ALL));
    }

    #[test]
    fn unknown_privilege_names_are_ignored() {
        let decoded = Privileges::decode(Some(&json!(["CONFIG", "FLY", 42])));
        assert_eq!(decoded, Privileges::CONFIG);
        assert_eq!(Privileges::decode(None), Privileges::NONE);
    }

    #[tokio::test]
    async fn password_is_stored_as_salted_sha256_hex() {
        let (_dir, db) = open_db();
        let user = User::create(&db, Some("alice"), "hunter2").await.unwrap();

        let stored = user.r.json().get("password").and_then(Value::as_str).unwrap();
        let salt = user.r.json().get("salt").and_then(Value::as_str).unwrap();
        assert_eq!(salt.len(), SALT_LEN);
        assert_eq!(stored, hash_password("hunter2", salt));
        assert!(stored.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert!(user.check_password("hunter2"));
        assert!(!user.check_password("hunter3"));
        user.unlock(&db).await.unwrap();
    }

    #[tokio::test]
    async fn login_issues_matching_token_records() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();

        let info = user
            .login(&db, "pw", None, Some("phone"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.access_token.token.len(), ACCESS_TOKEN_LEN);
        assert_eq!(info.access_token.device_id.len(), DEVICE_ID_LEN);
        assert!(info.refresh_token.is_none());
        assert_eq!(info.access_token.lifetime_ms, 0);

        let device_id = info.access_token.device_id.clone();
        let recorded = user
            .devices()
            .unwrap()
            .get(&device_id)
            .and_then(|d| d.get("accessToken"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(recorded, info.access_token.token);
        user.unlock(&db).await.unwrap();

        let token_ref = db
            .lock(&["tokens", "access", &info.access_token.token])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token_ref.json().get("user"), Some(&json!("alice")));
        assert_eq!(token_ref.json().get("device"), Some(&json!(device_id)));
        assert_eq!(token_ref.json().get("expires"), None);
        db.unlock(token_ref).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_login_sets_lifetime_and_refresh_record() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();

        let info = user
            .login(&db, "pw", Some("laptop"), None, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.access_token.lifetime_ms, REFRESHABLE_TOKEN_LIFETIME_MS);
        let refresh = info.refresh_token.clone().unwrap();
        user.unlock(&db).await.unwrap();

        let r = db.lock(&["tokens", "refresh", &refresh]).await.unwrap().unwrap();
        assert_eq!(
            r.json().get("refreshes"),
            Some(&json!(info.access_token.token))
        );
        db.unlock(r).await.unwrap();

        // The access token record carries an expiry in the future.
        let r = db
            .lock(&["tokens", "access", &info.access_token.token])
            .await
            .unwrap()
            .unwrap();
        let expires = r.json().get("expires").and_then(Value::as_u64).unwrap();
        assert!(expires > now_ms());
        db.unlock(r).await.unwrap();
    }

    #[tokio::test]
    async fn relogin_on_same_device_replaces_tokens() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();

        let first = user
            .login(&db, "pw", Some("laptop"), None, true)
            .await
            .unwrap()
            .unwrap();
        let second = user
            .login(&db, "pw", Some("laptop"), None, false)
            .await
            .unwrap()
            .unwrap();
        user.unlock(&db).await.unwrap();

        assert_ne!(first.access_token.token, second.access_token.token);
        assert!(!db.exists(&["tokens", "access", &first.access_token.token]));
        assert!(!db.exists(&["tokens", "refresh", first.refresh_token.as_ref().unwrap()]));
        assert!(db.exists(&["tokens", "access", &second.access_token.token]));
    }

    #[tokio::test]
    async fn wrong_password_and_deactivation_block_login() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();

        assert!(user.login(&db, "nope", None, None, false).await.unwrap().is_none());

        user.deactivate(Some("admin"), Some("abuse"));
        assert!(user.deactivated());
        assert!(user.login(&db, "pw", None, None, false).await.unwrap().is_none());
        assert_eq!(
            user.r.json().get("deactivate"),
            Some(&json!({"by": "admin", "reason": "abuse"}))
        );

        user.reactivate();
        assert!(!user.deactivated());
        assert_eq!(user.r.json().get("deactivate"), None);
        assert!(user.login(&db, "pw", None, None, false).await.unwrap().is_some());
        user.unlock(&db).await.unwrap();
    }

    #[tokio::test]
    async fn authenticate_resolves_and_rejects() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();
        let info = user
            .login(&db, "pw", Some("dev0"), None, false)
            .await
            .unwrap()
            .unwrap();
        user.unlock(&db).await.unwrap();

        let authed = User::authenticate(&db, &info.access_token.token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(authed.name(), "alice");
        assert_eq!(authed.device_id(), Some("dev0"));
        authed.unlock(&db).await.unwrap();

        assert!(User::authenticate(&db, "bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_tokens_do_not_authenticate() {
        let (_dir, db) = open_db();
        let user = User::create(&db, Some("alice"), "pw").await.unwrap();
        user.unlock(&db).await.unwrap();

        let mut r = db.create(&["tokens", "access", "stale"]).await.unwrap();
        r.json_mut().insert("user".into(), json!("alice"));
        r.json_mut().insert("device".into(), json!("old"));
        r.json_mut().insert("expires".into(), json!(now_ms() - 1000));
        db.unlock(r).await.unwrap();

        assert!(User::authenticate(&db, "stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_token_cascades() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();
        let info = user
            .login(&db, "pw", Some("laptop"), None, true)
            .await
            .unwrap()
            .unwrap();

        assert!(user
            .delete_token(&db, &info.access_token.token)
            .await
            .unwrap());
        assert!(!db.exists(&["tokens", "access", &info.access_token.token]));
        assert!(!db.exists(&["tokens", "refresh", info.refresh_token.as_ref().unwrap()]));
        assert!(user.devices().unwrap().get("laptop").is_none());

        // A token that is not ours stays.
        let mut other = User::create(&db, Some("bob"), "pw").await.unwrap();
        let other_info = other
            .login(&db, "pw", None, None, false)
            .await
            .unwrap()
            .unwrap();
        other.unlock(&db).await.unwrap();
        assert!(!user
            .delete_token(&db, &other_info.access_token.token)
            .await
            .unwrap());
        assert!(db.exists(&["tokens", "access", &other_info.access_token.token]));

        user.unlock(&db).await.unwrap();
    }

    #[tokio::test]
    async fn delete_tokens_honors_exemption() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();
        let keep = user
            .login(&db, "pw", Some("keep"), None, false)
            .await
            .unwrap()
            .unwrap();
        let drop = user
            .login(&db, "pw", Some("drop"), None, false)
            .await
            .unwrap()
            .unwrap();

        user.delete_tokens(&db, Some(&keep.access_token.token))
            .await
            .unwrap();

        assert!(db.exists(&["tokens", "access", &keep.access_token.token]));
        assert!(!db.exists(&["tokens", "access", &drop.access_token.token]));
        assert!(user.devices().unwrap().contains_key("keep"));
        assert!(!user.devices().unwrap().contains_key("drop"));
        user.unlock(&db).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_exchange_rotates_the_access_token() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();
        let info = user
            .login(&db, "pw", Some("laptop"), None, true)
            .await
            .unwrap()
            .unwrap();
        user.unlock(&db).await.unwrap();
        let refresh = info.refresh_token.unwrap();

        let new_token = refresh_token_exchange(&db, &refresh)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(new_token.token, info.access_token.token);
        assert_eq!(new_token.device_id, "laptop");
        assert_eq!(new_token.lifetime_ms, REFRESHABLE_TOKEN_LIFETIME_MS);

        // The old token is gone, the new one authenticates, and the
        // refresh token now refreshes the new one.
        assert!(!db.exists(&["tokens", "access", &info.access_token.token]));
        let authed = User::authenticate(&db, &new_token.token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(authed.device_id(), Some("laptop"));
        authed.unlock(&db).await.unwrap();

        let r = db.lock(&["tokens", "refresh", &refresh]).await.unwrap().unwrap();
        assert_eq!(r.json().get("refreshes"), Some(&json!(new_token.token)));
        db.unlock(r).await.unwrap();

        assert!(refresh_token_exchange(&db, "bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn profile_entries_round_trip() {
        let (_dir, db) = open_db();
        let mut user = User::create(&db, Some("alice"), "pw").await.unwrap();
        assert_eq!(user.get_profile("displayname"), None);
        user.set_profile("displayname", "Alice");
        user.set_profile("avatar_url", "mxc://example.org/abc");
        assert_eq!(user.get_profile("displayname"), Some("Alice"));
        assert_eq!(user.get_profile("avatar_url"), Some("mxc://example.org/abc"));
        user.unlock(&db).await.unwrap();
    }

    #[tokio::test]
    async fn random_localpart_is_drawn_when_unnamed() {
        let (_dir, db) = open_db();
        let user = User::create(&db, None, "pw").await.unwrap();
        assert_eq!(user.name().len(), 12);
        assert!(neurite_core::validate_localpart(user.name(), "example.org"));
        user.unlock(&db).await.unwrap();
    }
}
