/// Matrix identifier handling: user ids, room aliases, room ids.
///
/// A full identifier is `<sigil><localpart>:<servername>` and the whole
/// string must not exceed 255 bytes.

const MAX_ID_LEN: usize = 255;

/// Validate a localpart against the standard grammar: lowercase letters,
/// digits, and `._=-/`, bounded so `@localpart:domain` fits in 255 bytes.
pub fn validate_localpart(localpart: &str, domain: &str) -> bool {
    if localpart.is_empty() || localpart.len() + domain.len() + 2 > MAX_ID_LEN {
        return false;
    }
    localpart.bytes().all(|b| {
        b.is_ascii_lowercase()
            || b.is_ascii_digit()
            || matches!(b, b'.' | b'_' | b'=' | b'-' | b'/')
    })
}

/// Validate a localpart against the historical grammar: any printable ASCII
/// except colon, same length bound. Server-local users must satisfy this.
pub fn validate_localpart_historical(localpart: &str, domain: &str) -> bool {
    if localpart.is_empty() || localpart.len() + domain.len() + 2 > MAX_ID_LEN {
        return false;
    }
    localpart
        .bytes()
        .all(|b| (0x21..=0x7E).contains(&b) && b != b':')
}

/// Is `server` a plausible `hostname[:port]`?
fn valid_server_name(server: &str) -> bool {
    let (host, port) = match server.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (server, None),
    };
    if host.is_empty()
        || !host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return false;
    }
    match port {
        Some(p) => !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()),
        None => true,
    }
}

/// Split a sigiled identifier (`#alias:server`, `!room:server`) into its
/// localpart and server name. Returns `None` unless the sigil matches and
/// both parts are well-formed.
pub fn parse_common_id(id: &str, sigil: char) -> Option<(String, String)> {
    if id.len() > MAX_ID_LEN {
        return None;
    }
    let rest = id.strip_prefix(sigil)?;
    let (local, server) = rest.split_once(':')?;
    if local.is_empty() || !valid_server_name(server) {
        return None;
    }
    Some((local.to_string(), server.to_string()))
}

/// Whether `id` is a well-formed identifier with the given sigil.
pub fn valid_common_id(id: &str, sigil: char) -> bool {
    parse_common_id(id, sigil).is_some()
}

/// A parsed Matrix user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId {
    pub local: String,
    pub server: String,
}

impl UserId {
    /// Parse either a fully-qualified `@local:server` or a bare localpart,
    /// which is attributed to `default_server`. The localpart must satisfy
    /// the historical grammar.
    pub fn parse(id: &str, default_server: &str) -> Option<UserId> {
        let user = if id.starts_with('@') {
            let (local, server) = parse_common_id(id, '@')?;
            UserId { local, server }
        } else {
            UserId {
                local: id.to_string(),
                server: default_server.to_string(),
            }
        };

        if !validate_localpart_historical(&user.local, &user.server) {
            return None;
        }
        Some(user)
    }

    /// Whether this id belongs to `server`.
    pub fn is_local_to(&self, server: &str) -> bool {
        self.server == server
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}:{}", self.local, self.server)
    }
}
