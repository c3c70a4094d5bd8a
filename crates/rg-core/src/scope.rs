//! Dialog scope strings and the legacy two-party compatibility rule.
//!
//! Scope grammar:
//! - `u:<a>:<b>` two-party dialog, ids ascending
//! - `u:<peer>` legacy single-id form
//! - `g:<chat>` group
//! - `g:<chat>:t:<topic>` topic within a group

/// Scope for a one-to-one dialog. Without a local id only the peer is named.
pub fn user_scope(my_id: Option<i64>, peer_id: i64) -> String {
    match my_id.filter(|id| *id > 0) {
        Some(me) => format!("u:{}:{}", me.min(peer_id), me.max(peer_id)),
        None => format!("u:{}", peer_id),
    }
}

pub fn group_scope(chat_id: i64) -> String {
    format!("g:{}", chat_id)
}

/// Topic scope; a non-positive topic falls back to the group scope.
pub fn topic_scope(chat_id: i64, topic_id: i64) -> String {
    if topic_id > 0 {
        format!("g:{}:t:{}", chat_id, topic_id)
    } else {
        group_scope(chat_id)
    }
}

fn user_scope_ids(scope: &str) -> Option<(i64, Option<i64>)> {
    let rest = scope.strip_prefix("u:")?;
    let mut parts = rest.split(':');
    let a = parts.next()?.parse().ok()?;
    match parts.next() {
        None => Some((a, None)),
        Some(b) => Some((a, Some(b.parse().ok()?))),
    }
}

/// Whether an envelope declaring `envelope_scope`, sent by `sender_id`,
/// belongs in the local dialog `local_scope`.
///
/// Only user scopes are considered. A local `u:a:b` accepts the legacy
/// `u:a` from `b` and `u:b` from `a`, plus an exact match when the sender
/// is one of the two. A local single-id scope accepts either that id or the
/// sender's own id.
pub fn is_compatible_user_scope(local_scope: &str, envelope_scope: &str, sender_id: &str) -> bool {
    if !local_scope.starts_with("u:") || !envelope_scope.starts_with("u:") {
        return false;
    }
    let Ok(sender) = sender_id.trim().parse::<i64>() else {
        return false;
    };
    let Some((a, b)) = user_scope_ids(local_scope) else {
        return false;
    };
    let Some(b) = b else {
        return envelope_scope == format!("u:{}", a) || envelope_scope == format!("u:{}", sender);
    };
    if sender != a && sender != b {
        return false;
    }
    if envelope_scope == format!("u:{}", a) && sender == b {
        return true;
    }
    if envelope_scope == format!("u:{}", b) && sender == a {
        return true;
    }
    envelope_scope == local_scope
}

/// Scope acceptance used by the decrypt flow: an empty side is not checked,
/// otherwise exact match or the legacy user-scope rule.
pub fn scope_matches(expected: &str, envelope_scope: &str, sender_id: &str) -> bool {
    if expected.is_empty() || envelope_scope.is_empty() {
        return true;
    }
    expected == envelope_scope || is_compatible_user_scope(expected, envelope_scope, sender_id)
}
