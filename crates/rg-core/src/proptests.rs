#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::codec::{
        decode_envelope, decode_file, file_version, KeyRequest, FILE_MAGIC, FILE_VERSION, MAX_FILE_BYTES,
    };
    use crate::replay_cache::ReplayCache;
    use crate::scope::{is_compatible_user_scope, scope_matches, user_scope};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_user_scope_is_symmetric(a in 1i64..1_000_000, b in 1i64..1_000_000) {
            prop_assert_eq!(user_scope(Some(a), b), user_scope(Some(b), a));
        }

        // Legacy single-id scopes name the receiver; they are accepted only
        // from the other member of the pair.
        #[test]
        fn test_legacy_scope_from_partner(a in 1i64..1_000_000, b in 1i64..1_000_000) {
            prop_assume!(a != b);
            let local = user_scope(Some(a), b);
            let lo = a.min(b);
            let hi = a.max(b);
            let lo_scope = format!("u:{}", lo);
            let hi_scope = format!("u:{}", hi);
            prop_assert!(is_compatible_user_scope(&local, &lo_scope, &hi.to_string()));
            prop_assert!(is_compatible_user_scope(&local, &hi_scope, &lo.to_string()));
            prop_assert!(!is_compatible_user_scope(&local, &lo_scope, &lo.to_string()));
        }

        #[test]
        fn test_outsider_never_matches_pair(
            a in 1i64..1000,
            b in 1i64..1000,
            outsider in 1000i64..2000,
        ) {
            let local = user_scope(Some(a), b);
            prop_assert!(!is_compatible_user_scope(&local, &local, &outsider.to_string()));
            let a_scope = format!("u:{}", a);
            prop_assert!(!scope_matches(&local, &a_scope, &outsider.to_string()));
        }

        #[test]
        fn test_scope_matches_is_reflexive(scope in "[ug]:[0-9]{1,6}(:[0-9]{1,6})?", sender in "[0-9]{1,6}") {
            prop_assert!(scope_matches(&scope, &scope, &sender));
        }

        #[test]
        fn test_decode_envelope_never_panics(text in ".{0,256}") {
            let _ = decode_envelope(&text);
            let _ = decode_envelope(&format!("RGCRYPT:{}", text));
            let _ = KeyRequest::decode(&format!("RGKEYREQ:{}", text));
        }

        #[test]
        fn test_decode_file_never_panics(mut data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_file(&data, MAX_FILE_BYTES);
            let _ = file_version(&data);
            if data.len() >= 5 {
                data[..4].copy_from_slice(FILE_MAGIC);
                data[4] = FILE_VERSION;
                let _ = decode_file(&data, MAX_FILE_BYTES);
            }
        }

        // A message id is a replay only when a different id was remembered
        // for the same fingerprint.
        #[test]
        fn test_replay_only_on_different_id(ids in proptest::collection::vec(0i64..4, 1..16)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let cache = ReplayCache::in_memory(8);
            let mut last: Option<i64> = None;
            for id in ids {
                let replay = rt.block_on(cache.mark_seen("acct", "u:1:2", "fp", id));
                prop_assert_eq!(replay, last.is_some_and(|l| l != id));
                last = Some(id);
            }
        }
    }
}
