#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;
    use vigil_core::{Message, Role, StatePaths};
    use vigil_runtime::SessionStore;

    fn store() -> (TempDir, StatePaths, SessionStore) {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::with_root(dir.path());
        paths.ensure_dirs().unwrap();
        let store = SessionStore::new(paths.clone());
        (dir, paths, store)
    }

    fn exchange(store: &SessionStore, key: &str, user: &str, reply: &str) {
        store.append(key, Message::user(user)).unwrap();
        store.append(key, Message::assistant(reply)).unwrap();
    }

    // ── Append & transcript ────────────────────────────────────

    #[test]
    fn test_append_and_transcript() {
        let (_dir, _paths, store) = store();
        exchange(&store, "relay:c1", "hello", "hi there");
        let transcript = store.transcript("relay:c1").unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[1].text, "hi there");
    }

    #[test]
    fn test_unknown_session_is_empty() {
        let (_dir, _paths, store) = store();
        assert!(store.transcript("relay:nobody").unwrap().is_empty());
        assert!(store.recent("relay:nobody", 12, 8000).unwrap().is_empty());
    }

    #[test]
    fn test_transcript_survives_restart() {
        let (_dir, paths, store) = store();
        exchange(&store, "local:console", "remember the milk", "noted");
        drop(store);

        let reopened = SessionStore::new(paths);
        let transcript = reopened.transcript("local:console").unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].text, "remember the milk");
    }

    #[test]
    fn test_cache_sees_appends_after_load() {
        let (_dir, _paths, store) = store();
        exchange(&store, "relay:c1", "one", "1");
        assert_eq!(store.transcript("relay:c1").unwrap().len(), 2);
        exchange(&store, "relay:c1", "two", "2");
        assert_eq!(store.transcript("relay:c1").unwrap().len(), 4);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let (_dir, _paths, store) = store();
        exchange(&store, "a:b_c", "first", "1");
        exchange(&store, "a_b:c", "second", "2");
        assert_eq!(store.transcript("a:b_c").unwrap()[0].text, "first");
        assert_eq!(store.transcript("a_b:c").unwrap()[0].text, "second");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let (_dir, paths, store) = store();
        exchange(&store, "relay:c1", "ok", "fine");
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(paths.session_file("relay:c1"))
                .unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        let reopened = SessionStore::new(paths);
        assert_eq!(reopened.transcript("relay:c1").unwrap().len(), 2);
    }

    // ── Recent ─────────────────────────────────────────────────

    #[test]
    fn test_recent_respects_turn_limit() {
        let (_dir, _paths, store) = store();
        for i in 0..20 {
            exchange(&store, "relay:c1", &format!("q{i}"), &format!("a{i}"));
        }
        let recent = store.recent("relay:c1", 12, 100_000).unwrap();
        assert_eq!(recent.len(), 24);
        assert_eq!(recent[0].text, "q8");
        assert_eq!(recent.last().unwrap().text, "a19");
    }

    #[test]
    fn test_recent_respects_char_limit_with_whole_turns() {
        let (_dir, _paths, store) = store();
        // Each turn is 20 chars.
        for i in 0..5 {
            exchange(&store, "relay:c1", &format!("question{i:02}"), &format!("answer{i:02}xx"));
        }
        let recent = store.recent("relay:c1", 12, 45).unwrap();
        let total: usize = recent.iter().map(Message::char_len).sum();
        assert!(total <= 45);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].text, "question03");
        assert_eq!(recent[0].role, Role::User);
    }

    #[test]
    fn test_recent_empty_when_newest_turn_too_large() {
        let (_dir, _paths, store) = store();
        exchange(&store, "relay:c1", "short", "ok");
        exchange(&store, "relay:c1", &"x".repeat(500), "ok");
        assert!(store.recent("relay:c1", 12, 100).unwrap().is_empty());
    }

    #[test]
    fn test_recent_never_splits_a_message() {
        let (_dir, _paths, store) = store();
        exchange(&store, "relay:c1", "abcdefghij", "klmnopqrst");
        let recent = store.recent("relay:c1", 12, 15).unwrap();
        assert!(recent.is_empty());
        let recent = store.recent("relay:c1", 12, 20).unwrap();
        assert_eq!(recent[0].text, "abcdefghij");
        assert_eq!(recent[1].text, "klmnopqrst");
    }

    // ── Keys & archive ─────────────────────────────────────────

    #[test]
    fn test_keys_round_trip_through_file_names() {
        let (_dir, _paths, store) = store();
        exchange(&store, "relay:c1", "a", "b");
        exchange(&store, "local:console", "a", "b");
        exchange(&store, "weird:x/y", "a", "b");
        assert_eq!(
            store.keys().unwrap(),
            vec!["local:console".to_string(), "relay:c1".to_string(), "weird:x/y".to_string()]
        );
    }

    #[test]
    fn test_archive_starts_fresh_session() {
        let (_dir, paths, store) = store();
        exchange(&store, "relay:c1", "old", "news");
        let archived = store.archive("relay:c1").unwrap().unwrap();
        assert!(archived.starts_with(paths.session_archive_dir()));
        assert!(archived.exists());
        assert!(store.transcript("relay:c1").unwrap().is_empty());
        assert!(store.keys().unwrap().is_empty());

        exchange(&store, "relay:c1", "new", "start");
        assert_eq!(store.transcript("relay:c1").unwrap()[0].text, "new");
    }

    #[test]
    fn test_archive_missing_session_is_none() {
        let (_dir, _paths, store) = store();
        assert!(store.archive("relay:none").unwrap().is_none());
    }

    // ── Exchanges & cache ──────────────────────────────────────

    #[test]
    fn test_append_exchange_writes_both_turns() {
        let (_dir, _paths, store) = store();
        store
            .append_exchange("relay:c1", Message::user("ping"), Message::assistant("pong"))
            .unwrap();
        let transcript = store.transcript("relay:c1").unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].role, Role::Assistant);
    }

    #[test]
    fn test_failed_exchange_leaves_no_orphan_turn() {
        let (_dir, paths, store) = store();
        // A directory where the transcript file should be makes the write fail.
        std::fs::create_dir_all(paths.session_file("relay:c1")).unwrap();
        assert!(
            store
                .append_exchange("relay:c1", Message::user("ping"), Message::assistant("pong"))
                .is_err()
        );
        std::fs::remove_dir(paths.session_file("relay:c1")).unwrap();

        store
            .append_exchange("relay:c1", Message::user("again"), Message::assistant("ok"))
            .unwrap();
        let texts: Vec<String> = store
            .transcript("relay:c1")
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["again", "ok"]);
    }

    #[test]
    fn test_cache_is_bounded() {
        let (_dir, paths, _store) = store();
        let store = SessionStore::with_cache_capacity(paths, 2);
        for key in ["relay:a", "relay:b", "relay:c"] {
            exchange(&store, key, "q", "a");
            store.transcript(key).unwrap();
        }
        assert_eq!(store.cached_sessions(), 2);

        // Evicted sessions reload from disk.
        assert_eq!(store.transcript("relay:a").unwrap().len(), 2);
        assert_eq!(store.cached_sessions(), 2);
    }
}
