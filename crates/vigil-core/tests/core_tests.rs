#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tempfile::TempDir;
    use vigil_core::*;

    fn audited_bus(dir: &TempDir) -> EventBus {
        EventBus::new(AuditLog::new(dir.path().join("audit")))
    }

    fn audit_lines(bus: &EventBus) -> usize {
        bus.audit_log().unwrap().tail(usize::MAX).unwrap().len()
    }

    // ── Message tests ──────────────────────────────────────────

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text, "hello");
        assert_eq!(Message::assistant("hi").role, Role::Assistant);
    }

    #[test]
    fn test_message_jsonl_schema_is_stable() {
        let msg = Message::user("héllo");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["text"], "héllo");
        assert!(json["created_at"].is_string());
        assert_eq!(msg.char_len(), 5);
    }

    // ── Event tests ────────────────────────────────────────────

    #[test]
    fn test_inbound_event_payload() {
        let ev = Event::inbound_message("relay", "c1", "m1", "alice", "hi there");
        assert_eq!(ev.kind, EventKind::InboundMessage);
        assert_eq!(ev.severity, Severity::Normal);
        assert_eq!(ev.text(), Some("hi there"));
        assert_eq!(ev.reply_target(), Some(ReplyTarget::new("relay", "c1")));
    }

    #[test]
    fn test_timer_event_carries_action_and_target() {
        let job = uuid::Uuid::new_v4();
        let ev = Event::timer(job, "run doctor", Some(&ReplyTarget::local()));
        assert_eq!(ev.kind, EventKind::Timer);
        assert_eq!(ev.text(), Some("run doctor"));
        assert_eq!(ev.payload_str("job_id"), Some(job.to_string().as_str()));
        assert!(ev.reply_target().unwrap().is_local());
    }

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let ev = Event::system("test", "transport.degraded", "3 failures", Severity::High);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "system");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["payload"]["code"], "transport.degraded");
    }

    // ── EventBus tests ─────────────────────────────────────────

    #[test]
    fn test_publish_delivers_to_matching_subscribers_only() {
        let bus = EventBus::in_memory();
        let timers = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let t = timers.clone();
        bus.subscribe(
            |e| e.kind == EventKind::Timer,
            move |_| {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        let a = all.clone();
        bus.subscribe(
            |_| true,
            move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        bus.publish(Event::inbound_message("relay", "c", "m", "s", "x"));
        bus.publish(Event::timer(uuid::Uuid::new_v4(), "tick", None));

        assert_eq!(timers.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delivery_is_in_publish_order() {
        let bus = EventBus::in_memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(
            |_| true,
            move |e| {
                s.lock().push(e.text().unwrap_or_default().to_string());
                Ok(())
            },
        );
        for i in 0..5 {
            bus.publish(Event::inbound_message("relay", "c", &i.to_string(), "s", &i.to_string()));
        }
        assert_eq!(*seen.lock(), vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_failing_handler_does_not_block_later_subscribers() {
        let bus = EventBus::in_memory();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| true, |_| Err(VigilError::Session("boom".into())));
        bus.subscribe(|_| true, |_| panic!("handler exploded"));
        let r = reached.clone();
        bus.subscribe(
            |_| true,
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        bus.publish(Event::system("test", "x", "y", Severity::Low));
        bus.publish(Event::system("test", "x", "y", Severity::Low));
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exactly_one_audit_entry_per_publish() {
        let dir = TempDir::new().unwrap();
        let bus = audited_bus(&dir);
        bus.subscribe(|_| true, |_| panic!("always fails"));
        bus.subscribe(|_| true, |_| Err(VigilError::Session("nope".into())));

        for _ in 0..7 {
            bus.publish(Event::system("test", "x", "y", Severity::Normal));
        }
        assert_eq!(audit_lines(&bus), 7);
    }

    #[test]
    fn test_audit_entry_written_without_subscribers() {
        let dir = TempDir::new().unwrap();
        let bus = audited_bus(&dir);
        let ev = Event::inbound_message("relay", "c", "m", "s", "hello");
        let id = ev.id;
        bus.publish(ev);
        let entries = bus.audit_log().unwrap().tail(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::in_memory();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.subscribe(
            |_| true,
            move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        bus.publish(Event::system("t", "a", "b", Severity::Low));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(Event::system("t", "a", "b", Severity::Low));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let dir = TempDir::new().unwrap();
        let bus = audited_bus(&dir);
        let inner = bus.clone();
        bus.subscribe(
            |e| e.kind == EventKind::InboundMessage,
            move |_| {
                inner.publish(Event::system("test", "echo", "nested", Severity::Low));
                Ok(())
            },
        );
        bus.publish(Event::inbound_message("relay", "c", "m", "s", "x"));
        assert_eq!(audit_lines(&bus), 2);
    }

    #[test]
    fn test_audit_tail_limits_and_orders() {
        let dir = TempDir::new().unwrap();
        let bus = audited_bus(&dir);
        for i in 0..10 {
            bus.publish(Event::system("t", "n", i.to_string(), Severity::Low));
        }
        let tail = bus.audit_log().unwrap().tail(3).unwrap();
        let details: Vec<_> = tail.iter().map(|e| e.text().unwrap().to_string()).collect();
        assert_eq!(details, vec!["7", "8", "9"]);
    }

    // ── Identity tests ─────────────────────────────────────────

    #[test]
    fn test_operator_authorizes_local_and_self() {
        let op = OperatorIdentity::new("alice");
        assert!(op.authorizes("relay", "alice"));
        assert!(op.authorizes(LOCAL_CHANNEL, "anyone"));
        assert!(!op.authorizes("relay", "mallory"));
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_lock_held_error_mentions_pid() {
        let err = VigilError::LockHeld {
            path: "/tmp/state".into(),
            pid: Some(42),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/state"));
        assert!(msg.contains("pid 42"));
    }

    #[test]
    fn test_session_key_format() {
        assert_eq!(session_key("relay", "abc"), "relay:abc");
        assert_eq!(ReplyTarget::local().session_key(), "local:console");
    }
}
