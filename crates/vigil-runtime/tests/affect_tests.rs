#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use vigil_config::schema::{AffectConfig, LifeStage};
    use vigil_core::{Severity, jsonl};
    use vigil_runtime::{AffectChannel, AffectSnapshot, AffectState};

    const EPS: f64 = 1e-9;

    fn default_state() -> AffectState {
        AffectState::from_config(&AffectConfig::default(), LifeStage::Developing)
    }

    fn in_unit(state: &AffectState) -> bool {
        AffectChannel::ALL
            .iter()
            .all(|c| (0.0..=1.0).contains(&state.get(*c)))
    }

    // ── Bounds ─────────────────────────────────────────────────

    #[test]
    fn test_channels_stay_in_unit_interval() {
        let mut state = default_state();
        for _ in 0..100 {
            state.apply_severity(Severity::High);
            state.nudge(AffectChannel::Relief, 0.4);
            assert!(in_unit(&state));
        }
        for _ in 0..100 {
            state.nudge(AffectChannel::Drive, -0.7);
            state.idle(Duration::from_secs(3600));
            assert!(in_unit(&state));
        }
        state.nudge(AffectChannel::Novelty, f64::NAN);
        state.decay(f64::INFINITY);
        assert!(in_unit(&state));
    }

    #[test]
    fn test_baseline_is_clamped() {
        let state = AffectState::new([1.5, -0.2, 0.5, 0.5]);
        assert_eq!(state.baseline(AffectChannel::Drive), 1.0);
        assert_eq!(state.baseline(AffectChannel::Novelty), 0.0);
    }

    // ── Decay ──────────────────────────────────────────────────

    #[test]
    fn test_decay_is_monotonic_and_never_overshoots() {
        let mut state = AffectState::new([0.5, 0.5, 0.5, 0.5]);
        state.nudge(AffectChannel::Drive, 0.5);
        state.nudge(AffectChannel::Stability, -0.5);
        let mut last_drive = state.get(AffectChannel::Drive);
        let mut last_stability = state.get(AffectChannel::Stability);
        for _ in 0..50 {
            state.decay(0.3);
            let drive = state.get(AffectChannel::Drive);
            let stability = state.get(AffectChannel::Stability);
            assert!(drive <= last_drive + EPS && drive >= 0.5 - EPS);
            assert!(stability >= last_stability - EPS && stability <= 0.5 + EPS);
            last_drive = drive;
            last_stability = stability;
        }
        assert!((last_drive - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decay_rate_is_clamped() {
        let mut state = AffectState::new([0.2, 0.2, 0.2, 0.2]);
        state.nudge(AffectChannel::Relief, 0.6);
        state.decay(5.0);
        assert!((state.get(AffectChannel::Relief) - 0.2).abs() < EPS);

        state.nudge(AffectChannel::Relief, 0.6);
        state.decay(-1.0);
        assert!((state.get(AffectChannel::Relief) - 0.8).abs() < EPS);
    }

    // ── Nudges ─────────────────────────────────────────────────

    #[test]
    fn test_severity_nudges() {
        let mut state = AffectState::new([0.5, 0.5, 0.5, 0.5]);
        state.apply_severity(Severity::High);
        assert!((state.get(AffectChannel::Drive) - 0.65).abs() < EPS);
        assert!((state.get(AffectChannel::Stability) - 0.40).abs() < EPS);

        let mut state = AffectState::new([0.5, 0.5, 0.5, 0.5]);
        state.apply_severity(Severity::Normal);
        assert!((state.get(AffectChannel::Drive) - 0.53).abs() < EPS);

        let mut state = AffectState::new([0.5, 0.5, 0.5, 0.5]);
        state.apply_severity(Severity::Low);
        assert!((state.get(AffectChannel::Relief) - 0.55).abs() < EPS);
    }

    #[test]
    fn test_idle_raises_novelty_and_lowers_drive() {
        let mut state = AffectState::new([0.5, 0.5, 0.5, 0.5]);
        state.idle(Duration::from_secs(5 * 60));
        assert!(state.get(AffectChannel::Novelty) > 0.5);
        assert!(state.get(AffectChannel::Drive) < 0.5);
    }

    // ── Context factor ─────────────────────────────────────────

    #[test]
    fn test_context_factor_neutral_at_default_baseline() {
        assert!((default_state().context_factor() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_context_factor_bounds() {
        let wide = AffectState::new([0.0, 1.0, 0.0, 0.5]);
        assert!((wide.context_factor() - 2.0).abs() < EPS);
        let narrow = AffectState::new([1.0, 0.0, 1.0, 0.5]);
        assert!((narrow.context_factor() - 0.5).abs() < EPS);
    }

    #[test]
    fn test_context_factor_is_deterministic() {
        let a = AffectState::new([0.7, 0.8, 0.3, 0.5]);
        let b = AffectState::new([0.7, 0.8, 0.3, 0.5]);
        assert_eq!(a.context_factor(), b.context_factor());
        assert_eq!(a.scale(12), b.scale(12));
        // 1 + 0.2 + 0.3 - 0.2
        assert!((a.context_factor() - 1.3).abs() < EPS);
        assert_eq!(a.scale(10), 13);
    }

    // ── Life stage ─────────────────────────────────────────────

    #[test]
    fn test_life_stage_scales_baseline() {
        let nascent = AffectState::from_config(&AffectConfig::default(), LifeStage::Nascent);
        assert!((nascent.baseline(AffectChannel::Novelty) - 0.625).abs() < EPS);
        let mature = AffectState::from_config(&AffectConfig::default(), LifeStage::Mature);
        assert!((mature.baseline(AffectChannel::Stability) - 0.69).abs() < EPS);
    }

    // ── Persistence ────────────────────────────────────────────

    #[test]
    fn test_persist_keeps_a_single_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("affect.jsonl");

        let mut state = default_state();
        state.persist(&path).unwrap();
        state.nudge(AffectChannel::Drive, 0.3);
        state.persist(&path).unwrap();
        state.nudge(AffectChannel::Relief, -0.2);
        state.persist(&path).unwrap();

        let lines: Vec<AffectSnapshot> = jsonl::read_all(&path).unwrap();
        assert_eq!(lines.len(), 1);

        let loaded = AffectState::load(&path, &AffectConfig::default(), LifeStage::Developing).unwrap();
        assert!((loaded.get(AffectChannel::Drive) - 0.8).abs() < EPS);
        assert!((loaded.get(AffectChannel::Relief) - 0.3).abs() < EPS);
    }

    #[test]
    fn test_load_takes_last_snapshot_and_compacts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("affect.jsonl");

        let mut state = default_state();
        jsonl::append(&path, &state.snapshot()).unwrap();
        state.nudge(AffectChannel::Novelty, 0.2);
        jsonl::append(&path, &state.snapshot()).unwrap();

        let loaded = AffectState::load(&path, &AffectConfig::default(), LifeStage::Developing).unwrap();
        assert!((loaded.get(AffectChannel::Novelty) - state.get(AffectChannel::Novelty)).abs() < EPS);

        let lines: Vec<AffectSnapshot> = jsonl::read_all(&path).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_rebase_moves_target_not_values() {
        let mut state = default_state();
        state.nudge(AffectChannel::Drive, 0.2);
        let before = state.get(AffectChannel::Drive);

        let mut config = AffectConfig::default();
        config.baseline.drive = 0.9;
        state.rebase(&config, LifeStage::Developing);
        assert!((state.get(AffectChannel::Drive) - before).abs() < EPS);

        state.decay(1.0);
        let expected = AffectState::from_config(&config, LifeStage::Developing).baseline(AffectChannel::Drive);
        assert!((state.get(AffectChannel::Drive) - expected).abs() < EPS);
    }

    #[test]
    fn test_load_missing_file_starts_at_baseline() {
        let dir = TempDir::new().unwrap();
        let loaded =
            AffectState::load(&dir.path().join("affect.jsonl"), &AffectConfig::default(), LifeStage::Developing)
                .unwrap();
        assert_eq!(loaded, default_state());
    }
}
