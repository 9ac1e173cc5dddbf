//! Pure scaling policy: may-create and should-remove decisions.

use std::time::Instant;

use quarry_core::config::{MachineConfig, RunnerConfig};

use crate::data::MachinesData;
use crate::details::{MachineDetails, MachineState};

/// Why an idle machine should be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    TooManyBuilds,
    TooManyMachines,
    TooManyIdleMachines,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemovalReason::TooManyBuilds => "Too many builds",
            RemovalReason::TooManyMachines => "Too many machines",
            RemovalReason::TooManyIdleMachines => "Too many idle machines",
        };
        write!(f, "{s}")
    }
}

/// Whether the pool may start provisioning another machine.
pub fn can_create(config: &RunnerConfig, machine: &MachineConfig, data: &MachinesData) -> bool {
    if machine.max_growth_rate > 0 && data.creating >= machine.max_growth_rate {
        return false;
    }
    if config.limit > 0 && data.total() >= config.limit {
        return false;
    }
    !idle_target_reached(machine, data)
}

/// The composed idle rule. The static `idle_count` target is reached when
/// enough machines are available; with `idle_count_min`/`idle_scale_factor`
/// configured, a lower dynamic target (floored at `idle_count_min`, scaled
/// from the in-use count) is reached first.
fn idle_target_reached(machine: &MachineConfig, data: &MachinesData) -> bool {
    let available = data.available();
    if available >= machine.idle_count() {
        return true;
    }

    let floor = machine.idle_count_min();
    if floor == 0 {
        return false;
    }

    let scaled = (data.in_use() as f64 * machine.idle_scale_factor).floor() as usize;
    available >= floor && available >= scaled
}

/// Whether an idle machine should be retired, and why.
///
/// `data` holds the counts accumulated so far during the current inventory
/// walk, so earlier machines in the walk fill the idle quota first.
pub fn should_remove(
    details: &MachineDetails,
    config: &RunnerConfig,
    machine: &MachineConfig,
    data: &MachinesData,
    now: Instant,
) -> Option<RemovalReason> {
    if details.state != MachineState::Idle {
        return None;
    }

    if machine.max_builds > 0 && details.used_count >= machine.max_builds {
        return Some(RemovalReason::TooManyBuilds);
    }

    if config.limit > 0 && data.total() >= config.limit {
        return Some(RemovalReason::TooManyMachines);
    }

    if now.duration_since(details.used) > machine.idle_time() && idle_target_reached(machine, data)
    {
        return Some(RemovalReason::TooManyIdleMachines);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn runner(limit: usize) -> RunnerConfig {
        RunnerConfig {
            name: "r".into(),
            url: "https://ci.example.com".into(),
            token: "tok_0123456789".into(),
            executor: "machine".into(),
            limit,
            output_limit_kib: 0,
            tls_ca_file: None,
            tls_cert_file: None,
            tls_key_file: None,
            connection_max_age_secs: 0,
            machine: None,
            host: None,
        }
    }

    fn machine_config() -> MachineConfig {
        MachineConfig {
            driver: "mock".into(),
            name_template: "pool-%s".into(),
            options: vec![],
            idle_count: 0,
            idle_count_min: 0,
            idle_scale_factor: 0.0,
            idle_time_secs: 0,
            max_builds: 0,
            max_growth_rate: 0,
            provision_retry_secs: 0,
            remove_retry_tries: 3,
            remove_retry_secs: 0,
            stop_timeout_secs: 0,
            shutdown_drain: None,
        }
    }

    fn data(idle: usize, creating: usize, used: usize) -> MachinesData {
        MachinesData {
            idle,
            creating,
            used,
            ..Default::default()
        }
    }

    #[rstest]
    // Static idle target: create until available reaches idle_count.
    #[case(2, 0, data(0, 0, 0), true)]
    #[case(2, 0, data(1, 0, 0), true)]
    #[case(2, 0, data(2, 0, 0), false)]
    #[case(2, 0, data(1, 1, 0), false)]
    // Growth gate: creating at the cap blocks further creation.
    #[case(5, 2, data(0, 2, 0), false)]
    #[case(5, 2, data(0, 1, 0), true)]
    fn test_can_create(
        #[case] idle_count: usize,
        #[case] max_growth_rate: usize,
        #[case] counts: MachinesData,
        #[case] expected: bool,
    ) {
        let mut machine = machine_config();
        machine.idle_count = idle_count;
        machine.max_growth_rate = max_growth_rate;
        assert_eq!(can_create(&runner(0), &machine, &counts), expected);
    }

    #[test]
    fn test_can_create_respects_limit() {
        let mut machine = machine_config();
        machine.idle_count = 10;
        let config = runner(3);

        assert!(can_create(&config, &machine, &data(1, 1, 0)));
        assert!(!can_create(&config, &machine, &data(1, 1, 1)));
    }

    #[test]
    fn test_limit_zero_disables_cap() {
        let mut machine = machine_config();
        machine.idle_count = 100;
        assert!(can_create(&runner(0), &machine, &data(50, 0, 40)));
    }

    #[test]
    fn test_growth_rate_zero_disables_gate() {
        let mut machine = machine_config();
        machine.idle_count = 100;
        assert!(can_create(&runner(0), &machine, &data(0, 50, 0)));
    }

    #[test]
    fn test_scale_factor_dynamic_target() {
        let mut machine = machine_config();
        machine.idle_count = 10;
        machine.idle_scale_factor = 1.0;
        machine.idle_count_min = 2;

        // 4 in use -> dynamic target 4.
        assert!(can_create(&runner(0), &machine, &data(3, 0, 4)));
        assert!(!can_create(&runner(0), &machine, &data(4, 0, 4)));

        // Nothing in use -> the floor applies.
        assert!(can_create(&runner(0), &machine, &data(1, 0, 0)));
        assert!(!can_create(&runner(0), &machine, &data(2, 0, 0)));
    }

    #[test]
    fn test_scale_factor_without_min_is_coerced_to_one() {
        let mut machine = machine_config();
        machine.idle_count = 10;
        machine.idle_scale_factor = 0.5;

        assert!(can_create(&runner(0), &machine, &data(0, 0, 0)));
        assert!(!can_create(&runner(0), &machine, &data(1, 0, 0)));
    }

    #[test]
    fn test_should_remove_only_touches_idle_machines() {
        let mut machine = machine_config();
        machine.max_builds = 1;
        let mut details = MachineDetails::discovered("m1");
        details.state = MachineState::Used;

        let decision = should_remove(
            &details,
            &runner(0),
            &machine,
            &MachinesData::default(),
            Instant::now(),
        );
        assert_eq!(decision, None);
    }

    #[test]
    fn test_should_remove_max_builds() {
        let mut machine = machine_config();
        machine.max_builds = 2;
        let mut details = MachineDetails::discovered("m1");
        details.used_count = 2;

        let decision = should_remove(
            &details,
            &runner(0),
            &machine,
            &MachinesData::default(),
            Instant::now(),
        );
        assert_eq!(decision, Some(RemovalReason::TooManyBuilds));
        assert_eq!(decision.unwrap().to_string(), "Too many builds");
    }

    #[test]
    fn test_max_builds_zero_means_reusable_forever() {
        let machine = machine_config();
        let mut details = MachineDetails::discovered("m1");
        details.used_count = 10_000;

        let decision = should_remove(
            &details,
            &runner(0),
            &machine,
            &MachinesData::default(),
            Instant::now(),
        );
        assert_eq!(decision, None);
    }

    #[test]
    fn test_should_remove_over_limit() {
        let machine = machine_config();
        let details = MachineDetails::discovered("m1");

        let decision = should_remove(
            &details,
            &runner(2),
            &machine,
            &data(2, 0, 0),
            Instant::now(),
        );
        assert_eq!(decision, Some(RemovalReason::TooManyMachines));
    }

    #[test]
    fn test_should_remove_excess_idle_after_idle_time() {
        let mut machine = machine_config();
        machine.idle_count = 2;
        // idle_time defaults to zero, so any elapsed time qualifies.
        let details = MachineDetails::discovered("m1");
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Idle quota not yet filled by the walk: keep.
        let decision = should_remove(
            &details,
            &runner(0),
            &machine,
            &data(1, 0, 0),
            Instant::now(),
        );
        assert_eq!(decision, None);

        // Quota filled: retire.
        let decision = should_remove(
            &details,
            &runner(0),
            &machine,
            &data(2, 0, 0),
            Instant::now(),
        );
        assert_eq!(decision, Some(RemovalReason::TooManyIdleMachines));
    }

    #[test]
    fn test_idle_time_keeps_recently_used_machines() {
        let mut machine = machine_config();
        machine.idle_count = 0;
        machine.idle_time_secs = 3600;
        let details = MachineDetails::discovered("m1");

        let decision = should_remove(
            &details,
            &runner(0),
            &machine,
            &data(5, 0, 0),
            Instant::now(),
        );
        assert_eq!(decision, None);
    }
}
