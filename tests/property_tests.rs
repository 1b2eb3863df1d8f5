//! Property-based tests for archzfs
//!
//! These tests verify:
//! - Topology device minimums in plan validation
//! - Forward-only step transitions
//! - Bounded bootstrap backoff
//! - Dataset ordering checks
//! - Enum string round-trips

use std::path::PathBuf;
use std::time::Duration;

use proptest::prelude::*;

use archzfs::plan::{InstallPlan, PlanConfig, RetryPolicy, Secret, default_datasets};
use archzfs::pool::check_dataset_order;
use archzfs::types::{Bootloader, Compression, Kernel, NetworkBackend, Topology};
use archzfs::workflow::{Step, StepLog, TransitionError, WorkflowContext};
use archzfs::ValidationError;

fn topology_strategy() -> impl Strategy<Value = Topology> {
    prop_oneof![
        Just(Topology::Single),
        Just(Topology::Mirror),
        Just(Topology::Raidz1),
        Just(Topology::Raidz2),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop::sample::select(vec![
        Step::Discover,
        Step::ValidatePlan,
        Step::Partition,
        Step::CreatePool,
        Step::CreateDatasets,
        Step::Mount,
        Step::Bootstrap,
        Step::ConfigureSystem,
        Step::InstallBootloader,
        Step::Verify,
        Step::Done,
        Step::Failed,
    ])
}

fn plan_with(topology: Topology, count: usize) -> PlanConfig {
    let devices = (0..count)
        .map(|i| PathBuf::from(format!("/dev/vd{}", (b'a' + i as u8) as char)))
        .collect();
    let mut config = PlanConfig::new(devices);
    config.pool.topology = topology;
    config.system.root_password = Secret::new("rootpw");
    config
}

// =============================================================================
// Plan validation
// =============================================================================

proptest! {
    /// A plan is accepted exactly when it has enough devices for its topology
    #[test]
    fn topology_minimum_enforced(topology in topology_strategy(), count in 0usize..6) {
        let result = InstallPlan::from_config(plan_with(topology, count));
        if count == 0 {
            prop_assert_eq!(result.unwrap_err(), ValidationError::NoDevices);
        } else if count < topology.min_devices() {
            let is_too_few = matches!(result, Err(ValidationError::TooFewDevices { .. }));
            prop_assert!(is_too_few);
        } else {
            let plan = result.expect("valid plan");
            prop_assert_eq!(plan.devices().len(), count);
        }
    }

    /// Plans survive a JSON round-trip through the plan file format
    #[test]
    fn plan_file_roundtrip(topology in topology_strategy(), swap in 0u32..16, dedup in any::<bool>()) {
        let mut config = plan_with(topology, 3);
        config.pool.swap_gib = Some(swap);
        config.pool.dedup = dedup;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("plan.json");
        config.save_to_file(&path).expect("save");
        let loaded = PlanConfig::load_from_file(&path).expect("load");
        prop_assert_eq!(loaded, config);
    }
}

// =============================================================================
// Step transitions
// =============================================================================

proptest! {
    /// No sequence of requests moves the workflow backwards or skips a step
    #[test]
    fn steps_only_move_forward(targets in prop::collection::vec(step_strategy(), 0..40)) {
        let mut ctx = WorkflowContext::new();
        for target in targets {
            let before = ctx.current_step();
            match ctx.transition_to(target) {
                Ok(now) => {
                    prop_assert_eq!(before.next(), Some(now));
                    prop_assert!(now.order() > before.order());
                }
                Err(_) => prop_assert_eq!(ctx.current_step(), before),
            }
        }
    }

    /// Failed is terminal from any step
    #[test]
    fn fail_is_terminal(advances in 0usize..10, target in step_strategy()) {
        let mut ctx = WorkflowContext::new();
        for _ in 0..advances {
            ctx.advance().expect("advance");
        }
        ctx.fail().expect("fail");
        prop_assert_eq!(ctx.current_step(), Step::Failed);
        prop_assert!(
            matches!(ctx.transition_to(target), Err(TransitionError::FromTerminalState { .. })),
            "transition out of Failed"
        );
    }

    /// A fresh log never lets a destructive step past the upstream check
    #[test]
    fn destructive_steps_need_upstream(step in step_strategy()) {
        let log = StepLog::new();
        if step.is_destructive() {
            prop_assert!(log.check_upstream(step).is_err());
        }
    }
}

// =============================================================================
// Bootstrap backoff
// =============================================================================

proptest! {
    /// Backoff never shrinks between attempts and stays bounded
    #[test]
    fn backoff_is_monotonic_and_capped(initial in 0u64..600, attempt in 1u32..64) {
        let policy = RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_secs(initial),
        };
        let now = policy.backoff_after(attempt);
        let next = policy.backoff_after(attempt + 1);
        prop_assert!(next >= now);
        prop_assert!(now <= Duration::from_secs(120));
        if initial == 0 {
            prop_assert_eq!(now, Duration::ZERO);
        }
    }
}

// =============================================================================
// Dataset ordering
// =============================================================================

proptest! {
    /// Ordering check accepts a permutation exactly when parents come first
    #[test]
    fn dataset_order_check(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
        let base = default_datasets();
        let shuffled: Vec<_> = order.iter().map(|&i| base[i].clone()).collect();

        let parents_first = shuffled.iter().enumerate().all(|(i, ds)| match ds.parent() {
            Some(parent) => shuffled[..i].iter().any(|p| p.name == parent),
            None => true,
        });
        prop_assert_eq!(check_dataset_order(&shuffled).is_ok(), parents_first);
    }
}

// =============================================================================
// Enum string round-trips
// =============================================================================

proptest! {
    #[test]
    fn topology_roundtrip(topology in topology_strategy()) {
        let parsed: Topology = topology.to_string().parse().expect("parse");
        prop_assert_eq!(parsed, topology);
    }

    #[test]
    fn bootloader_roundtrip(bootloader in prop_oneof![Just(Bootloader::Grub), Just(Bootloader::SystemdBoot)]) {
        let s = bootloader.to_string();
        prop_assert_eq!(&s, &s.to_lowercase());
        let parsed: Bootloader = s.parse().expect("parse");
        prop_assert_eq!(parsed, bootloader);
    }

    #[test]
    fn kernel_package_matches_name(kernel in prop_oneof![Just(Kernel::Linux), Just(Kernel::LinuxLts), Just(Kernel::LinuxZen)]) {
        prop_assert_eq!(kernel.package(), kernel.to_string());
    }

    #[test]
    fn compression_and_network_roundtrip(
        compression in prop_oneof![Just(Compression::Lz4), Just(Compression::Zstd), Just(Compression::Off)],
        network in prop_oneof![Just(NetworkBackend::NetworkManager), Just(NetworkBackend::SystemdNetworkd), Just(NetworkBackend::None)],
    ) {
        let c: Compression = compression.to_string().parse().expect("parse");
        prop_assert_eq!(c, compression);
        let n: NetworkBackend = network.to_string().parse().expect("parse");
        prop_assert_eq!(n, network);
    }
}
