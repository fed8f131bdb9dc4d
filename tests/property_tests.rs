//! Property-based tests for archprov
//!
//! These tests verify:
//! - Enum string round-trips (parse -> to_string -> parse)
//! - Planner invariants over arbitrary disk sizes and sector sizes
//! - Planner determinism

use proptest::prelude::*;

use archprov::engine::layout::{
    ALIGNMENT, BOOT_OFFSET, BOOT_SIZE, GIB, GPT_TAIL_RESERVE, MIB, plan,
};
use archprov::error::ProvisionError;
use archprov::inventory::BlockDevice;
use archprov::types::{FilesystemKind, LayoutPolicy, PartitionRole};

// =============================================================================
// Strategies
// =============================================================================

fn filesystem_strategy() -> impl Strategy<Value = FilesystemKind> {
    prop_oneof![
        Just(FilesystemKind::Btrfs),
        Just(FilesystemKind::Ext4),
        Just(FilesystemKind::Xfs),
        Just(FilesystemKind::Fat32),
    ]
}

fn policy_strategy() -> impl Strategy<Value = LayoutPolicy> {
    prop_oneof![
        Just(LayoutPolicy::Single),
        Just(LayoutPolicy::RootHome),
        Just(LayoutPolicy::RootSubvolumes),
    ]
}

/// Policy together with a filesystem it can be combined with.
fn valid_combination_strategy() -> impl Strategy<Value = (FilesystemKind, LayoutPolicy)> {
    prop_oneof![
        Just((FilesystemKind::Ext4, LayoutPolicy::Single)),
        Just((FilesystemKind::Xfs, LayoutPolicy::Single)),
        Just((FilesystemKind::Btrfs, LayoutPolicy::Single)),
        Just((FilesystemKind::Ext4, LayoutPolicy::RootHome)),
        Just((FilesystemKind::Xfs, LayoutPolicy::RootHome)),
        Just((FilesystemKind::Btrfs, LayoutPolicy::RootHome)),
        Just((FilesystemKind::Btrfs, LayoutPolicy::RootSubvolumes)),
    ]
}

fn sector_size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(512u64), Just(4096u64)]
}

/// From well below the minimum layout up to 4 TiB, not necessarily aligned.
fn capacity_strategy() -> impl Strategy<Value = u64> {
    (64 * MIB)..(4096 * GIB)
}

// =============================================================================
// Enum round-trips
// =============================================================================

proptest! {
    #[test]
    fn filesystem_roundtrip(fs in filesystem_strategy()) {
        let s = fs.to_string();
        let parsed: FilesystemKind = s.parse().expect("Should parse");
        prop_assert_eq!(fs, parsed);
    }

    #[test]
    fn policy_roundtrip(policy in policy_strategy()) {
        let s = policy.to_string();
        let parsed: LayoutPolicy = s.parse().expect("Should parse");
        prop_assert_eq!(policy, parsed);

        // Config files and CLI flags use the same spelling
        let json = serde_json::to_string(&policy).expect("serialize");
        prop_assert_eq!(json, format!("\"{}\"", s));
    }

    #[test]
    fn filesystem_display_is_lowercase(fs in filesystem_strategy()) {
        let s = fs.to_string();
        prop_assert!(!s.is_empty());
        prop_assert_eq!(s.clone(), s.to_lowercase());
    }
}

// =============================================================================
// Planner invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Every successful plan is aligned, ordered, non-overlapping and fits.
    #[test]
    fn plan_is_well_formed(
        capacity in capacity_strategy(),
        sector_size in sector_size_strategy(),
        (fs, policy) in valid_combination_strategy(),
    ) {
        let device = BlockDevice::new("/dev/sda", sector_size, capacity);
        match plan(&device, fs, policy) {
            Ok(layout) => {
                let parts = layout.partitions();
                prop_assert!(parts.len() >= 2);

                for (i, p) in parts.iter().enumerate() {
                    prop_assert_eq!(p.number as usize, i + 1);
                    prop_assert!(p.length > 0);
                    prop_assert_eq!(p.offset % ALIGNMENT, 0);
                    prop_assert_eq!(p.length % ALIGNMENT, 0);
                    prop_assert_eq!(p.offset % sector_size, 0);
                }
                for pair in parts.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].offset);
                }

                let last = parts.last().expect("non-empty");
                prop_assert!(last.end() + GPT_TAIL_RESERVE <= capacity);

                let boot = layout.boot().expect("boot partition");
                prop_assert_eq!(boot.offset, BOOT_OFFSET);
                prop_assert_eq!(boot.length, BOOT_SIZE);
                prop_assert_eq!(boot.filesystem, FilesystemKind::Fat32);
                prop_assert!(boot.flags.bootable);

                prop_assert_eq!(layout.home().is_some(), policy == LayoutPolicy::RootHome);
                prop_assert_eq!(layout.subvolumes().is_empty(), !policy.uses_subvolumes());
                prop_assert!(layout.validate().is_ok());
            }
            Err(ProvisionError::InsufficientCapacity { required, available }) => {
                prop_assert_eq!(available, capacity);
                prop_assert!(required > available, "required {} <= available {}", required, available);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    /// Planning is a pure function of its inputs.
    #[test]
    fn plan_is_deterministic(
        capacity in (4 * GIB)..(4096 * GIB),
        (fs, policy) in valid_combination_strategy(),
    ) {
        let device = BlockDevice::new("/dev/nvme0n1", 512, capacity);
        let first = plan(&device, fs, policy).expect("fits");
        let second = plan(&device, fs, policy).expect("fits");
        prop_assert_eq!(first.partitions(), second.partitions());
        prop_assert_eq!(first.subvolumes(), second.subvolumes());
    }

    /// Root+home uses everything after the boot partition up to the usable end.
    #[test]
    fn root_home_leaves_no_gap(capacity in (4 * GIB)..(4096 * GIB)) {
        let device = BlockDevice::new("/dev/sda", 512, capacity);
        let layout = plan(&device, FilesystemKind::Ext4, LayoutPolicy::RootHome).expect("fits");
        let boot = layout.boot().expect("boot");
        let root = layout.root().expect("root");
        let home = layout.home().expect("home");
        prop_assert_eq!(root.offset, boot.end());
        prop_assert_eq!(home.offset, root.end());
        prop_assert!(capacity - home.end() < GPT_TAIL_RESERVE + ALIGNMENT);
        prop_assert_eq!(root.role, PartitionRole::Root);
        prop_assert_eq!(home.role, PartitionRole::Home);
    }

    /// FAT32 never holds a root filesystem, whatever the disk.
    #[test]
    fn fat32_root_is_rejected(
        capacity in capacity_strategy(),
        policy in policy_strategy(),
    ) {
        let device = BlockDevice::new("/dev/sda", 512, capacity);
        let is_invalid_policy = matches!(
            plan(&device, FilesystemKind::Fat32, policy),
            Err(ProvisionError::InvalidPolicy { .. })
        );
        prop_assert!(is_invalid_policy);
    }
}
