mod common;

use blockvault_core::backup_set::{BackupSet, MANIFEST_FILE, TABLE_DUMP_FILE};
use blockvault_core::capability::Capability;
use blockvault_core::device::{BackupMode, PartitionDescriptor};
use blockvault_core::error::{Error, VerifyFailure};
use blockvault_core::platform::Host;
use blockvault_core::verify::Verifier;
use common::{DISK_SIZE, Fixture, PART_SIZE, patterned};
use std::fs;

fn assert_partitions_copied(fx: &Fixture) {
    for (number, _) in &fx.layout {
        assert_eq!(
            fs::read(fx.target_partition(*number)).unwrap(),
            fs::read(fx.source_partition(*number)).unwrap(),
            "partition {number} differs after restore"
        );
    }
}

#[test]
fn test_restore_without_specialized_tools() {
    let fx = Fixture::new(&[(1, "ntfs"), (2, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();

    let summary = fx.restore("ERASE").unwrap();
    assert_eq!(summary.restored.len(), 2);
    assert!(summary.restored.iter().all(|r| r.method == Capability::Generic));
    assert_partitions_copied(&fx);

    // The raw head of the source disk is now on the target.
    let target = fs::read(&fx.target).unwrap();
    let source = patterned(DISK_SIZE, 1);
    assert_eq!(&target[..4096], &source[..4096]);
    assert_eq!(&target[DISK_SIZE - 4096..], &source[DISK_SIZE - 4096..]);
    assert!(fx.host.rereads().contains(&fx.target));

    let set = BackupSet::open(&fx.set_dir()).unwrap();
    Verifier::new(&fx.host)
        .verify(&set, Some(fx.target.as_path()))
        .unwrap();
}

#[test]
fn test_restore_with_specialized_tools() {
    let fx = Fixture::new(&[(1, "ntfs"), (2, "ext4")]);
    fx.install_partclone();
    fx.host.install_tool("sfdisk");
    fx.backup(BackupMode::Partitioned).unwrap();

    let summary = fx.restore("ERASE").unwrap();
    assert_eq!(
        summary.restored[1].method,
        Capability::Specialized("partclone.extfs")
    );
    assert_partitions_copied(&fx);

    let dump = fx.set_dir().join(TABLE_DUMP_FILE);
    let replay = format!("sfdisk {} < {}", fx.target.display(), dump.display());
    assert!(fx.host.commands().contains(&replay));
}

#[test]
fn test_compare_detects_changed_filesystem() {
    let fx = Fixture::new(&[(1, "ntfs"), (2, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    fx.restore("ERASE").unwrap();

    let mut live: Vec<PartitionDescriptor> = fx.host.list_partitions(&fx.target).unwrap();
    live[1].fs_type = "xfs".to_string();
    fx.host.set_partitions(&fx.target, live);

    let set = BackupSet::open(&fx.set_dir()).unwrap();
    match Verifier::new(&fx.host)
        .verify(&set, Some(fx.target.as_path()))
        .unwrap_err()
    {
        Error::Verification(VerifyFailure::FsTypeMismatch {
            partition,
            expected,
            found,
        }) => {
            assert_eq!(partition, 2);
            assert_eq!(expected, "ext4");
            assert_eq!(found, "xfs");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_partclone_image_without_tool_is_fatal() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.install_partclone();
    fx.backup(BackupMode::Partitioned).unwrap();

    fx.host.remove_tool("partclone.extfs");
    match fx.restore("ERASE").unwrap_err() {
        Error::Restore { partition, reason } => {
            assert_eq!(partition, fx.target_partition(1).display().to_string());
            assert!(reason.contains("partclone.extfs"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_declined_confirmation_leaves_target_untouched() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();

    assert!(matches!(
        fx.restore("erase"),
        Err(Error::ConfirmationDeclined)
    ));
    assert!(fs::read(&fx.target).unwrap().iter().all(|b| *b == 0));
    assert!(
        fs::read(fx.target_partition(1))
            .unwrap()
            .iter()
            .all(|b| *b == 0)
    );
    assert!(fx.host.rereads().is_empty());
}

#[test]
fn test_assume_yes_skips_prompt() {
    let mut fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    fx.config.assume_yes = true;

    fx.restore("").unwrap();
    assert_partitions_copied(&fx);
}

#[test]
fn test_unmounts_target_partitions() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    fx.host
        .mount(&fx.target_partition(1), std::path::Path::new("/mnt/old"));

    fx.restore("ERASE").unwrap();
    assert!(!fx.host.is_mounted(&fx.target_partition(1)));
}

#[test]
fn test_unmounts_filesystem_on_disk_node() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    fx.host.mount(&fx.target, std::path::Path::new("/mnt/superfloppy"));

    fx.restore("ERASE").unwrap();
    assert!(!fx.host.is_mounted(&fx.target));
}

#[test]
fn test_tampered_set_is_not_restored() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    fs::write(fx.set_dir().join("part-1-ext4.img.gz"), b"tampered").unwrap();

    assert!(matches!(
        fx.restore("ERASE"),
        Err(Error::Verification(VerifyFailure::ChecksumMismatch(_)))
    ));
    assert!(fs::read(&fx.target).unwrap().iter().all(|b| *b == 0));
}

#[test]
fn test_small_target_refused() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    fs::write(&fx.target, vec![0u8; DISK_SIZE / 2]).unwrap();

    assert!(matches!(
        fx.restore("ERASE"),
        Err(Error::TargetTooSmall { .. })
    ));
}

#[test]
fn test_whole_disk_round_trip() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::WholeDisk).unwrap();

    let summary = fx.restore("ERASE").unwrap();
    assert_eq!(summary.mode, BackupMode::WholeDisk);
    assert_eq!(fs::read(&fx.target).unwrap(), patterned(DISK_SIZE, 1));
    // Partition nodes are not written individually in whole-disk mode.
    assert_eq!(fs::read(fx.target_partition(1)).unwrap(), vec![0u8; PART_SIZE]);
}

/// A set written before the format column existed: a partclone method with a
/// gzip image name.
fn rewrite_as_legacy_manifest(fx: &Fixture) {
    fs::write(
        fx.set_dir().join(MANIFEST_FILE),
        "# partition\tfstype\tmethod\timage\n1\text4\tpartclone.extfs\tpart-1-ext4.img.gz\n",
    )
    .unwrap();
}

#[test]
fn test_legacy_gzip_row_without_tool_restores_generically() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    rewrite_as_legacy_manifest(&fx);

    let summary = fx.restore("ERASE").unwrap();
    assert_eq!(summary.restored[0].method, Capability::Generic);
    assert_partitions_copied(&fx);
}

#[test]
fn test_legacy_gzip_row_with_failing_tool_restores_generically() {
    let fx = Fixture::new(&[(1, "ext4")]);
    fx.backup(BackupMode::Partitioned).unwrap();
    rewrite_as_legacy_manifest(&fx);
    fx.host.install_tool("partclone.extfs");
    fx.host.fail_tool("partclone.extfs");

    let summary = fx.restore("ERASE").unwrap();
    assert_eq!(summary.restored[0].method, Capability::Generic);
    assert!(
        fx.host
            .commands()
            .iter()
            .any(|c| c.starts_with("partclone.extfs -r"))
    );
    assert_partitions_copied(&fx);
}

#[test]
fn test_failed_table_replay_falls_back_to_raw_edges() {
    let fx = Fixture::new(&[(1, "ntfs"), (2, "ext4")]);
    fx.host.install_tool("sfdisk");
    fx.backup(BackupMode::Partitioned).unwrap();
    fx.host.fail_tool("sfdisk");

    fx.restore("ERASE").unwrap();

    let dump = fx.set_dir().join(TABLE_DUMP_FILE);
    let replay = format!("sfdisk {} < {}", fx.target.display(), dump.display());
    assert!(fx.host.commands().contains(&replay));

    let target = fs::read(&fx.target).unwrap();
    let source = patterned(DISK_SIZE, 1);
    assert_eq!(&target[..4096], &source[..4096]);
    assert_eq!(&target[DISK_SIZE - 4096..], &source[DISK_SIZE - 4096..]);
    assert_partitions_copied(&fx);
}
