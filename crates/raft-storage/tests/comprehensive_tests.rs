//! # comprehensive storage tests
//!
//! why: verify the file backed log store and state manager
//! relations: tests raft-storage crate
//! what: append/read, reopen, overwrite, packs, compaction and its rollback,
//!       state and configuration persistence

use std::fs;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use raft_core::log::{pack_entries, unpack_entries};
use raft_core::{
    ClusterConfig, LogEntry, LogStore, LogStoreError, LogValType, SrvConfig, SrvState, StateManager,
};
use raft_storage::{FileStateManager, FsLogStore};
use rand::Rng;
use tempfile::tempdir;

fn random_entry(rng: &mut impl Rng) -> LogEntry {
    let len = rng.gen_range(8..108);
    let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    let value_type = LogValType::try_from(rng.gen_range(1u8..=5)).unwrap();
    LogEntry::new(rng.gen_range(1..10_000), payload, value_type)
}

fn filled(store: &FsLogStore, count: usize) -> Vec<LogEntry> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let entry = random_entry(&mut rng);
            store.append(&entry).unwrap();
            entry
        })
        .collect()
}

fn app(term: u64, data: &str) -> LogEntry {
    LogEntry::app(term, data.as_bytes().to_vec())
}

// =============================================================================
// SECTION 1: APPEND AND READ
// =============================================================================

mod append_and_read {
    use super::*;

    #[test]
    fn empty_store() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.next_slot(), 1);
        assert_eq!(store.start_index(), 1);
        assert_eq!(store.last_entry().term(), 0);
        assert_eq!(store.entry_at(1).unwrap(), None);
        assert_eq!(store.term_at(1), 0);
        assert!(store.entries(1, 10).unwrap().is_empty());
    }

    #[test]
    fn entries_read_back_from_cache_and_files() {
        let dir = tempdir().unwrap();
        // small cache so most reads go to the files
        let store = FsLogStore::open(dir.path(), 10).unwrap();
        let logs = filled(&store, 150);

        assert_eq!(store.next_slot(), 151);
        assert_eq!(store.last_entry(), logs[149]);
        for (i, entry) in logs.iter().enumerate() {
            let idx = i as u64 + 1;
            assert_eq!(store.entry_at(idx).unwrap().as_ref(), Some(entry));
            assert_eq!(store.term_at(idx), entry.term());
        }
        assert_eq!(store.entries(40, 145).unwrap(), logs[39..144].to_vec());
    }

    #[test]
    fn range_is_clipped_to_next_slot() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        let logs = filled(&store, 5);
        assert_eq!(store.entries(3, 100).unwrap(), logs[2..].to_vec());
        assert!(store.entries(4, 4).unwrap().is_empty());
        assert!(store.entries(9, 12).unwrap().is_empty());
    }

    #[test]
    fn last_entry_without_a_cache() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 0).unwrap();
        let logs = filled(&store, 4);
        assert_eq!(store.last_entry(), logs[3]);

        store.write_at(3, &app(5, "w")).unwrap();
        assert_eq!(store.last_entry(), app(5, "w"));
        assert_eq!(store.entries(1, 4).unwrap()[..2], logs[..2]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        let logs = filled(&store, 120);
        store.close().unwrap();
        drop(store);

        let store = FsLogStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.next_slot(), 121);
        assert_eq!(store.last_entry(), logs[119]);
        assert_eq!(store.entries(1, 121).unwrap(), logs);
    }

    #[test]
    fn closed_store_refuses_io() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        store.close().unwrap();
        assert!(matches!(store.append(&app(1, "x")), Err(LogStoreError::Io(_))));
    }
}

// =============================================================================
// SECTION 2: OVERWRITE
// =============================================================================

mod overwrite {
    use super::*;

    #[test]
    fn write_at_truncates_the_tail() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        let logs = filled(&store, 50);

        let replacement = app(99, "replacement");
        store.write_at(20, &replacement).unwrap();
        assert_eq!(store.next_slot(), 21);
        assert_eq!(store.last_entry(), replacement);
        assert_eq!(store.entries(1, 20).unwrap(), logs[..19].to_vec());

        store.close().unwrap();
        drop(store);
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.next_slot(), 21);
        assert_eq!(store.last_entry(), replacement);
        assert!(!dir.path().join("store.idx.bak").exists());
    }

    #[test]
    fn write_at_next_slot_appends() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        filled(&store, 3);
        store.write_at(4, &app(1, "four")).unwrap();
        assert_eq!(store.next_slot(), 5);
    }

    #[test]
    fn write_at_out_of_range_fails() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        filled(&store, 3);
        assert!(matches!(
            store.write_at(9, &app(1, "x")),
            Err(LogStoreError::OutOfRange { .. })
        ));
        assert_eq!(store.next_slot(), 4);
    }
}

// =============================================================================
// SECTION 3: PACKS
// =============================================================================

mod packs {
    use super::*;

    #[test]
    fn pack_carries_a_range_to_another_store() {
        let dir = tempdir().unwrap();
        let source = FsLogStore::open(dir.path().join("a"), 100).unwrap();
        let logs = filled(&source, 30);

        let pack = source.pack(11, 10).unwrap();
        assert_eq!(unpack_entries(&pack).unwrap(), logs[10..20].to_vec());

        let target = FsLogStore::open(dir.path().join("b"), 100).unwrap();
        target.apply_pack(1, &source.pack(1, 30).unwrap()).unwrap();
        assert_eq!(target.entries(1, 31).unwrap(), logs);
    }

    #[test]
    fn apply_pack_replaces_the_tail() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        filled(&store, 10);

        let other = FsLogStore::open(dir.path().join("other"), 100).unwrap();
        other.append(&app(7, "x")).unwrap();
        other.append(&app(7, "y")).unwrap();
        store.apply_pack(6, &other.pack(1, 2).unwrap()).unwrap();

        assert_eq!(store.next_slot(), 8);
        assert_eq!(store.entry_at(6).unwrap(), Some(app(7, "x")));
        assert_eq!(store.last_entry(), app(7, "y"));
    }

    #[test]
    fn empty_pack_below_the_cache_keeps_the_last_entry() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 2).unwrap();
        let logs = filled(&store, 5);

        store.apply_pack(3, &pack_entries(&[]).unwrap()).unwrap();
        assert_eq!(store.next_slot(), 3);
        assert_eq!(store.last_entry(), logs[1]);
        assert_eq!(store.append(&app(9, "c")).unwrap(), 3);
        assert_eq!(store.last_entry(), app(9, "c"));
    }

    #[test]
    fn apply_pack_past_the_end_restarts_the_store() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        filled(&store, 3);

        let other = FsLogStore::open(dir.path().join("other"), 100).unwrap();
        other.append(&app(2, "z")).unwrap();
        store.apply_pack(20, &other.pack(1, 1).unwrap()).unwrap();

        assert_eq!(store.start_index(), 20);
        assert_eq!(store.next_slot(), 21);
        assert_eq!(store.entry_at(20).unwrap(), Some(app(2, "z")));
    }
}

// =============================================================================
// SECTION 4: COMPACTION
// =============================================================================

mod compaction {
    use super::*;

    #[test]
    fn compact_drops_the_prefix() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 20).unwrap();
        let logs = filled(&store, 60);

        assert!(store.compact(25));
        assert_eq!(store.start_index(), 26);
        assert_eq!(store.next_slot(), 61);
        assert!(matches!(store.entry_at(25), Err(LogStoreError::Compacted { .. })));
        assert_eq!(store.term_at(25), 0);
        assert_eq!(store.entries(26, 61).unwrap(), logs[25..].to_vec());

        store.close().unwrap();
        drop(store);
        let store = FsLogStore::open(dir.path(), 20).unwrap();
        assert_eq!(store.start_index(), 26);
        assert_eq!(store.entries(26, 61).unwrap(), logs[25..].to_vec());
        assert_eq!(store.append(&app(1, "next")).unwrap(), 61);
    }

    #[test]
    fn compact_below_start_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        filled(&store, 10);
        assert!(store.compact(4));
        assert!(store.compact(2));
        assert_eq!(store.start_index(), 5);
        assert_eq!(store.next_slot(), 11);
    }

    #[test]
    fn compact_past_the_tail_empties_the_store() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        filled(&store, 10);

        assert!(store.compact(30));
        assert_eq!(store.start_index(), 31);
        assert_eq!(store.next_slot(), 31);
        assert_eq!(store.last_entry().term(), 0);
        assert_eq!(store.append(&app(4, "after")).unwrap(), 31);
    }

    #[test]
    fn failed_compaction_leaves_the_store_unchanged() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 5).unwrap();
        let logs = filled(&store, 40);

        store.fail_next_compaction();
        assert!(!store.compact(15));
        assert_eq!(store.start_index(), 1);
        assert_eq!(store.next_slot(), 41);
        assert_eq!(store.entries(1, 41).unwrap(), logs);
        assert!(!dir.path().join("store.dat.bak").exists());

        // the failure is one-shot
        assert!(store.compact(15));
        assert_eq!(store.start_index(), 16);
        assert_eq!(store.entries(16, 41).unwrap(), logs[15..].to_vec());
    }

    #[test]
    fn interrupted_compaction_is_recovered_on_open() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        let logs = filled(&store, 5);
        store.close().unwrap();
        drop(store);

        // backups taken, data rewritten, index not rebased yet
        for name in ["store.idx", "store.dat", "store.sti"] {
            fs::copy(dir.path().join(name), dir.path().join(format!("{name}.bak"))).unwrap();
        }
        let data = dir.path().join("store.dat");
        let len = fs::metadata(&data).unwrap().len();
        fs::OpenOptions::new()
            .write(true)
            .open(&data)
            .unwrap()
            .set_len(len / 2)
            .unwrap();

        let store = FsLogStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.next_slot(), 6);
        assert_eq!(store.entries(1, 6).unwrap(), logs);
        assert!(!dir.path().join("store.dat.bak").exists());
        assert!(!dir.path().join("store.sti.bak").exists());
    }

    #[test]
    fn incomplete_backup_is_discarded_on_open() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        let logs = filled(&store, 3);
        store.close().unwrap();
        drop(store);

        fs::write(dir.path().join("store.idx.bak"), b"partial").unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.entries(1, 4).unwrap(), logs);
        assert!(!dir.path().join("store.idx.bak").exists());
    }

    #[test]
    fn failed_full_compaction_is_rolled_back() {
        let dir = tempdir().unwrap();
        let store = FsLogStore::open(dir.path(), 100).unwrap();
        let logs = filled(&store, 8);

        store.fail_next_compaction();
        assert!(!store.compact(8));
        assert_eq!(store.entries(1, 9).unwrap(), logs);
    }
}

// =============================================================================
// SECTION 5: STATE MANAGER
// =============================================================================

mod state_manager {
    use super::*;

    #[test]
    fn state_and_config_survive_restart() {
        let dir = tempdir().unwrap();
        let mut config = ClusterConfig::with_servers([
            SrvConfig::new(1, "tcp://10.0.0.1:9001"),
            SrvConfig::new(2, "tcp://10.0.0.2:9001"),
        ]);
        config.set_log_idx(4);
        {
            let mgr = FileStateManager::new(1, dir.path()).unwrap();
            mgr.save_state(&SrvState::new(7, Some(2), 3)).unwrap();
            mgr.save_config(&config).unwrap();
            mgr.load_log_store().unwrap().append(&app(7, "cmd")).unwrap();
        }

        let mgr = FileStateManager::new(1, dir.path()).unwrap();
        assert_eq!(mgr.server_id(), 1);
        assert_eq!(mgr.read_state().unwrap(), Some(SrvState::new(7, Some(2), 3)));
        assert_eq!(*mgr.load_config().unwrap(), config);
        let store = mgr.load_log_store().unwrap();
        assert_eq!(store.next_slot(), 2);
        assert_eq!(store.last_entry(), app(7, "cmd"));
    }

    #[test]
    fn log_lives_in_its_own_directory() {
        let dir = tempdir().unwrap();
        let mgr = FileStateManager::new(3, dir.path()).unwrap();
        mgr.load_log_store().unwrap().append(&app(1, "x")).unwrap();
        assert!(dir.path().join("log").join("store.dat").exists());
        assert_eq!(fs::read_dir(dir.path().join("log")).unwrap().count(), 3);
    }

    #[test]
    fn exit_goes_through_the_hook() {
        let dir = tempdir().unwrap();
        let code = Arc::new(AtomicI32::new(1));
        let seen = code.clone();
        let mgr = FileStateManager::new(1, dir.path())
            .unwrap()
            .with_exit_hook(move |c| seen.store(c, Ordering::SeqCst));
        mgr.system_exit(-1);
        assert_eq!(code.load(Ordering::SeqCst), -1);
    }
}
