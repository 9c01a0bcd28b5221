//! End-to-end scenarios against the in-memory filesystem: cursor moves, level-0 overlap
//! resolution, and the hybrid two-phase migration onto the secondary tier.

use std::{path::Path, sync::Arc};

use strata_lsm::{DbMode, Engine, EngineOptions};
use strata_lsm::filesystem::{Filesystem, MemoryFilesystem};


fn key(index: u64) -> Vec<u8> {
    format!("{index:020}").into_bytes()
}

fn open(fs: &MemoryFilesystem, mut options: EngineOptions) -> Engine {
    options.background_compaction = false;
    Engine::open_with_fs(options, Arc::new(fs.clone())).unwrap()
}

#[test]
fn empty_database_reopens_with_no_files() {
    let fs = MemoryFilesystem::new();
    let options = EngineOptions::new(DbMode::Default, "/pri");

    let engine = open(&fs, options.clone());
    engine.shutdown();
    drop(engine);

    let engine = open(&fs, options);
    for level in 0..14 {
        assert!(engine.files_at_level(level).is_empty());
    }
}

/// Cursor split, single-file push: a lone level-1 file is relabelled to level 2 without a
/// merge, and the move is durable in the manifest.
#[test]
fn cursor_single_file_push() {
    let fs = MemoryFilesystem::new();
    let mut options = EngineOptions::new(DbMode::BLsm, "/pri");
    options.level0_size_mb = 1;
    options.target_file_size = 8 << 20;
    let engine = open(&fs, options.clone());

    // Four level-0 tables over the same thousand keys; the merged level-1 table exceeds
    // the one-megabyte budget shared by the low levels.
    for round in 0..4_u8 {
        let batch: Vec<_> = (0..1000)
            .map(|index| (key(index), Some(vec![round; 1100])))
            .collect();
        engine.flush_batch(batch).unwrap();
    }

    assert!(engine.compact_once().unwrap());
    assert!(engine.files_at_level(0).is_empty());
    assert_eq!(engine.files_at_level(1).len(), 1);
    let file_number = engine.files_at_level(1)[0];

    // Level 2 is empty, so the oversized level-1 file pushes down as a pure relabel.
    assert!(engine.compact_once().unwrap());
    assert!(engine.files_at_level(1).is_empty());
    assert_eq!(engine.files_at_level(2), vec![file_number]);
    assert_eq!(engine.level_of(file_number), Some(2));

    // The same file number is at level 2 after recovery: the manifest recorded exactly a
    // deletion at level 1 and an addition at level 2.
    engine.shutdown();
    drop(engine);
    let engine = open(&fs, options);
    assert!(engine.files_at_level(1).is_empty());
    assert_eq!(engine.files_at_level(2), vec![file_number]);

    // The moved data still reads back from its new level.
    assert_eq!(engine.get(&key(999)).unwrap(), Some(vec![3_u8; 1100]));
}

/// Level-0 overlap resolution: four overlapping level-0 files collapse into disjoint
/// level-1 files, and a point read returns the highest-sequence write.
#[test]
fn level0_overlap_resolution() {
    let fs = MemoryFilesystem::new();
    let options = EngineOptions::new(DbMode::Default, "/pri");
    let engine = open(&fs, options);

    for round in 0..4_u64 {
        let base = round * 250;
        let mut batch: Vec<_> = (base..base + 250)
            .map(|index| (key(index), Some(format!("filler{index}").into_bytes())))
            .collect();
        // Every file also covers the shared key, so the four ranges pairwise overlap.
        batch.push((key(500), Some(format!("round{round}").into_bytes())));
        batch.sort();
        engine.flush_batch(batch).unwrap();
    }
    assert_eq!(engine.files_at_level(0).len(), 4);

    assert!(engine.compact_once().unwrap());
    assert!(engine.files_at_level(0).is_empty());
    assert!(!engine.files_at_level(1).is_empty());

    // The last writer of the shared key wins.
    assert_eq!(engine.get(&key(500)).unwrap(), Some(b"round3".to_vec()));
    // Untouched keys from every round survive the merge.
    assert_eq!(engine.get(&key(10)).unwrap(), Some(b"filler10".to_vec()));
    assert_eq!(engine.get(&key(900)).unwrap(), Some(b"filler900".to_vec()));
}

/// Hybrid two-phase migration: once compaction pushes data through the middle band, the
/// moved tables are copied to the secondary tier asynchronously, the primary retains its
/// copy, and no in-flight marks remain after the pipeline drains.
#[test]
fn hybrid_two_phase_migration() {
    let fs = MemoryFilesystem::new();
    let mut options = EngineOptions::new(DbMode::HLsm, "/pri").with_secondary("/sec");
    options.level0_size_mb = 1;
    options.target_file_size = 256 << 10;
    let engine = open(&fs, options);

    for round in 0..16_u64 {
        let base = round * 250;
        let batch: Vec<_> = (base..base + 250)
            .map(|index| (key(index), Some(vec![round as u8; 1024])))
            .collect();
        engine.flush_batch(batch).unwrap();
    }
    engine.compact_until_quiet().unwrap();
    engine.wait_pipeline_idle();

    assert_eq!(engine.in_flight_copies(), 0);

    // Enough data flowed down for the two-phase band to have staged tables across tiers.
    let mut deep_files: Vec<u64> = Vec::new();
    for level in 2..8 {
        deep_files.extend(engine.files_at_level(level));
    }
    assert!(
        !deep_files.is_empty(),
        "expected tables below the top band after compacting",
    );

    let migrated: Vec<u64> = deep_files
        .iter()
        .copied()
        .filter(|number| fs.exists(Path::new(&format!("/sec/{number:06}.ldb"))))
        .collect();
    assert!(
        !migrated.is_empty(),
        "expected at least one table copied to the secondary tier",
    );
    for number in &migrated {
        // The primary keeps its copy until an obsolete sweep says otherwise.
        assert!(fs.exists(Path::new(&format!("/pri/{number:06}.ldb"))));
    }

    // Reads still resolve through the staged levels.
    assert_eq!(engine.get(&key(0)).unwrap(), Some(vec![0_u8; 1024]));
    assert_eq!(engine.get(&key(3999)).unwrap(), Some(vec![15_u8; 1024]));
}

/// Writes after a reopen continue the sequence and file numbering without clashing with
/// recovered state.
#[test]
fn numbering_continues_across_reopen() {
    let fs = MemoryFilesystem::new();
    let options = EngineOptions::new(DbMode::Default, "/pri");

    let engine = open(&fs, options.clone());
    engine
        .flush_batch(vec![(b"one".to_vec(), Some(b"1".to_vec()))])
        .unwrap();
    let first_files = engine.files_at_level(0);
    let first_sequence = engine.last_sequence();
    engine.shutdown();
    drop(engine);

    let engine = open(&fs, options);
    assert_eq!(engine.last_sequence(), first_sequence);
    engine
        .flush_batch(vec![(b"two".to_vec(), Some(b"2".to_vec()))])
        .unwrap();

    let second_files = engine.files_at_level(0);
    assert_eq!(second_files.len(), 2);
    assert!(second_files.iter().any(|number| !first_files.contains(number)));
    assert!(engine.last_sequence() > first_sequence);
    assert_eq!(engine.get(b"one").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"two").unwrap(), Some(b"2".to_vec()));
}
