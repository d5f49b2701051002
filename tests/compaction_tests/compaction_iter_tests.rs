//! Tests for the visibility / garbage collection pipeline
//!
//! These tests verify:
//! - Several memtable streams merge into one newest-first stream per key
//! - Snapshot stripes keep versions that an open snapshot can still read
//! - Deletions and range tombstones survive unless older data is ruled out
//! - Merge operands fold, stay unfolded, or fail with corruption
//! - Filters rewrite values and counters track what was dropped

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use flushkv::compaction::{
    CompactionFilter, CompactionFilterContext, CompactionFilterFactory, CompactionIterator,
    FilterDecision, GcOptions, MergeOperator, MergingIterator, OlderDataCheck, RangeDelAggregator,
    SnapshotSet, StringAppendOperator, TableFileCreationReason,
};
use flushkv::types::{Entry, InternalKey, RangeTombstone, ValueType};

type Row = (String, u64, ValueType, String);

fn entry(key: &str, seq: u64, value_type: ValueType, value: &str) -> Entry {
    Entry::new(
        InternalKey::new(Bytes::copy_from_slice(key.as_bytes()), seq, value_type),
        Bytes::copy_from_slice(value.as_bytes()),
    )
}

fn row(e: &Entry) -> Row {
    (
        String::from_utf8_lossy(e.user_key()).into_owned(),
        e.sequence(),
        e.value_type(),
        String::from_utf8_lossy(&e.value).into_owned(),
    )
}

fn sorted(mut entries: Vec<Entry>) -> Vec<Entry> {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

/// Keys that live in some older table file
struct OlderKeys(BTreeSet<&'static str>);

impl OlderDataCheck for OlderKeys {
    fn key_may_exist_beyond_inputs(&self, user_key: &[u8]) -> bool {
        self.0.iter().any(|k| k.as_bytes() == user_key)
    }

    fn range_may_exist_beyond_inputs(&self, start: &[u8], end: &[u8]) -> bool {
        self.0
            .iter()
            .any(|k| k.as_bytes() >= start && k.as_bytes() < end)
    }
}

fn nothing_older() -> Option<Arc<dyn OlderDataCheck>> {
    Some(Arc::new(OlderKeys(BTreeSet::new())))
}

/// Run `sources` (each sorted) with `tombstones` through the pipeline
fn compact(
    sources: Vec<Vec<Entry>>,
    tombstones: Vec<RangeTombstone>,
    gc: &GcOptions,
) -> (Vec<Row>, Vec<RangeTombstone>) {
    let mut range_del = RangeDelAggregator::new(gc.snapshots.as_slice());
    range_del.add_tombstones(tombstones);
    let filter = gc.create_filter(TableFileCreationReason::Flush);
    let mut iter = CompactionIterator::new(MergingIterator::new(sources), range_del, gc, filter)
        .unwrap();
    let rows: Vec<Row> = iter.by_ref().map(|e| row(&e)).collect();
    let tombstones = iter.output_range_tombstones();
    iter.into_status().unwrap();
    (rows, tombstones)
}

fn r(key: &str, seq: u64, value_type: ValueType, value: &str) -> Row {
    (key.to_string(), seq, value_type, value.to_string())
}

// =============================================================================
// Visibility
// =============================================================================

#[test]
fn test_streams_merge_newest_first() {
    let older = sorted(vec![
        entry("a", 1, ValueType::Value, "a1"),
        entry("c", 2, ValueType::Value, "c2"),
    ]);
    let newer = sorted(vec![
        entry("a", 3, ValueType::Value, "a3"),
        entry("b", 4, ValueType::Value, "b4"),
    ]);

    let (rows, _) = compact(vec![older, newer], vec![], &GcOptions::default());

    assert_eq!(
        rows,
        vec![
            r("a", 3, ValueType::Value, "a3"),
            r("b", 4, ValueType::Value, "b4"),
            r("c", 2, ValueType::Value, "c2"),
        ]
    );
}

#[test]
fn test_one_version_per_snapshot_stripe() {
    // Stripes: [..=2], (2..=5], (5..]
    let gc = GcOptions {
        snapshots: SnapshotSet::new(vec![5, 2]),
        ..Default::default()
    };
    let sources = vec![
        sorted(vec![
            entry("k", 1, ValueType::Value, "v1"),
            entry("k", 2, ValueType::Value, "v2"),
        ]),
        sorted(vec![
            entry("k", 4, ValueType::Value, "v4"),
            entry("k", 5, ValueType::Value, "v5"),
        ]),
        sorted(vec![
            entry("k", 7, ValueType::Value, "v7"),
            entry("k", 8, ValueType::Value, "v8"),
        ]),
    ];

    let (rows, _) = compact(sources, vec![], &gc);

    assert_eq!(
        rows,
        vec![
            r("k", 8, ValueType::Value, "v8"),
            r("k", 5, ValueType::Value, "v5"),
            r("k", 2, ValueType::Value, "v2"),
        ]
    );
}

#[test]
fn test_deletion_kept_when_older_file_holds_key() {
    let gc = GcOptions {
        older_data: Some(Arc::new(OlderKeys(["old"].into_iter().collect()))),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("new", 2, ValueType::Deletion, ""),
        entry("new", 1, ValueType::Value, "n1"),
        entry("old", 4, ValueType::Deletion, ""),
    ]);

    let (rows, _) = compact(vec![source], vec![], &gc);

    assert_eq!(rows, vec![r("old", 4, ValueType::Deletion, "")]);
}

#[test]
fn test_deletion_above_snapshot_is_kept() {
    let gc = GcOptions {
        snapshots: SnapshotSet::new(vec![1]),
        older_data: nothing_older(),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("k", 2, ValueType::Deletion, ""),
        entry("k", 1, ValueType::Value, "v1"),
    ]);

    let (rows, _) = compact(vec![source], vec![], &gc);

    assert_eq!(
        rows,
        vec![
            r("k", 2, ValueType::Deletion, ""),
            r("k", 1, ValueType::Value, "v1"),
        ]
    );
}

#[test]
fn test_range_tombstone_respects_snapshot() {
    let gc = GcOptions {
        snapshots: SnapshotSet::new(vec![2]),
        older_data: nothing_older(),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("a", 1, ValueType::Value, "a1"),
        entry("b", 3, ValueType::Value, "b3"),
        entry("z", 4, ValueType::Value, "z4"),
    ]);
    let tombstone = RangeTombstone::new(&b"a"[..], &b"m"[..], 5);

    let (rows, kept) = compact(vec![source], vec![tombstone.clone()], &gc);

    // a@1 is still visible at snapshot 2; b@3 shares the tombstone's stripe
    assert_eq!(
        rows,
        vec![r("a", 1, ValueType::Value, "a1"), r("z", 4, ValueType::Value, "z4")]
    );
    assert_eq!(kept, vec![tombstone]);
}

#[test]
fn test_range_tombstone_kept_over_older_files() {
    let gc = GcOptions {
        older_data: Some(Arc::new(OlderKeys(["c"].into_iter().collect()))),
        ..Default::default()
    };
    let covering = RangeTombstone::new(&b"a"[..], &b"f"[..], 9);
    let disjoint = RangeTombstone::new(&b"x"[..], &b"y"[..], 9);

    let (rows, kept) = compact(vec![vec![]], vec![covering.clone(), disjoint], &gc);

    assert!(rows.is_empty());
    assert_eq!(kept, vec![covering]);
}

// =============================================================================
// Merge
// =============================================================================

#[test]
fn test_merge_operands_kept_without_operator() {
    let source = sorted(vec![
        entry("k", 3, ValueType::Merge, "c"),
        entry("k", 2, ValueType::Merge, "b"),
        entry("k", 1, ValueType::Value, "a"),
    ]);

    let (rows, _) = compact(vec![source], vec![], &GcOptions::default());

    assert_eq!(
        rows,
        vec![
            r("k", 3, ValueType::Merge, "c"),
            r("k", 2, ValueType::Merge, "b"),
            r("k", 1, ValueType::Value, "a"),
        ]
    );
}

#[test]
fn test_merge_onto_deletion_starts_fresh() {
    let gc = GcOptions {
        merge_operator: Some(Arc::new(StringAppendOperator::new(b'|'))),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("k", 3, ValueType::Merge, "y"),
        entry("k", 2, ValueType::Merge, "x"),
        entry("k", 1, ValueType::Deletion, ""),
    ]);

    let (rows, _) = compact(vec![source], vec![], &gc);

    assert_eq!(rows, vec![r("k", 3, ValueType::Value, "x|y")]);
}

#[test]
fn test_merge_does_not_cross_snapshot() {
    let gc = GcOptions {
        snapshots: SnapshotSet::new(vec![2]),
        merge_operator: Some(Arc::new(StringAppendOperator::new(b','))),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("k", 4, ValueType::Merge, "d"),
        entry("k", 3, ValueType::Merge, "c"),
        entry("k", 2, ValueType::Merge, "b"),
        entry("k", 1, ValueType::Value, "a"),
    ]);

    let (rows, _) = compact(vec![source], vec![], &gc);

    assert_eq!(
        rows,
        vec![
            r("k", 4, ValueType::Merge, "c,d"),
            r("k", 2, ValueType::Value, "a,b"),
        ]
    );
}

#[test]
fn test_merge_failure_is_corruption() {
    struct Refuses;
    impl MergeOperator for Refuses {
        fn full_merge(&self, _: &[u8], _: Option<&[u8]>, _: &[Bytes]) -> Option<Bytes> {
            None
        }
        fn name(&self) -> &str {
            "refuses"
        }
    }

    let gc = GcOptions {
        merge_operator: Some(Arc::new(Refuses)),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("a", 1, ValueType::Value, "fine"),
        entry("k", 3, ValueType::Merge, "m"),
        entry("k", 2, ValueType::Value, "base"),
        entry("z", 4, ValueType::Value, "never reached"),
    ]);
    let mut iter = CompactionIterator::new(
        MergingIterator::new(vec![source]),
        RangeDelAggregator::default(),
        &gc,
        None,
    )
    .unwrap();

    let rows: Vec<Row> = iter.by_ref().map(|e| row(&e)).collect();

    assert_eq!(rows, vec![r("a", 1, ValueType::Value, "fine")]);
    let err = iter.into_status().unwrap_err();
    assert!(err.is_corruption(), "{}", err);
}

// =============================================================================
// Filters
// =============================================================================

struct Redactor;

impl CompactionFilter for Redactor {
    fn filter(&self, _level: usize, key: &[u8], _value: &[u8]) -> FilterDecision {
        match key {
            b"secret" => FilterDecision::Remove,
            b"card" => FilterDecision::ChangeValue(Bytes::from_static(b"****")),
            _ => FilterDecision::Keep,
        }
    }

    fn name(&self) -> &str {
        "redactor"
    }
}

struct RedactorFactory {
    on_flush: bool,
}

impl CompactionFilterFactory for RedactorFactory {
    fn create_compaction_filter(
        &self,
        context: &CompactionFilterContext,
    ) -> Option<Box<dyn CompactionFilter>> {
        assert_eq!(context.reason, TableFileCreationReason::Flush);
        Some(Box::new(Redactor))
    }

    fn should_filter_table_file_creation(&self, reason: TableFileCreationReason) -> bool {
        self.on_flush && reason == TableFileCreationReason::Flush
    }

    fn name(&self) -> &str {
        "redactor"
    }
}

fn filter_input() -> Vec<Vec<Entry>> {
    vec![sorted(vec![
        entry("card", 2, ValueType::Value, "4111"),
        entry("plain", 3, ValueType::Value, "hello"),
        entry("secret", 4, ValueType::Value, "hunter2"),
    ])]
}

#[test]
fn test_filter_rewrites_and_removes() {
    let gc = GcOptions {
        compaction_filter_factory: Some(Arc::new(RedactorFactory { on_flush: true })),
        ..Default::default()
    };

    let (rows, _) = compact(filter_input(), vec![], &gc);

    assert_eq!(
        rows,
        vec![
            r("card", 2, ValueType::Value, "****"),
            r("plain", 3, ValueType::Value, "hello"),
            r("secret", 4, ValueType::Deletion, ""),
        ]
    );
}

#[test]
fn test_filter_skipped_unless_factory_opts_in() {
    let gc = GcOptions {
        compaction_filter_factory: Some(Arc::new(RedactorFactory { on_flush: false })),
        ..Default::default()
    };

    let (rows, _) = compact(filter_input(), vec![], &gc);

    assert_eq!(rows[0], r("card", 2, ValueType::Value, "4111"));
    assert_eq!(rows[2], r("secret", 4, ValueType::Value, "hunter2"));
}

// =============================================================================
// Counters
// =============================================================================

#[test]
fn test_iteration_stats() {
    let gc = GcOptions {
        older_data: nothing_older(),
        merge_operator: Some(Arc::new(StringAppendOperator::new(b','))),
        compaction_filter_factory: Some(Arc::new(RedactorFactory { on_flush: true })),
        ..Default::default()
    };
    let source = sorted(vec![
        entry("a", 2, ValueType::Value, "a2"),
        entry("a", 1, ValueType::Value, "a1"),
        entry("d", 3, ValueType::Deletion, ""),
        entry("m", 5, ValueType::Merge, "y"),
        entry("m", 4, ValueType::Merge, "x"),
        entry("r", 6, ValueType::Value, "r6"),
        entry("secret", 7, ValueType::Value, "s"),
    ]);
    let mut range_del = RangeDelAggregator::new(&[]);
    range_del.add_tombstones(vec![RangeTombstone::new(&b"r"[..], &b"s"[..], 9)]);
    let filter = gc.create_filter(TableFileCreationReason::Flush);
    let mut iter =
        CompactionIterator::new(MergingIterator::new(vec![source]), range_del, &gc, filter)
            .unwrap();

    let rows: Vec<Row> = iter.by_ref().map(|e| row(&e)).collect();

    assert_eq!(
        rows,
        vec![
            r("a", 2, ValueType::Value, "a2"),
            r("m", 5, ValueType::Value, "x,y"),
            r("secret", 7, ValueType::Deletion, ""),
        ]
    );
    let stats = iter.stats().clone();
    assert_eq!(stats.num_input_records, 7);
    assert_eq!(stats.num_output_records, 3);
    assert_eq!(stats.num_record_drop_hidden, 1);
    assert_eq!(stats.num_record_drop_obsolete, 1);
    assert_eq!(stats.num_record_drop_range_del, 1);
    assert_eq!(stats.num_record_drop_user, 1);
    assert_eq!(stats.num_merge_operands_folded, 2);
    assert_eq!(iter.num_input_entries(), 7);
    assert_eq!(iter.num_input_range_tombstones(), 1);
    assert!(iter.output_range_tombstones().is_empty());
}
