//! Visibility / garbage collection over a merged entry stream.
//!
//! Input: every version of every key in internal-key order (user key
//! ascending, newest first), plus the range tombstones of the same inputs.
//! Output: the versions a reader at any live snapshot could still observe,
//! in the same order.
//!
//! Rules, applied per user key and per snapshot stripe:
//! - the newest entry of a stripe hides every older entry of that stripe
//! - a range tombstone drops older entries of its own stripe
//! - a run of merge operands is folded onto the value or deletion below it,
//!   or partially merged when the base lies outside the inputs
//! - a deletion in the oldest stripe is dropped when nothing older can exist
//!   outside the inputs
//! - a compaction filter may drop or rewrite surviving values

use std::collections::VecDeque;
use std::iter::Peekable;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::{FlushError, Result};
use crate::types::{Entry, InternalKey, RangeTombstone, SequenceNumber, ValueType};

use super::filter::{CompactionFilter, FilterDecision};
use super::range_del::{snapshot_stripe, RangeDelAggregator};
use super::{GcOptions, OlderDataCheck};

/// Counters describing what the iterator did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionIterationStats {
    pub num_input_records: u64,
    pub num_output_records: u64,
    pub num_record_drop_hidden: u64,
    pub num_record_drop_range_del: u64,
    pub num_record_drop_obsolete: u64,
    pub num_record_drop_user: u64,
    pub num_merge_operands_folded: u64,
    pub total_input_raw_bytes: u64,
    pub total_dropped_bytes: u64,
}

/// Applies snapshot, tombstone, merge and filter semantics to a merged stream
pub struct CompactionIterator<I: Iterator<Item = Entry>> {
    input: Peekable<I>,
    snapshots: Vec<SequenceNumber>,
    range_del: RangeDelAggregator,
    merge_operator: Option<Arc<dyn crate::compaction::MergeOperator>>,
    filter: Option<Box<dyn CompactionFilter>>,
    older_data: Option<Arc<dyn OlderDataCheck>>,
    pending: VecDeque<Entry>,
    status: Result<()>,
    stats: CompactionIterationStats,
}

impl<I: Iterator<Item = Entry>> CompactionIterator<I> {
    /// Fails with `NotSupported` if `filter` wants to respect snapshots.
    pub fn new(
        input: I,
        range_del: RangeDelAggregator,
        options: &GcOptions,
        filter: Option<Box<dyn CompactionFilter>>,
    ) -> Result<Self> {
        if let Some(f) = &filter {
            if !f.ignore_snapshots() {
                return Err(FlushError::NotSupported(format!(
                    "compaction filter {} must ignore snapshots",
                    f.name()
                )));
            }
        }

        Ok(Self {
            input: input.peekable(),
            snapshots: options.snapshots.as_slice().to_vec(),
            range_del,
            merge_operator: options.merge_operator.clone(),
            filter,
            older_data: options.older_data.clone(),
            pending: VecDeque::new(),
            status: Ok(()),
            stats: CompactionIterationStats::default(),
        })
    }

    /// First error met while iterating (merge failures)
    pub fn status(&self) -> &Result<()> {
        &self.status
    }

    pub fn into_status(self) -> Result<()> {
        self.status
    }

    pub fn stats(&self) -> &CompactionIterationStats {
        &self.stats
    }

    /// Point entries pulled from the input so far
    pub fn num_input_entries(&self) -> u64 {
        self.stats.num_input_records
    }

    /// Range tombstones that must be kept in the output
    pub fn output_range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_del
            .tombstones()
            .iter()
            .filter(|t| {
                let obsolete = snapshot_stripe(&self.snapshots, t.sequence) == 0
                    && self
                        .older_data
                        .as_ref()
                        .map_or(false, |c| !c.range_may_exist_beyond_inputs(&t.start, &t.end));
                !obsolete
            })
            .cloned()
            .collect()
    }

    /// Range tombstones fed in, before any were dropped
    pub fn num_input_range_tombstones(&self) -> usize {
        self.range_del.len()
    }

    fn stripe(&self, seq: SequenceNumber) -> usize {
        snapshot_stripe(&self.snapshots, seq)
    }

    fn unique_to_inputs(&self, user_key: &[u8]) -> bool {
        self.older_data
            .as_ref()
            .map_or(false, |c| !c.key_may_exist_beyond_inputs(user_key))
    }

    fn drop_bytes(&mut self, entry: &Entry) {
        self.stats.total_dropped_bytes += (entry.key.user_key.len() + entry.value.len()) as u64;
    }

    fn fill_pending(&mut self) {
        while self.pending.is_empty() && self.status.is_ok() {
            let first = match self.input.next() {
                Some(e) => e,
                None => return,
            };
            let user_key = first.key.user_key.clone();
            let mut versions = vec![first];
            while let Some(next) = self.input.next_if(|e| e.key.user_key == user_key) {
                versions.push(next);
            }

            self.stats.num_input_records += versions.len() as u64;
            self.stats.total_input_raw_bytes += versions
                .iter()
                .map(|e| (e.key.user_key.len() + e.value.len()) as u64)
                .sum::<u64>();

            self.process_user_key(&user_key, &versions);
        }
    }

    fn process_user_key(&mut self, user_key: &Bytes, versions: &[Entry]) {
        let mut hidden_stripe: Option<usize> = None;
        let mut i = 0;

        while i < versions.len() {
            let entry = &versions[i];
            let stripe = self.stripe(entry.sequence());

            if hidden_stripe == Some(stripe) {
                self.stats.num_record_drop_hidden += 1;
                self.drop_bytes(entry);
                i += 1;
                continue;
            }
            if self.range_del.should_delete(&entry.key) {
                self.stats.num_record_drop_range_del += 1;
                self.drop_bytes(entry);
                i += 1;
                continue;
            }

            match entry.value_type() {
                ValueType::Value => {
                    let out = self.apply_filter(entry);
                    self.pending.push_back(out);
                    hidden_stripe = Some(stripe);
                    i += 1;
                }
                ValueType::Deletion => {
                    if stripe == 0 && self.unique_to_inputs(user_key) {
                        self.stats.num_record_drop_obsolete += 1;
                        self.drop_bytes(entry);
                    } else {
                        self.pending.push_back(entry.clone());
                    }
                    hidden_stripe = Some(stripe);
                    i += 1;
                }
                ValueType::Merge => {
                    let (next, folded) = self.merge_run(user_key, versions, i, stripe);
                    if self.status.is_err() {
                        return;
                    }
                    if folded {
                        hidden_stripe = Some(stripe);
                    }
                    i = next;
                }
            }
        }
    }

    /// Handle the merge operands starting at `start`. Returns the index after
    /// the run and whether it was folded into a full value.
    fn merge_run(
        &mut self,
        user_key: &Bytes,
        versions: &[Entry],
        start: usize,
        stripe: usize,
    ) -> (usize, bool) {
        let mut end = start;
        while end < versions.len() {
            let e = &versions[end];
            if self.stripe(e.sequence()) != stripe
                || e.value_type() != ValueType::Merge
                || self.range_del.should_delete(&e.key)
            {
                break;
            }
            end += 1;
        }
        let run = &versions[start..end];

        let merge_operator = match &self.merge_operator {
            Some(op) => Arc::clone(op),
            None => {
                self.pending.extend(run.iter().cloned());
                return (end, false);
            }
        };

        // Some(base) when the value underneath the run is known
        let base: Option<Option<Bytes>> = match versions.get(end) {
            Some(below) if self.stripe(below.sequence()) == stripe => {
                if self.range_del.should_delete(&below.key) {
                    Some(None)
                } else {
                    match below.value_type() {
                        ValueType::Value => Some(Some(below.value.clone())),
                        ValueType::Deletion => Some(None),
                        ValueType::Merge => None,
                    }
                }
            }
            None if self.unique_to_inputs(user_key) => Some(None),
            _ => None,
        };

        let operands: Vec<Bytes> = run.iter().rev().map(|e| e.value.clone()).collect();
        let newest = run[0].sequence();

        match base {
            Some(existing) => {
                match merge_operator.full_merge(user_key, existing.as_deref(), &operands) {
                    Some(value) => {
                        self.stats.num_merge_operands_folded += run.len() as u64;
                        let merged = Entry::new(
                            InternalKey::new(user_key.clone(), newest, ValueType::Value),
                            value,
                        );
                        let merged = self.apply_filter(&merged);
                        self.pending.push_back(merged);
                        (end, true)
                    }
                    None => {
                        self.status = Err(FlushError::Corruption(format!(
                            "merge operator {} failed at sequence {}",
                            merge_operator.name(),
                            newest
                        )));
                        (end, false)
                    }
                }
            }
            None => {
                let partial = if run.len() > 1 {
                    merge_operator.partial_merge_multi(user_key, &operands)
                } else {
                    None
                };
                match partial {
                    Some(value) => {
                        self.stats.num_merge_operands_folded += run.len() as u64;
                        self.pending.push_back(Entry::new(
                            InternalKey::new(user_key.clone(), newest, ValueType::Merge),
                            value,
                        ));
                    }
                    None => self.pending.extend(run.iter().cloned()),
                }
                (end, false)
            }
        }
    }

    fn apply_filter(&mut self, entry: &Entry) -> Entry {
        let filter = match &self.filter {
            Some(f) => f,
            None => return entry.clone(),
        };

        match filter.filter(0, entry.user_key(), &entry.value) {
            FilterDecision::Keep => entry.clone(),
            FilterDecision::Remove => {
                self.stats.num_record_drop_user += 1;
                trace!(seq = entry.sequence(), "filter removed value");
                Entry::new(
                    InternalKey::new(entry.key.user_key.clone(), entry.sequence(), ValueType::Deletion),
                    Bytes::new(),
                )
            }
            FilterDecision::ChangeValue(value) => Entry::new(entry.key.clone(), value),
        }
    }
}

impl<I: Iterator<Item = Entry>> Iterator for CompactionIterator<I> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.pending.is_empty() {
            self.fill_pending();
        }
        let out = self.pending.pop_front();
        if out.is_some() {
            self.stats.num_output_records += 1;
        }
        out
    }
}
