//! Size-bucketed allocator of free directory-entry runs.
//!
//! A directory's stream accumulates holes as entries are deleted: runs of
//! consecutive free 32-byte records. New entries need a contiguous run of
//! `lfn_slots + 1` records, so the table indexes holes by run length. The
//! longest run a name can need is [`MAX_RUN_SLOTS`]: 20 long-name records
//! for a 255-character name plus its short record; longer holes are split
//! into chunks of at most that size when they are added.
//!
//! Each bucket is an ordered set of byte positions, and a bit mask marks
//! non-empty buckets so allocation finds the smallest feasible bucket with
//! one trailing-zeros scan. Ingest does not coalesce across previously
//! inserted ranges; the directory scanner passes maximal runs already.

use alloc::collections::BTreeSet;

use log::trace;

use crate::{Error, Result, DIRENT_SIZE};

/// Longest run of records tracked as one unit, `ceil((255 + 12) / 13) + 1`.
pub const MAX_RUN_SLOTS: usize = 21;

#[derive(Debug, Default)]
pub struct FreeDirectoryEntryTable {
    /// `buckets[n]` holds the positions of runs of exactly `n` free records.
    /// Index 0 is never used.
    buckets: [BTreeSet<usize>; MAX_RUN_SLOTS + 1],
    /// Bit `n` set iff `buckets[n]` is non-empty.
    bucket_mask: u32,
}

impl FreeDirectoryEntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` consecutive free records starting at byte `position`.
    ///
    /// Runs longer than [`MAX_RUN_SLOTS`] are split into maximal chunks,
    /// advancing the position by `chunk * 32` for each. `position` must be
    /// record aligned.
    pub fn add_free_range(&mut self, mut position: usize, mut count: usize) {
        debug_assert_eq!(position % DIRENT_SIZE, 0);
        while count > 0 {
            let chunk = count.min(MAX_RUN_SLOTS);
            self.buckets[chunk].insert(position);
            self.bucket_mask |= 1 << chunk;
            position += chunk * DIRENT_SIZE;
            count -= chunk;
        }
    }

    /// Take a run of `count` records, preferring the smallest bucket that
    /// can satisfy the request and the lowest position within it. A longer
    /// run is split and its tail re-inserted.
    ///
    /// Returns `Ok(None)` when no feasible run exists; the caller then
    /// appends at the directory's end-of-entries watermark. A `count`
    /// outside `1..=MAX_RUN_SLOTS` is a caller bug, reported as an error and
    /// never as exhaustion.
    pub fn allocate(&mut self, count: usize) -> Result<Option<usize>> {
        if count == 0 || count > MAX_RUN_SLOTS {
            return Err(Error::InvalidArgument("free-run length out of range"));
        }
        let feasible = self.bucket_mask & !((1u32 << count) - 1);
        if feasible == 0 {
            return Ok(None);
        }
        let bucket = feasible.trailing_zeros() as usize;
        let position = *self.buckets[bucket]
            .first()
            .expect("bucket mask out of sync with bucket sets");
        self.buckets[bucket].remove(&position);
        if self.buckets[bucket].is_empty() {
            self.bucket_mask &= !(1 << bucket);
        }
        if bucket > count {
            self.add_free_range(position + count * DIRENT_SIZE, bucket - count);
        }
        trace!("allocated {count} directory records at {position}");
        Ok(Some(position))
    }

    /// Total free records currently tracked.
    pub fn free_slots(&self) -> usize {
        self.buckets
            .iter()
            .enumerate()
            .map(|(size, set)| size * set.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_mask == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_long_ranges_at_max_run() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, 50);
        // 50 = 21 + 21 + 8
        assert_eq!(table.free_slots(), 50);
        assert!(table.buckets[21].contains(&0));
        assert!(table.buckets[21].contains(&(21 * DIRENT_SIZE)));
        assert!(table.buckets[8].contains(&(42 * DIRENT_SIZE)));
    }

    #[test]
    fn allocates_best_fit_lowest_position() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, 50);

        // Smallest feasible bucket is 21; lowest position wins, and the
        // 11-record tail goes back into the table.
        assert_eq!(table.allocate(10).unwrap(), Some(0));
        assert!(table.buckets[11].contains(&(10 * DIRENT_SIZE)));

        // Bucket 11 now beats bucket 21 for another 10-record request.
        assert_eq!(table.allocate(10).unwrap(), Some(10 * DIRENT_SIZE));
        assert!(table.buckets[1].contains(&(20 * DIRENT_SIZE)));

        assert_eq!(table.allocate(10).unwrap(), Some(21 * DIRENT_SIZE));
        assert_eq!(table.allocate(10).unwrap(), Some(31 * DIRENT_SIZE));

        // 10 records remain but the largest run is 8: exhaustion, not error.
        assert_eq!(table.free_slots(), 10);
        assert_eq!(table.allocate(10).unwrap(), None);

        // Single-record requests drain the leftovers, smallest bucket first.
        assert_eq!(table.allocate(1).unwrap(), Some(20 * DIRENT_SIZE));
        assert_eq!(table.allocate(1).unwrap(), Some(41 * DIRENT_SIZE));
        for i in 0..8 {
            assert_eq!(table.allocate(1).unwrap(), Some((42 + i) * DIRENT_SIZE));
        }
        assert_eq!(table.allocate(1).unwrap(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn conservation_across_adds_and_allocates() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, 17);
        table.add_free_range(40 * DIRENT_SIZE, 29);
        let total = 17 + 29;

        let mut allocated = 0;
        for request in [5, 1, 21, 3, 3, 7] {
            if table.allocate(request).unwrap().is_some() {
                allocated += request;
            }
        }
        assert_eq!(table.free_slots() + allocated, total);
    }

    #[test]
    fn equal_buckets_tie_break_on_position() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(10 * DIRENT_SIZE, 4);
        table.add_free_range(2 * DIRENT_SIZE, 4);
        assert_eq!(table.allocate(4).unwrap(), Some(2 * DIRENT_SIZE));
        assert_eq!(table.allocate(4).unwrap(), Some(10 * DIRENT_SIZE));
    }

    #[test]
    fn out_of_range_counts_are_errors_not_exhaustion() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, 4);
        assert!(matches!(
            table.allocate(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.allocate(MAX_RUN_SLOTS + 1),
            Err(Error::InvalidArgument(_))
        ));
        // The table is untouched afterwards.
        assert_eq!(table.free_slots(), 4);
    }

    #[test]
    fn deleted_run_is_reused_for_smaller_entries() {
        // A 3-record hole left by a deleted long-named entry serves three
        // one-record entries in order.
        let mut table = FreeDirectoryEntryTable::new();
        let hole = 7 * DIRENT_SIZE;
        table.add_free_range(hole, 3);
        assert_eq!(table.allocate(1).unwrap(), Some(hole));
        assert_eq!(table.allocate(1).unwrap(), Some(hole + DIRENT_SIZE));
        assert_eq!(table.allocate(1).unwrap(), Some(hole + 2 * DIRENT_SIZE));
        assert_eq!(table.allocate(1).unwrap(), None);
    }
}
