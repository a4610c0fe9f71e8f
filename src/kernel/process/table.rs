// src/kernel/process/table.rs
//! ジョブテーブル
//!
//! 固定長セグメントを連結した世代付きアリーナ。テーブルが伸びても既存の
//! スロットは移動しないため、ジョブへの参照を保持したまま拡張できます。

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::Job;
use crate::arch::{ArchContext, ProcessorContext};
use crate::config::JOB_SEGMENT_SLOTS;
use crate::kernel::core::{JobId, TaskId, ThreadId};

/// 最後にディスパッチされたスレッド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// ジョブ
    pub job: JobId,
    /// タスク
    pub task: TaskId,
    /// スレッド
    pub thread: ThreadId,
}

#[derive(Debug)]
struct Slot<C: ProcessorContext> {
    generation: u32,
    job: Option<Job<C>>,
}

/// ジョブテーブル
#[derive(Debug)]
pub struct JobTable<C: ProcessorContext = ArchContext> {
    segments: Vec<Box<[Slot<C>]>>,
    len: usize,
    current: Option<Cursor>,
}

impl<C: ProcessorContext> JobTable<C> {
    /// 空のテーブルを作成
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments: Vec::new(),
            len: 0,
            current: None,
        }
    }

    /// 登録済みジョブ数
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// 空か確認
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 確保済みスロット数
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segments.len() * JOB_SEGMENT_SLOTS
    }

    fn slot(&self, index: usize) -> Option<&Slot<C>> {
        self.segments
            .get(index / JOB_SEGMENT_SLOTS)
            .map(|seg| &seg[index % JOB_SEGMENT_SLOTS])
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut Slot<C>> {
        self.segments
            .get_mut(index / JOB_SEGMENT_SLOTS)
            .map(|seg| &mut seg[index % JOB_SEGMENT_SLOTS])
    }

    fn grow(&mut self) {
        let segment: Vec<Slot<C>> = (0..JOB_SEGMENT_SLOTS)
            .map(|_| Slot {
                generation: 0,
                job: None,
            })
            .collect();
        self.segments.push(segment.into_boxed_slice());
        log::debug!("job table grown to {} slots", self.capacity());
    }

    /// 空きスロットにジョブを登録
    ///
    /// 最も番号の小さい空きスロットを使い、空きがなければセグメントを追加します。
    pub fn insert_with(&mut self, make: impl FnOnce(JobId) -> Job<C>) -> JobId {
        let index = match (0..self.capacity()).find(|&i| {
            self.slot(i).is_some_and(|s| s.job.is_none())
        }) {
            Some(index) => index,
            None => {
                let index = self.capacity();
                self.grow();
                index
            }
        };

        let generation = self.slot(index).map_or(0, |s| s.generation);
        let id = JobId::new(index as u32, generation);
        let job = make(id);
        if let Some(slot) = self.slot_mut(index) {
            slot.job = Some(job);
            self.len += 1;
        }
        id
    }

    /// ハンドルからジョブを取得
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<&Job<C>> {
        self.slot(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.job.as_ref())
    }

    /// ハンドルからジョブを可変で取得
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job<C>> {
        self.slot_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.job.as_mut())
    }

    /// スロット番号からジョブを取得
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&Job<C>> {
        self.slot(index).and_then(|s| s.job.as_ref())
    }

    /// スロット番号からジョブを可変で取得
    pub fn get_by_index_mut(&mut self, index: usize) -> Option<&mut Job<C>> {
        self.slot_mut(index).and_then(|s| s.job.as_mut())
    }

    /// ジョブを取り除き、スロットの世代を進める
    pub fn remove(&mut self, id: JobId) -> Option<Job<C>> {
        let slot = self
            .slot_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())?;
        let job = slot.job.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(job)
    }

    /// 登録済みジョブをスロット順に列挙
    pub fn iter(&self) -> impl Iterator<Item = &Job<C>> {
        self.segments
            .iter()
            .flat_map(|seg| seg.iter())
            .filter_map(|s| s.job.as_ref())
    }

    /// 最後にディスパッチされたスレッド
    ///
    /// ジョブやスレッドが既に削除されている場合もあります。
    #[must_use]
    pub const fn current(&self) -> Option<Cursor> {
        self.current
    }

    pub(crate) fn set_current(&mut self, cursor: Option<Cursor>) {
        self.current = cursor;
    }
}

impl<C: ProcessorContext> Default for JobTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::s390x::S390Context;
    use crate::kernel::core::{ObjectName, UserId};
    use crate::kernel::process::JobFlags;

    fn make(id: JobId) -> Job<S390Context> {
        Job::new(
            id,
            ObjectName::new("J").unwrap(),
            0,
            JobFlags::SLEEP,
            0,
            UserId::ROOT,
        )
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut table = JobTable::new();
        let a = table.insert_with(make);
        assert_eq!(a.index(), 0);
        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());

        let b = table.insert_with(make);
        assert_eq!(b.index(), 0);
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).map(Job::id), Some(b));
    }

    #[test]
    fn growth_does_not_move_existing_jobs() {
        let mut table = JobTable::new();
        let first = table.insert_with(make);
        let before: *const Job<S390Context> = table.get(first).unwrap();

        let ids: Vec<JobId> = (0..JOB_SEGMENT_SLOTS).map(|_| table.insert_with(make)).collect();
        assert_eq!(table.capacity(), 2 * JOB_SEGMENT_SLOTS);
        assert_eq!(table.len(), JOB_SEGMENT_SLOTS + 1);
        assert_eq!(ids.last().unwrap().index() as usize, JOB_SEGMENT_SLOTS);

        let after: *const Job<S390Context> = table.get(first).unwrap();
        assert!(core::ptr::eq(before, after));
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut table = JobTable::new();
        let ids: Vec<JobId> = (0..3).map(|_| table.insert_with(make)).collect();
        table.remove(ids[1]);
        let again = table.insert_with(make);
        assert_eq!(again.index(), 1);
        assert_eq!(again.generation(), 1);
        assert_eq!(table.iter().count(), 3);
    }
}
