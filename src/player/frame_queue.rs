use crate::core::{FramePayload, Rational};
use crate::player::packet_queue::PacketQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
pub const SAMPLE_QUEUE_SIZE: usize = 9;
/// 槽位数组的固定上限（各类型容量中的最大值）
pub const FRAME_QUEUE_SIZE: usize = {
    let a = if VIDEO_PICTURE_QUEUE_SIZE > SAMPLE_QUEUE_SIZE {
        VIDEO_PICTURE_QUEUE_SIZE
    } else {
        SAMPLE_QUEUE_SIZE
    };
    if SUBPICTURE_QUEUE_SIZE > a {
        SUBPICTURE_QUEUE_SIZE
    } else {
        a
    }
};

/// 槽位的时间与几何信息（可复制，读取时不持有槽位锁）
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    pub serial: i32,
    pub pts: f64,      // 显示时间戳（秒）
    pub duration: f64, // 持续时间（秒）
    pub pos: i64,      // 在源中的字节位置
    pub width: u32,
    pub height: u32,
    pub sar: Rational,
    /// 已上传到渲染器
    pub uploaded: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            serial: -1,
            pts: f64::NAN,
            duration: 0.0,
            pos: -1,
            width: 0,
            height: 0,
            sar: Rational::new(0, 1),
            uploaded: false,
        }
    }
}

/// 帧队列中的一个槽位
#[derive(Debug, Default)]
pub struct Frame {
    pub meta: FrameMeta,
    pub payload: FramePayload,
}

struct Indices {
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

/// 固定容量的环形帧队列
///
/// 槽位在构造时分配并原地复用。读写索引由队列锁保护，
/// 每个槽位自带一把锁，写端在槽位锁内填充数据，发布时才推进写索引。
/// 两把锁从不嵌套持有。
pub struct FrameQueue {
    slots: Vec<Mutex<Frame>>,
    state: Mutex<Indices>,
    cond: Condvar,
    max_size: usize,
    keep_last: bool,
    pktq: Arc<PacketQueue>,
}

impl FrameQueue {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.clamp(1, FRAME_QUEUE_SIZE);
        Self {
            slots: (0..max_size).map(|_| Mutex::new(Frame::default())).collect(),
            state: Mutex::new(Indices {
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            max_size,
            keep_last,
            pktq,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// 唤醒所有等待者（中止时使用）
    pub fn signal(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    fn current_index(&self) -> usize {
        let st = self.state.lock();
        (st.rindex + st.rindex_shown) % self.max_size
    }

    fn next_index(&self) -> usize {
        let st = self.state.lock();
        (st.rindex + st.rindex_shown + 1) % self.max_size
    }

    fn last_index(&self) -> usize {
        self.state.lock().rindex
    }

    pub fn peek_current(&self) -> FrameMeta {
        let idx = self.current_index();
        self.slots[idx].lock().meta
    }

    pub fn peek_next(&self) -> FrameMeta {
        let idx = self.next_index();
        self.slots[idx].lock().meta
    }

    pub fn peek_last_shown(&self) -> FrameMeta {
        let idx = self.last_index();
        self.slots[idx].lock().meta
    }

    pub fn with_current<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        let idx = self.current_index();
        f(&mut self.slots[idx].lock())
    }

    pub fn with_next<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        let idx = self.next_index();
        f(&mut self.slots[idx].lock())
    }

    pub fn with_last_shown<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        let idx = self.last_index();
        f(&mut self.slots[idx].lock())
    }

    /// 等待一个可写槽位；队列中止时返回 None
    pub fn acquire_writable(&self) -> Option<MutexGuard<'_, Frame>> {
        let idx = {
            let mut st = self.state.lock();
            while st.size >= self.max_size && !self.pktq.is_aborted() {
                self.cond.wait(&mut st);
            }
            if self.pktq.is_aborted() {
                return None;
            }
            st.windex
        };
        Some(self.slots[idx].lock())
    }

    /// 发布刚写好的槽位
    pub fn publish(&self, slot: MutexGuard<'_, Frame>) {
        drop(slot);
        let mut st = self.state.lock();
        st.windex = (st.windex + 1) % self.max_size;
        st.size += 1;
        self.cond.notify_one();
    }

    /// 等待一个可读帧；队列中止时返回 None
    pub fn acquire_readable(&self) -> Option<MutexGuard<'_, Frame>> {
        let idx = {
            let mut st = self.state.lock();
            while st.size <= st.rindex_shown && !self.pktq.is_aborted() {
                self.cond.wait(&mut st);
            }
            if self.pktq.is_aborted() {
                return None;
            }
            (st.rindex + st.rindex_shown) % self.max_size
        };
        Some(self.slots[idx].lock())
    }

    /// 释放最旧的帧
    ///
    /// 保留模式下，队列变为非空后的第一次调用只把当前帧标记为“已显示”。
    pub fn advance(&self) {
        let idx = {
            let mut st = self.state.lock();
            if self.keep_last && st.rindex_shown == 0 {
                st.rindex_shown = 1;
                return;
            }
            st.rindex
        };
        {
            let mut slot = self.slots[idx].lock();
            slot.payload = FramePayload::Empty;
            slot.meta.uploaded = false;
        }
        let mut st = self.state.lock();
        st.rindex = (st.rindex + 1) % self.max_size;
        st.size -= 1;
        self.cond.notify_one();
    }

    /// 队列占用的槽位数，保留模式下包含已显示的最后一帧
    ///
    /// 保留模式下第一次 `advance` 只做标记，这个值不变。
    pub fn remaining_count(&self) -> usize {
        self.state.lock().size
    }

    /// 尚未显示的帧数
    pub fn remaining(&self) -> usize {
        let st = self.state.lock();
        st.size - st.rindex_shown
    }

    pub fn rindex_shown(&self) -> bool {
        self.state.lock().rindex_shown != 0
    }

    /// 最后显示的帧在源中的字节位置，未知或已过期返回 -1
    pub fn last_position(&self) -> i64 {
        let (idx, shown) = {
            let st = self.state.lock();
            (st.rindex, st.rindex_shown != 0)
        };
        if !shown {
            return -1;
        }
        let meta = self.slots[idx].lock().meta;
        if meta.serial == self.pktq.serial() {
            meta.pos
        } else {
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FramePayload, SubtitleFrame};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn started_pktq() -> Arc<PacketQueue> {
        let q = Arc::new(PacketQueue::new("test"));
        q.start();
        q
    }

    fn push(fq: &FrameQueue, pts: f64, serial: i32, pos: i64) {
        let mut slot = fq.acquire_writable().expect("queue aborted");
        slot.meta = FrameMeta {
            serial,
            pts,
            duration: 0.04,
            pos,
            ..FrameMeta::default()
        };
        slot.payload = FramePayload::Subtitle(SubtitleFrame::default());
        fq.publish(slot);
    }

    #[test]
    fn test_capacity_clamped_to_shared_bound() {
        let fq = FrameQueue::new(started_pktq(), 64, false);
        assert_eq!(fq.capacity(), FRAME_QUEUE_SIZE);
        assert_eq!(FRAME_QUEUE_SIZE, 16);
    }

    #[test]
    fn test_keep_last_first_advance_only_marks_shown() {
        let fq = FrameQueue::new(started_pktq(), VIDEO_PICTURE_QUEUE_SIZE, true);
        push(&fq, 1.0, 1, 10);
        push(&fq, 2.0, 1, 20);
        assert_eq!(fq.remaining(), 2);
        assert_eq!(fq.remaining_count(), 2);

        fq.advance();
        // 只是标记为已显示，槽位没有释放
        assert_eq!(fq.remaining_count(), 2);
        assert_eq!(fq.remaining(), 1);
        assert!(fq.rindex_shown());
        assert_eq!(fq.peek_last_shown().pts, 1.0);
        assert_eq!(fq.peek_current().pts, 2.0);

        fq.advance();
        assert_eq!(fq.remaining(), 0);
        assert_eq!(fq.remaining_count(), 1);
        assert_eq!(fq.peek_last_shown().pts, 2.0);
    }

    #[test]
    fn test_without_keep_last_advance_frees_slot() {
        let fq = FrameQueue::new(started_pktq(), SUBPICTURE_QUEUE_SIZE, false);
        push(&fq, 1.0, 1, -1);
        fq.advance();
        assert_eq!(fq.remaining(), 0);
        assert!(!fq.rindex_shown());
    }

    #[test]
    fn test_last_position_requires_current_serial() {
        let pktq = started_pktq();
        let fq = FrameQueue::new(pktq.clone(), VIDEO_PICTURE_QUEUE_SIZE, true);
        push(&fq, 1.0, pktq.serial(), 4096);
        assert_eq!(fq.last_position(), -1);
        fq.advance();
        assert_eq!(fq.last_position(), 4096);

        pktq.put_flush_marker().unwrap();
        assert_eq!(fq.last_position(), -1);
    }

    #[test]
    fn test_capacity_never_exceeded_under_concurrency() {
        let pktq = started_pktq();
        let fq = Arc::new(FrameQueue::new(pktq, SAMPLE_QUEUE_SIZE, true));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let producer = {
            let fq = fq.clone();
            let max_seen = max_seen.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    push(&fq, i as f64, 1, i);
                    max_seen.fetch_max(fq.remaining_count(), Ordering::SeqCst);
                }
            })
        };

        for expected in 0..500 {
            let slot = fq.acquire_readable().expect("queue aborted");
            assert_eq!(slot.meta.pts, expected as f64);
            drop(slot);
            fq.advance();
            assert!(fq.remaining_count() <= fq.capacity());
        }
        producer.join().unwrap();
        assert!(max_seen.load(Ordering::SeqCst) <= SAMPLE_QUEUE_SIZE);
    }

    #[test]
    fn test_abort_unblocks_writer_on_full_queue() {
        let pktq = started_pktq();
        let fq = Arc::new(FrameQueue::new(pktq.clone(), 2, false));
        push(&fq, 0.0, 1, -1);
        push(&fq, 1.0, 1, -1);

        let writer = {
            let fq = fq.clone();
            thread::spawn(move || fq.acquire_writable().is_none())
        };
        thread::sleep(Duration::from_millis(30));
        pktq.abort();
        fq.signal();
        assert!(writer.join().unwrap());
        assert!(fq.acquire_readable().is_none());
    }
}
