use crate::core::{PlayerError, Result};
use crate::player::demuxer_source::MediaPacket;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 队列中的一个单元
#[derive(Debug, Clone)]
pub enum Packet {
    /// 普通压缩数据
    Data(MediaPacket),
    /// 流结束哨兵：解码器收到后进入排空（drain）状态
    Null { stream_index: usize },
    /// flush 标记：serial 加一，解码器收到后重置
    Flush,
}

impl Packet {
    fn size(&self) -> usize {
        match self {
            Packet::Data(pkt) => pkt.size(),
            _ => 0,
        }
    }

    fn duration(&self) -> i64 {
        match self {
            Packet::Data(pkt) => pkt.duration,
            _ => 0,
        }
    }
}

/// `get` 的结果
#[derive(Debug)]
pub enum PacketGet {
    Packet { packet: Packet, serial: i32 },
    Empty,
    Aborted,
}

struct Entry {
    packet: Packet,
    serial: i32,
}

struct Inner {
    entries: VecDeque<Entry>,
    size: usize,
    duration: i64,
    abort_request: bool,
    serial: i32,
}

/// 包队列的统计快照（读取线程用于流控）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketQueueStats {
    pub nb_packets: usize,
    pub size: usize,
    pub duration: i64,
}

/// 带 serial 的线程安全包队列
///
/// 每条基本流一个。serial 只在放入 flush 标记时递增，
/// 消费者丢弃 serial 与队列当前 serial 不一致的旧数据（seek 之前的数据）。
pub struct PacketQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    cond: Condvar,
    /// serial 的镜像，供时钟无锁判断是否过期
    serial: Arc<AtomicI32>,
    aborted: AtomicBool,
}

impl PacketQueue {
    /// 新建的队列处于中止状态，`start()` 之后才可用
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                size: 0,
                duration: 0,
                abort_request: true,
                serial: 0,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicI32::new(0)),
            aborted: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn put_locked(&self, inner: &mut Inner, packet: Packet) -> Result<()> {
        if inner.abort_request {
            return Err(PlayerError::Aborted);
        }
        if matches!(packet, Packet::Flush) {
            inner.serial += 1;
            self.serial.store(inner.serial, Ordering::Release);
        }
        inner.size += packet.size() + mem::size_of::<Entry>();
        inner.duration += packet.duration();
        inner.entries.push_back(Entry {
            packet,
            serial: inner.serial,
        });
        self.cond.notify_one();
        Ok(())
    }

    /// 放入一个数据包，队列中止后失败
    pub fn put(&self, packet: MediaPacket) -> Result<()> {
        let mut inner = self.inner.lock();
        self.put_locked(&mut inner, Packet::Data(packet))
    }

    /// 放入 flush 标记，serial 加一
    pub fn put_flush_marker(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.put_locked(&mut inner, Packet::Flush)
    }

    /// 放入流结束哨兵
    pub fn put_null(&self, stream_index: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        self.put_locked(&mut inner, Packet::Null { stream_index })
    }

    /// 取出最早的单元；`block` 为 true 时等待直到有数据或中止
    pub fn get(&self, block: bool) -> PacketGet {
        let mut inner = self.inner.lock();
        loop {
            if inner.abort_request {
                return PacketGet::Aborted;
            }
            if let Some(entry) = inner.entries.pop_front() {
                inner.size -= entry.packet.size() + mem::size_of::<Entry>();
                inner.duration -= entry.packet.duration();
                return PacketGet::Packet {
                    packet: entry.packet,
                    serial: entry.serial,
                };
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// 丢弃所有排队的单元，不改变 serial
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size = 0;
        inner.duration = 0;
    }

    /// 中止队列并唤醒所有等待者，可重复调用
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.abort_request = true;
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// 清除中止标志并放入初始 flush 标记
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.abort_request = false;
        self.aborted.store(false, Ordering::Release);
        // 刚清除中止标志，放入不会失败
        let _ = self.put_locked(&mut inner, Packet::Flush);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn serial(&self) -> i32 {
        self.serial.load(Ordering::Acquire)
    }

    /// 时钟绑定用的 serial 句柄
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        self.serial.clone()
    }

    pub fn stats(&self) -> PacketQueueStats {
        let inner = self.inner.lock();
        PacketQueueStats {
            nb_packets: inner.entries.len(),
            size: inner.size,
            duration: inner.duration,
        }
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }
}

/// 读取线程的“可以继续读”信号
///
/// 读取线程因缓冲已满或到达 EOF 而等待时挂在这里，解码线程发现包队列空了就唤醒它。
#[derive(Default)]
pub struct ContinueReadSignal {
    lock: Mutex<bool>,
    cond: Condvar,
}

impl ContinueReadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut pending = self.lock.lock();
        *pending = true;
        self.cond.notify_all();
    }

    /// 最多等待 `timeout`，被唤醒返回 true
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.lock.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        mem::replace(&mut *pending, false)
    }
}
