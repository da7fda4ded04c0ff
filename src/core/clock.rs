use crossbeam::atomic::AtomicCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// 超过该差值不再做同步校正，视为时间戳跳变（秒）
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

/// 单调递增的相对时间（秒），所有时钟共用同一个起点
pub fn wall_time() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: f64,          // 时钟基准
    pts_drift: f64,    // 时钟基准减去更新时刻
    last_updated: f64,
    serial: i32,       // 时钟基于该 serial 的数据包
}

/// 播放时钟 - 用于音视频同步
///
/// 锚点（pts、drift、更新时刻、serial）作为一个值原子替换，音频回调线程和刷新线程可以无锁并发读写。
/// 暂停标志和速度由 UI 线程修改，各自单独存放，`set_at` 不会覆盖它们。
/// 绑定到包队列的 serial 后，队列被 flush（seek）时时钟自动失效，`get()` 返回 NaN。
pub struct Clock {
    state: AtomicCell<ClockState>,
    paused: AtomicBool,
    speed: AtomicCell<f64>,
    queue_serial: Option<Arc<AtomicI32>>,
}

impl Clock {
    /// `queue_serial` 为 None 时时钟只和自身的 serial 比较（外部时钟）
    pub fn new(queue_serial: Option<Arc<AtomicI32>>) -> Self {
        let clock = Self {
            state: AtomicCell::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: 0.0,
                serial: -1,
            }),
            paused: AtomicBool::new(false),
            speed: AtomicCell::new(1.0),
            queue_serial,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    pub fn get(&self) -> f64 {
        self.get_at(wall_time())
    }

    /// 在给定时刻外推时钟值
    pub fn get_at(&self, time: f64) -> f64 {
        let s = self.state.load();
        if let Some(queue_serial) = &self.queue_serial {
            if queue_serial.load(Ordering::Acquire) != s.serial {
                return f64::NAN;
            }
        }
        if self.is_paused() {
            s.pts
        } else {
            s.pts_drift + time - (time - s.last_updated) * (1.0 - self.speed())
        }
    }

    pub fn set_at(&self, pts: f64, serial: i32, time: f64) {
        self.state.store(ClockState {
            pts,
            pts_drift: pts - time,
            last_updated: time,
            serial,
        });
    }

    pub fn set(&self, pts: f64, serial: i32) {
        self.set_at(pts, serial, wall_time());
    }

    /// 修改速度前先在当前值重新锚定，避免时钟跳变
    pub fn set_speed(&self, speed: f64) {
        self.set_speed_at(speed, wall_time());
    }

    pub fn set_speed_at(&self, speed: f64, time: f64) {
        let current = self.get_at(time);
        self.set_at(current, self.serial(), time);
        self.speed.store(speed);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn serial(&self) -> i32 {
        self.state.load().serial
    }

    pub fn speed(&self) -> f64 {
        self.speed.load()
    }

    /// 最近一次锚定的 pts（不外推）
    pub fn pts(&self) -> f64 {
        self.state.load().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.state.load().last_updated
    }
}

/// 主时钟偏离从时钟过远（或主时钟未知）时，把主时钟拉到从时钟上
pub fn sync_clock_to_slave(clock: &Clock, slave: &Clock) {
    sync_clock_to_slave_at(clock, slave, wall_time());
}

pub fn sync_clock_to_slave_at(clock: &Clock, slave: &Clock, time: f64) {
    let clock_value = clock.get_at(time);
    let slave_value = slave.get_at(time);
    if !slave_value.is_nan()
        && (clock_value.is_nan() || (clock_value - slave_value).abs() > AV_NOSYNC_THRESHOLD)
    {
        clock.set_at(slave_value, slave.serial(), time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_clock() -> (Clock, Arc<AtomicI32>) {
        let serial = Arc::new(AtomicI32::new(1));
        (Clock::new(Some(serial.clone())), serial)
    }

    #[test]
    fn test_clock_stale_serial_returns_nan() {
        let (clock, serial) = bound_clock();
        assert!(clock.get_at(5.0).is_nan());

        clock.set_at(2.0, 1, 5.0);
        assert!((clock.get_at(5.0) - 2.0).abs() < 1e-9);

        serial.store(2, Ordering::SeqCst);
        assert!(clock.get_at(5.0).is_nan());

        clock.set_at(7.0, 2, 6.0);
        assert!((clock.get_at(6.0) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_extrapolates_with_speed() {
        let (clock, _) = bound_clock();
        clock.set_at(10.0, 1, 100.0);
        assert!((clock.get_at(101.0) - 11.0).abs() < 1e-9);

        clock.set_speed_at(0.5, 101.0);
        // 重新锚定后不跳变
        assert!((clock.get_at(101.0) - 11.0).abs() < 1e-9);
        assert!((clock.get_at(103.0) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_paused_clock_holds_value() {
        let (clock, _) = bound_clock();
        clock.set_at(3.0, 1, 10.0);
        clock.set_paused(true);
        assert_eq!(clock.get_at(50.0), 3.0);
        clock.set_paused(false);
        assert!((clock.get_at(11.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_anchor_updates_never_undo_pause_or_speed() {
        let (clock, _) = bound_clock();
        let clock = Arc::new(clock);
        let done = Arc::new(AtomicBool::new(false));

        // 模拟音频回调线程不停地重新锚定
        let writer = {
            let clock = clock.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut t = 0.0;
                while !done.load(Ordering::Acquire) {
                    clock.set_at(t, 1, t);
                    t += 0.001;
                }
            })
        };

        for i in 0..2000 {
            let paused = i % 2 == 0;
            clock.set_paused(paused);
            clock.set_speed_at(if paused { 0.9 } else { 1.01 }, 0.0);
            assert_eq!(clock.is_paused(), paused);
            assert_eq!(clock.speed(), if paused { 0.9 } else { 1.01 });
        }
        done.store(true, Ordering::Release);
        writer.join().unwrap();

        clock.set_paused(true);
        clock.set_at(3.0, 1, 10.0);
        assert!(clock.is_paused());
        assert_eq!(clock.get_at(20.0), 3.0);
    }

    #[test]
    fn test_sync_to_slave_only_on_discontinuity() {
        let external = Clock::new(None);
        let (audio, _) = bound_clock();
        audio.set_at(20.0, 1, 0.0);

        // 外部时钟未知：直接对齐
        sync_clock_to_slave_at(&external, &audio, 0.0);
        assert!((external.get_at(0.0) - 20.0).abs() < 1e-9);
        assert_eq!(external.serial(), 1);

        // 小偏差保持不动
        external.set_at(21.0, 1, 0.0);
        sync_clock_to_slave_at(&external, &audio, 0.0);
        assert!((external.get_at(0.0) - 21.0).abs() < 1e-9);

        // 超过 10 秒：重新对齐
        external.set_at(40.0, 1, 0.0);
        sync_clock_to_slave_at(&external, &audio, 0.0);
        assert!((external.get_at(0.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_self_bound_clock_never_stale() {
        let clock = Clock::new(None);
        clock.set_at(1.0, 42, 0.0);
        assert!((clock.get_at(0.5) - 1.5).abs() < 1e-9);
    }
}
