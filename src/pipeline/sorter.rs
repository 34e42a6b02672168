//! Background depth sorter
//!
//! A single worker thread keeps a back-to-front permutation of the splat map
//! for the current camera. The worker only reads the map through a
//! [`SortSource`] snapshot and publishes finished orders to a [`SortBuffer`]
//! guarded by its own lock, so rendering never waits for a sort.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use glam::{Mat4, Vec3};
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::SorterParams;
use crate::core::camera::{camera_forward, camera_position, eye_depth};

/// Identity of the map state and camera a sort was computed for
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortStamp {
    /// Store lifetime; bumped when the map is cleared or replaced
    pub epoch: u64,
    /// Mutation counter within an epoch
    pub version: u64,
    /// Effective view (camera view times anchor)
    pub view: Mat4,
    pub splat_count: usize,
}

/// Positions copied out of the map for one sort
#[derive(Debug, Clone)]
pub struct SortSnapshot {
    pub stamp: SortStamp,
    pub positions: Vec<Vec3>,
}

/// Read access the sorter needs from the map owner
pub trait SortSource: Send + Sync + 'static {
    /// Current stamp, or `None` while no camera is known
    fn stamp(&self) -> Option<SortStamp>;

    /// Copy positions and stamp out of the map
    fn snapshot(&self) -> Option<SortSnapshot>;
}

/// A published back-to-front permutation
#[derive(Debug, Clone)]
pub struct SortOrder {
    /// Store slots ordered farthest first
    pub indices: Vec<u32>,
    pub stamp: SortStamp,
    pub sorted_at: Instant,
}

impl SortOrder {
    pub fn epoch(&self) -> u64 {
        self.stamp.epoch
    }

    pub fn version(&self) -> u64 {
        self.stamp.version
    }

    /// Number of splats the permutation covers
    pub fn splat_count(&self) -> usize {
        self.stamp.splat_count
    }
}

/// Front/back hand-off between the sorter and the renderer.
///
/// The sorter fills its back buffer without holding any lock and swaps it in
/// here; readers clone the `Arc` of the front order.
#[derive(Debug, Default)]
pub struct SortBuffer {
    front: Mutex<Option<Arc<SortOrder>>>,
    published: AtomicU64,
}

impl SortBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, order: SortOrder) {
        let order = Arc::new(order);
        *self.front.lock() = Some(order);
        self.published.fetch_add(1, Ordering::Release);
    }

    /// Newest published order
    pub fn latest(&self) -> Option<Arc<SortOrder>> {
        self.front.lock().clone()
    }

    /// Number of orders published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

/// Permutation of `positions` by descending eye depth under `view`
pub fn sort_back_to_front(positions: &[Vec3], view: &Mat4, parallel_threshold: usize) -> Vec<u32> {
    let depths: Vec<f32> = positions.iter().map(|&p| eye_depth(view, p)).collect();
    let mut indices: Vec<u32> = (0..positions.len() as u32).collect();

    let farther_first = |a: &u32, b: &u32| depths[*b as usize].total_cmp(&depths[*a as usize]);
    if positions.len() > parallel_threshold {
        indices.par_sort_unstable_by(farther_first);
    } else {
        indices.sort_unstable_by(farther_first);
    }
    indices
}

/// Whether `current` differs enough from the last sorted state to sort again
pub fn needs_resort(last: Option<&SortStamp>, current: &SortStamp, params: &SorterParams) -> bool {
    let Some(last) = last else {
        return true;
    };
    if last.epoch != current.epoch || last.version != current.version || last.splat_count != current.splat_count {
        return true;
    }

    let moved = camera_position(&last.view).distance(camera_position(&current.view));
    if moved > params.resort_translation {
        return true;
    }
    camera_forward(&last.view).dot(camera_forward(&current.view)) < params.resort_min_cos
}

/// Handle to the sorter thread. Dropping it stops and joins the thread.
pub struct BackgroundSorter {
    wake_tx: Sender<()>,
    stop_flag: Arc<AtomicBool>,
    buffer: Arc<SortBuffer>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BackgroundSorter {
    /// Start the worker thread reading from `source`
    pub fn spawn<S: SortSource>(source: Arc<S>, params: SorterParams) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(SortBuffer::new());

        let worker = {
            let stop_flag = Arc::clone(&stop_flag);
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || sorter_thread_main(source, buffer, wake_rx, stop_flag, params))
        };

        info!("Background sorter started");
        Self {
            wake_tx,
            stop_flag,
            buffer,
            worker: Some(worker),
        }
    }

    /// Ask for a sort. Returns `false` when a request is already pending.
    pub fn request_sort(&self) -> bool {
        match self.wake_tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn buffer(&self) -> &Arc<SortBuffer> {
        &self.buffer
    }

    pub fn latest(&self) -> Option<Arc<SortOrder>> {
        self.buffer.latest()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            info!("Background sorter stopped");
        }
    }
}

impl Drop for BackgroundSorter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sorter_thread_main<S: SortSource>(
    source: Arc<S>,
    buffer: Arc<SortBuffer>,
    wake_rx: Receiver<()>,
    stop_flag: Arc<AtomicBool>,
    params: SorterParams,
) {
    let poll = Duration::from_millis(params.poll_interval_ms.max(1));
    let mut last: Option<SortStamp> = None;

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        match wake_rx.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        let Some(stamp) = source.stamp() else {
            continue;
        };
        if !needs_resort(last.as_ref(), &stamp, &params) {
            continue;
        }
        let Some(snapshot) = source.snapshot() else {
            continue;
        };

        let started = Instant::now();
        let indices = sort_back_to_front(&snapshot.positions, &snapshot.stamp.view, params.parallel_threshold);
        debug!(
            "Sorted {} splats in {:.2} ms (epoch {}, version {})",
            indices.len(),
            started.elapsed().as_secs_f64() * 1000.0,
            snapshot.stamp.epoch,
            snapshot.stamp.version
        );

        last = Some(snapshot.stamp);
        buffer.publish(SortOrder {
            indices,
            stamp: snapshot.stamp,
            sorted_at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn stamp(version: u64, view: Mat4) -> SortStamp {
        SortStamp {
            epoch: 0,
            version,
            view,
            splat_count: 3,
        }
    }

    #[test]
    fn test_sort_back_to_front() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let positions = vec![
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, -3.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 4.0),
        ];

        let order = sort_back_to_front(&positions, &view, usize::MAX);
        assert_eq!(order, vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_parallel_sort_matches_serial() {
        let view = Mat4::look_at_rh(Vec3::new(0.3, 1.0, 4.0), Vec3::ZERO, Vec3::Y);
        let positions: Vec<Vec3> = (0..2000)
            .map(|i| {
                let t = i as f32 * 0.37;
                Vec3::new(t.sin() * 2.0, (t * 0.5).cos(), (t * 1.3).sin() * 3.0)
            })
            .collect();

        let order = sort_back_to_front(&positions, &view, 100);
        assert_eq!(order.len(), positions.len());
        for pair in order.windows(2) {
            let a = eye_depth(&view, positions[pair[0] as usize]);
            let b = eye_depth(&view, positions[pair[1] as usize]);
            assert!(a >= b);
        }
    }

    #[test]
    fn test_needs_resort() {
        let params = SorterParams::default();
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let last = stamp(1, view);

        assert!(needs_resort(None, &last, &params));
        assert!(!needs_resort(Some(&last), &last, &params));
        assert!(needs_resort(Some(&last), &stamp(2, view), &params));

        let nudged = Mat4::look_at_rh(Vec3::new(0.01, 0.0, 5.0), Vec3::new(0.01, 0.0, 0.0), Vec3::Y);
        assert!(!needs_resort(Some(&last), &stamp(1, nudged), &params));

        let moved = Mat4::look_at_rh(Vec3::new(1.0, 0.0, 5.0), Vec3::new(1.0, 0.0, 0.0), Vec3::Y);
        assert!(needs_resort(Some(&last), &stamp(1, moved), &params));

        let turned = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::new(3.0, 0.0, 0.0), Vec3::Y);
        assert!(needs_resort(Some(&last), &stamp(1, turned), &params));
    }

    struct FixedSource {
        positions: Vec<Vec3>,
        view: Mat4,
    }

    impl SortSource for FixedSource {
        fn stamp(&self) -> Option<SortStamp> {
            Some(SortStamp {
                epoch: 0,
                version: 1,
                view: self.view,
                splat_count: self.positions.len(),
            })
        }

        fn snapshot(&self) -> Option<SortSnapshot> {
            Some(SortSnapshot {
                stamp: self.stamp()?,
                positions: self.positions.clone(),
            })
        }
    }

    #[test]
    fn test_sorter_publishes_order() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let source = Arc::new(FixedSource {
            positions: (0..50).map(|i| Vec3::new(0.0, 0.0, i as f32 * -0.1)).collect(),
            view,
        });
        let mut sorter = BackgroundSorter::spawn(source.clone(), SorterParams::default());
        sorter.request_sort();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sorter.latest().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let order = sorter.latest().unwrap();
        assert_eq!(order.splat_count(), 50);
        assert_eq!(order.indices[0], 49);
        assert_eq!(order.indices[49], 0);

        // Unchanged state and camera: later wakes publish nothing new
        let published = sorter.buffer().published();
        sorter.request_sort();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(sorter.buffer().published(), published);

        sorter.stop();
        assert!(!sorter.is_running());
    }

    /// Blocks inside `stamp` until released, to hold the worker mid-cycle
    struct GatedSource {
        calls: AtomicUsize,
        entered_tx: Sender<()>,
        release_rx: Receiver<()>,
    }

    impl SortSource for GatedSource {
        fn stamp(&self) -> Option<SortStamp> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered_tx.send(());
            let _ = self.release_rx.recv();
            None
        }

        fn snapshot(&self) -> Option<SortSnapshot> {
            None
        }
    }

    #[test]
    fn test_requests_coalesce_while_busy() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let source = Arc::new(GatedSource {
            calls: AtomicUsize::new(0),
            entered_tx,
            release_rx,
        });
        let params = SorterParams {
            poll_interval_ms: 60_000,
            ..Default::default()
        };
        let mut sorter = BackgroundSorter::spawn(source.clone(), params);

        assert!(sorter.request_sort());
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Worker is busy: one request queues, the rest coalesce
        assert!(sorter.request_sort());
        assert!(!sorter.request_sort());
        assert!(!sorter.request_sort());

        release_tx.send(()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        drop(release_tx);
        sorter.stop();
        assert!(!sorter.is_running());
    }
}
