//! Spawns one `EventLoop` per OS thread and hands callers a pointer to it
//! once it is actually running, plus the pool that hands worker loops out
//! round-robin or by hash.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::event_loop::EventLoop;

type InitCallback = Box<dyn FnOnce(&Arc<EventLoop>) + Send + 'static>;

/// Owns one worker thread running exactly one `EventLoop`.
pub struct EventLoopThread {
    shared: Arc<(Mutex<Option<Arc<EventLoop>>>, Condvar)>,
    init_callback: Mutex<Option<InitCallback>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopThread {
    pub fn new() -> Self {
        EventLoopThread {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
            init_callback: Mutex::new(None),
            join_handle: Mutex::new(None),
        }
    }

    pub fn with_init(init: impl FnOnce(&Arc<EventLoop>) + Send + 'static) -> Self {
        let thread = Self::new();
        *thread.init_callback.lock().unwrap() = Some(Box::new(init));
        thread
    }

    /// Spawns the worker thread (if not already spawned) and blocks until
    /// its loop has been constructed, returning a pointer to it.
    pub fn start_loop(&self) -> Arc<EventLoop> {
        let mut handle_slot = self.join_handle.lock().unwrap();
        if handle_slot.is_none() {
            let shared = self.shared.clone();
            let init = self.init_callback.lock().unwrap().take();

            let join = std::thread::Builder::new()
                .name("reactor-worker".into())
                .spawn(move || {
                    let loop_ = EventLoop::new();
                    if let Some(init) = init {
                        init(&loop_);
                    }
                    {
                        let (lock, cvar) = &*shared;
                        let mut published = lock.lock().unwrap();
                        *published = Some(loop_.clone());
                        cvar.notify_one();
                    }
                    loop_.run();
                })
                .expect("failed to spawn event loop thread");
            *handle_slot = Some(join);
        }
        drop(handle_slot);

        let (lock, cvar) = &*self.shared;
        let mut published = lock.lock().unwrap();
        while published.is_none() {
            published = cvar.wait(published).unwrap();
        }
        published.clone().unwrap()
    }
}

impl Default for EventLoopThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let loop_ = self.shared.0.lock().unwrap().clone();
        if let Some(loop_) = loop_ {
            loop_.quit();
        }
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Hands out worker loops round-robin (`next_loop`) or by hash
/// (`loop_for_hash`), falling back to the base loop when the pool has zero
/// workers.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    threads: Vec<EventLoopThread>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, num_threads: usize) -> Self {
        let threads = (0..num_threads).map(|_| EventLoopThread::new()).collect();
        EventLoopThreadPool {
            base_loop,
            threads,
            loops: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) {
        let mut loops = self.loops.lock().unwrap();
        if !loops.is_empty() {
            return;
        }
        for thread in &self.threads {
            loops.push(thread.start_loop());
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Round-robin over the worker set; falls back to the base loop when
    /// the pool has zero workers.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % loops.len();
        loops[i].clone()
    }

    /// Always routes the same hash to the same worker loop; falls back to
    /// the base loop when the pool has zero workers.
    pub fn loop_for_hash(&self, hash: usize) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        loops[hash % loops.len()].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_falls_back_to_base_loop() {
        let base = EventLoop::new();
        let pool = EventLoopThreadPool::new(base.clone(), 0);
        pool.start();
        assert!(Arc::ptr_eq(&pool.next_loop(), &base));
        assert!(Arc::ptr_eq(&pool.loop_for_hash(42), &base));
    }

    #[test]
    fn round_robin_cycles_evenly_over_n_workers() {
        let base = EventLoop::new();
        let pool = EventLoopThreadPool::new(base, 3);
        pool.start();

        let mut counts = std::collections::HashMap::new();
        let mut seen = Vec::new();
        for _ in 0..9 {
            let l = pool.next_loop();
            let ptr = Arc::as_ptr(&l);
            *counts.entry(ptr).or_insert(0) += 1;
            seen.push(ptr);
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 3);
        }
        // Cycle is [w0, w1, w2, w0, w1, w2, w0, w1, w2].
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[3], seen[6]);
        assert_eq!(seen[1], seen[4]);
        assert_eq!(seen[4], seen[7]);
    }

    #[test]
    fn same_hash_always_routes_to_same_loop() {
        let base = EventLoop::new();
        let pool = EventLoopThreadPool::new(base, 4);
        pool.start();

        let a = pool.loop_for_hash(7);
        let b = pool.loop_for_hash(7);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
