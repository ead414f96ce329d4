//! Shared scaffolding for the end-to-end scenario tests: a trivial `ObjectState` payload, and two
//! `Executor` implementations (immediate, and a small thread pool) covering the deterministic and
//! concurrent test shapes. Not a test binary itself — included with `mod support;`, mirroring
//! `peregrine/tests/util.rs`'s role in the teacher lineage.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use osprey::{Executor, Runnable};

/// A payload simple enough to eyeball in assertions: a named tag plus an integer counter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    pub tag: &'static str,
    pub value: i64,
}

impl Payload {
    pub fn new(tag: &'static str, value: i64) -> Self {
        Payload { tag, value }
    }
}

/// Runs every submitted task on a small fixed pool of worker threads, in submission order per
/// worker but with no ordering guarantee across workers. Used by the scenarios that need genuine
/// concurrency (the mutual-dependency and conflict-retry cases).
pub struct ThreadPoolExecutor {
    sender: mpsc::Sender<Runnable>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    pub fn new(workers: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Runnable>();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let receiver = receiver.clone();
            handles.push(thread::spawn(move || {
                loop {
                    let task = {
                        let guard = receiver.lock().unwrap();
                        guard.recv()
                    };
                    match task {
                        Ok(task) => task(),
                        Err(_) => break,
                    }
                }
            }));
        }
        Arc::new(ThreadPoolExecutor {
            sender,
            _workers: handles,
        })
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Runnable) {
        let _ = self.sender.send(task);
    }
}
