// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

//! The work-stealing execution substrate: a fixed pool of worker threads,
//! each with a private deque plus a shared external queue. Workers poll their
//! own queues, then steal from a random victim, then back off in stages.

use std::{
	cell::RefCell,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Condvar, Mutex,
	},
	thread::JoinHandle,
	time::Duration,
};

use crossbeam::deque::{Injector, Steal, Stealer, Worker as WorkerDeque};
use rand::Rng;
use tracing::{debug, info};

/// What a resumable reports back to the worker that ran it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResumeResult {
	/// Finished for good; the worker drops its reference.
	Done,
	/// Voluntarily yielded. The resumable re-enqueues itself when it has
	/// work again; the worker does not hold on to it.
	ResumeLater,
	/// The worker executing this resumable must shut down.
	ShutdownWorker,
}

/// The scheduler-facing interface: anything a worker can run until it
/// voluntarily yields. Actors and the shutdown sentinel both implement it.
pub trait Resumable: Send + Sync + 'static {
	fn resume(&self) -> ResumeResult;
}

/// Number of idle polls during which a worker spins without sleeping.
const AGGRESSIVE_POLLS: u64 = 100;
/// Idle-poll bound of the moderate stage (short sleeps between polls).
const MODERATE_POLLS: u64 = 500;
const AGGRESSIVE_STEAL_INTERVAL: u64 = 10;
const MODERATE_STEAL_INTERVAL: u64 = 5;
const MODERATE_SLEEP: Duration = Duration::from_micros(50);
const RELAXED_SLEEP: Duration = Duration::from_millis(1);
/// Bounded attempts per steal round; spurious failures are expected.
const STEAL_ATTEMPTS: usize = 3;

struct WorkerHandle {
	/// Shared queue: the entry point for work coming from outside the pool.
	injector: Injector<Arc<dyn Resumable>>,
	/// Steal handle over the worker's private deque.
	stealer: Stealer<Arc<dyn Resumable>>,
	sleep_lock: Mutex<()>,
	wakeup: Condvar,
}

struct SchedulerInner {
	workers: Vec<WorkerHandle>,
	next_external: AtomicUsize,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

struct LocalWorker {
	scheduler_id: usize,
	deque: WorkerDeque<Arc<dyn Resumable>>,
}

thread_local! {
	static LOCAL_WORKER: RefCell<Option<LocalWorker>> = const { RefCell::new(None) };
}

/// Handle to the worker pool. Cloneable; the pool stops when
/// [`SchedulerClient::shutdown`] runs.
#[derive(Clone)]
pub struct SchedulerClient {
	inner: Arc<SchedulerInner>,
}

pub(crate) fn start_scheduler(num_workers: usize) -> SchedulerClient {
	assert!(num_workers > 0, "the scheduler needs at least one worker");
	let mut deques = Vec::with_capacity(num_workers);
	let mut workers = Vec::with_capacity(num_workers);
	for _ in 0..num_workers {
		let deque = WorkerDeque::new_fifo();
		workers.push(WorkerHandle {
			injector: Injector::new(),
			stealer: deque.stealer(),
			sleep_lock: Mutex::new(()),
			wakeup: Condvar::new(),
		});
		deques.push(deque);
	}
	let inner = Arc::new(SchedulerInner {
		workers,
		next_external: AtomicUsize::new(0),
		threads: Mutex::new(Vec::new()),
	});
	let scheduler_id = Arc::as_ptr(&inner) as usize;
	let mut threads = Vec::with_capacity(num_workers);
	for (index, deque) in deques.into_iter().enumerate() {
		let inner_clone = inner.clone();
		let thread = std::thread::Builder::new()
			.name(format!("troupe-worker-{index}"))
			.spawn(move || {
				LOCAL_WORKER.with(|slot| {
					*slot.borrow_mut() = Some(LocalWorker { scheduler_id, deque });
				});
				worker_loop(&inner_clone, index);
				LOCAL_WORKER.with(|slot| slot.borrow_mut().take());
			})
			.expect("failed to spawn a scheduler worker thread");
		threads.push(thread);
	}
	*inner.threads.lock().unwrap() = threads;
	info!(num_workers, "scheduler-started");
	SchedulerClient { inner }
}

impl SchedulerClient {
	pub fn num_workers(&self) -> usize {
		self.inner.workers.len()
	}

	/// Enqueues a resumable.
	///
	/// From a worker thread of this pool, the resumable lands on the
	/// worker's own deque; from anywhere else it is round-robined across the
	/// workers' external queues.
	pub fn enqueue(&self, resumable: Arc<dyn Resumable>) {
		let scheduler_id = Arc::as_ptr(&self.inner) as usize;
		let not_taken = LOCAL_WORKER.with(|slot| {
			let slot = slot.borrow();
			match slot.as_ref() {
				Some(local) if local.scheduler_id == scheduler_id => {
					local.deque.push(resumable);
					None
				},
				_ => Some(resumable),
			}
		});
		let Some(resumable) = not_taken else {
			return;
		};
		let index =
			self.inner.next_external.fetch_add(1, Ordering::Relaxed) % self.inner.workers.len();
		let handle = &self.inner.workers[index];
		handle.injector.push(resumable);
		handle.wakeup.notify_one();
	}

	/// Schedules a side-runnable, e.g. a continuation completed outside the
	/// pool. Alias for [`SchedulerClient::enqueue`].
	pub fn exec_later(&self, resumable: Arc<dyn Resumable>) {
		self.enqueue(resumable);
	}

	/// Targets a specific worker's external queue, bypassing the round-robin.
	/// The index wraps around the pool size.
	pub fn enqueue_on(&self, worker: usize, resumable: Arc<dyn Resumable>) {
		let handle = &self.inner.workers[worker % self.inner.workers.len()];
		handle.injector.push(resumable);
		handle.wakeup.notify_one();
	}

	/// Stops every worker by handing each its shutdown sentinel, then joins
	/// them one by one.
	pub fn shutdown(&self) {
		for handle in &self.inner.workers {
			handle.injector.push(Arc::new(ShutdownSentinel));
			handle.wakeup.notify_one();
		}
		let threads: Vec<JoinHandle<()>> =
			self.inner.threads.lock().unwrap().drain(..).collect();
		for thread in threads {
			let _ = thread.join();
		}
		info!("scheduler-stopped");
	}
}

/// Flips the executing worker into shutdown.
struct ShutdownSentinel;

impl Resumable for ShutdownSentinel {
	fn resume(&self) -> ResumeResult {
		ResumeResult::ShutdownWorker
	}
}

fn worker_loop(inner: &Arc<SchedulerInner>, index: usize) {
	let mut rng = rand::thread_rng();
	let mut idle_polls: u64 = 0;
	debug!(worker = index, "worker-started");
	loop {
		let task = pop_local()
			.or_else(|| pop_injector(&inner.workers[index].injector))
			.or_else(|| {
				if should_steal(idle_polls) {
					steal_from_victim(inner, index, &mut rng)
				} else {
					None
				}
			});
		match task {
			Some(resumable) => {
				idle_polls = 0;
				match resumable.resume() {
					ResumeResult::Done | ResumeResult::ResumeLater => {},
					ResumeResult::ShutdownWorker => break,
				}
			},
			None => {
				idle_polls += 1;
				back_off(&inner.workers[index], idle_polls);
			},
		}
	}
	// Whatever is still queued here is dropped; the coordinator only shuts
	// the pool down once the actors are gone.
	while pop_local().is_some() {}
	while pop_injector(&inner.workers[index].injector).is_some() {}
	debug!(worker = index, "worker-stopped");
}

fn pop_local() -> Option<Arc<dyn Resumable>> {
	LOCAL_WORKER.with(|slot| slot.borrow().as_ref().and_then(|local| local.deque.pop()))
}

fn pop_injector(injector: &Injector<Arc<dyn Resumable>>) -> Option<Arc<dyn Resumable>> {
	loop {
		match injector.steal() {
			Steal::Success(task) => return Some(task),
			Steal::Empty => return None,
			Steal::Retry => continue,
		}
	}
}

fn should_steal(idle_polls: u64) -> bool {
	if idle_polls < AGGRESSIVE_POLLS {
		idle_polls % AGGRESSIVE_STEAL_INTERVAL == 0
	} else if idle_polls < MODERATE_POLLS {
		idle_polls % MODERATE_STEAL_INTERVAL == 0
	} else {
		true
	}
}

/// Picks a random other worker and tries to pop from the tail of its deque.
/// Spurious failures are fine; the caller just polls again.
fn steal_from_victim(
	inner: &Arc<SchedulerInner>,
	thief: usize,
	rng: &mut impl Rng,
) -> Option<Arc<dyn Resumable>> {
	let num_workers = inner.workers.len();
	if num_workers < 2 {
		return None;
	}
	for _ in 0..STEAL_ATTEMPTS {
		let victim = rng.gen_range(0..num_workers);
		if victim == thief {
			continue;
		}
		if let Steal::Success(task) = inner.workers[victim].stealer.steal() {
			return Some(task);
		}
	}
	None
}

fn back_off(handle: &WorkerHandle, idle_polls: u64) {
	if idle_polls < AGGRESSIVE_POLLS {
		std::hint::spin_loop();
	} else if idle_polls < MODERATE_POLLS {
		std::thread::sleep(MODERATE_SLEEP);
	} else {
		let guard = handle.sleep_lock.lock().unwrap();
		let _ = handle.wakeup.wait_timeout(guard, RELAXED_SLEEP).unwrap();
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::{Duration, Instant},
	};

	use super::*;

	struct CountDown {
		counter: Arc<AtomicUsize>,
	}

	impl Resumable for CountDown {
		fn resume(&self) -> ResumeResult {
			self.counter.fetch_add(1, Ordering::SeqCst);
			ResumeResult::Done
		}
	}

	fn await_count(counter: &AtomicUsize, expected: usize) {
		let deadline = Instant::now() + Duration::from_secs(5);
		while counter.load(Ordering::SeqCst) < expected {
			assert!(Instant::now() < deadline, "worker pool did not drain in time");
			std::thread::sleep(Duration::from_millis(1));
		}
	}

	#[test]
	fn test_external_enqueues_run_on_all_workers() {
		let scheduler = start_scheduler(4);
		assert_eq!(scheduler.num_workers(), 4);
		let counter = Arc::new(AtomicUsize::new(0));
		for _ in 0..1000 {
			scheduler.enqueue(Arc::new(CountDown { counter: counter.clone() }));
		}
		await_count(&counter, 1000);
		scheduler.shutdown();
		assert_eq!(counter.load(Ordering::SeqCst), 1000);
	}

	struct FanOut {
		scheduler: SchedulerClient,
		counter: Arc<AtomicUsize>,
		remaining: usize,
	}

	impl Resumable for FanOut {
		fn resume(&self) -> ResumeResult {
			// Children enqueued from a worker thread land on its private
			// deque; idle workers have to steal them.
			for _ in 0..self.remaining {
				self.scheduler
					.enqueue(Arc::new(CountDown { counter: self.counter.clone() }));
			}
			self.counter.fetch_add(1, Ordering::SeqCst);
			ResumeResult::Done
		}
	}

	#[test]
	fn test_internal_enqueue_is_stealable() {
		let scheduler = start_scheduler(4);
		let counter = Arc::new(AtomicUsize::new(0));
		scheduler.enqueue(Arc::new(FanOut {
			scheduler: scheduler.clone(),
			counter: counter.clone(),
			remaining: 500,
		}));
		await_count(&counter, 501);
		scheduler.shutdown();
	}

	#[test]
	fn test_shutdown_stops_every_worker() {
		let scheduler = start_scheduler(2);
		scheduler.shutdown();
		assert!(scheduler.inner.threads.lock().unwrap().is_empty());
	}
}
