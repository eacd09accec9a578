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

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Mutex,
};

use tracing::{debug, info};

use crate::{
	actor::{Actor, ActorAddr, ActorRef, ExitReason, FnActor},
	actor_cell::{ActorCell, SchedulePolicy},
	actor_context::ActorContext,
	behavior::Behavior,
	blocking::{BlockingActor, ScopedActor},
	printer::Printer,
	registry::Registry,
	resume::run_detached,
	scheduler::{start_scheduler, Resumable, SchedulerClient},
	timer::{start_timer, TimerClient},
	worker_threads_from_env_or_default,
};

/// Options of a spawn call.
///
/// The blocking receive API is its own entry point
/// ([`Troupe::spawn_blocking`]) because the actor is a thread body rather
/// than an [`Actor`] implementation; it always runs detached.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpawnOptions {
	/// Atomically link the new actor to the spawning actor.
	pub(crate) linked: bool,
	/// Atomically install a monitor from the spawner on the new actor.
	pub(crate) monitored: bool,
	/// Run on a dedicated thread instead of the worker pool.
	pub(crate) detached: bool,
	/// Do not count toward [`Troupe::await_all_actors_done`].
	pub(crate) hidden: bool,
	/// Give the mailbox two priority levels instead of one.
	pub(crate) priority_aware: bool,
}

impl SpawnOptions {
	pub fn new() -> SpawnOptions {
		SpawnOptions::default()
	}

	pub fn linked(mut self) -> Self {
		self.linked = true;
		self
	}

	pub fn monitored(mut self) -> Self {
		self.monitored = true;
		self
	}

	pub fn detached(mut self) -> Self {
		self.detached = true;
		self
	}

	pub fn hidden(mut self) -> Self {
		self.hidden = true;
		self
	}

	pub fn priority_aware(mut self) -> Self {
		self.priority_aware = true;
		self
	}
}

struct TroupeInner {
	scheduler: SchedulerClient,
	registry: Registry,
	/// Internal service actors, installed right after construction and
	/// released by shutdown.
	timer: Mutex<Option<TimerClient>>,
	printer: Mutex<Option<ActorRef>>,
	shut_down: AtomicBool,
}

/// The runtime handle: scheduler, timer, registry and the printer service,
/// constructed explicitly at startup and torn down in reverse order by
/// [`Troupe::shutdown`].
///
/// It is *not* a singleton. A typical application has one troupe hosting all
/// of its actors, but unit tests create their own and run in parallel.
#[derive(Clone)]
pub struct Troupe {
	inner: Arc<TroupeInner>,
}

impl Default for Troupe {
	fn default() -> Troupe {
		Troupe::new()
	}
}

impl Troupe {
	/// Creates a runtime with the default worker count (hardware
	/// concurrency, overridable via `TROUPE_WORKER_THREADS`).
	pub fn new() -> Troupe {
		Troupe::with_workers(worker_threads_from_env_or_default())
	}

	pub fn with_workers(num_workers: usize) -> Troupe {
		let scheduler = start_scheduler(num_workers);
		let troupe = Troupe {
			inner: Arc::new(TroupeInner {
				scheduler,
				registry: Registry::default(),
				timer: Mutex::new(None),
				printer: Mutex::new(None),
				shut_down: AtomicBool::new(false),
			}),
		};
		let timer = start_timer(&troupe);
		*troupe.inner.timer.lock().unwrap() = Some(timer);
		let printer = troupe.spawn(SpawnOptions::new().hidden(), Printer::default());
		*troupe.inner.printer.lock().unwrap() = Some(printer);
		troupe
	}

	pub(crate) fn scheduler(&self) -> &SchedulerClient {
		&self.inner.scheduler
	}

	/// The embedding hook for side-runnables: the pool behind this client
	/// accepts any [`Resumable`].
	pub fn scheduler_client(&self) -> SchedulerClient {
		self.inner.scheduler.clone()
	}

	pub(crate) fn timer(&self) -> TimerClient {
		self.inner
			.timer
			.lock()
			.unwrap()
			.clone()
			.expect("the timer service runs until shutdown")
	}

	pub(crate) fn registry(&self) -> &Registry {
		&self.inner.registry
	}

	/// The well-known printer actor: send it `PrintChunk` and `PrintFlush`
	/// messages.
	pub fn printer(&self) -> ActorRef {
		self.inner
			.printer
			.lock()
			.unwrap()
			.clone()
			.expect("the printer service runs until shutdown")
	}

	/// Number of live actors spawned without the `hidden` option.
	pub fn num_live_actors(&self) -> usize {
		self.inner.registry.num_live_actors()
	}

	/// Spawns an event-based actor.
	pub fn spawn<A: Actor>(&self, options: SpawnOptions, actor: A) -> ActorRef {
		self.spawn_with_parent(options, actor, None)
	}

	/// Spawns an event-based actor from a function that builds its first
	/// behavior.
	pub fn spawn_fn(
		&self,
		options: SpawnOptions,
		factory: impl FnOnce(&mut ActorContext<FnActor>) -> Behavior<'static, FnActor>
		+ Send
		+ 'static,
	) -> ActorRef {
		self.spawn(options, FnActor::new(factory))
	}

	pub(crate) fn spawn_with_parent<A: Actor>(
		&self,
		options: SpawnOptions,
		actor: A,
		parent: Option<ActorAddr>,
	) -> ActorRef {
		let policy =
			if options.detached { SchedulePolicy::Dedicated } else { SchedulePolicy::Pool };
		let name = actor.name();
		let cell = ActorCell::create(
			actor,
			&name,
			policy,
			options.priority_aware,
			options.hidden,
			self.clone(),
		);
		if let Some(parent) = parent {
			// Seeded before the first resume, so the link/monitor exists
			// atomically with the spawn.
			let mut body = cell.body.lock().unwrap();
			if options.linked {
				body.links.insert(parent.clone());
			}
			if options.monitored {
				body.monitors.insert(parent);
			}
		}
		let actor_ref = cell.actor_ref().expect("a freshly created cell upgrades");
		self.inner.registry.register(cell.id(), cell.addr(), options.hidden);
		debug!(actor_id = %cell.instance_id(), detached = options.detached, "spawn-actor");
		let resumable: Arc<dyn Resumable> = cell.clone();
		cell.attach_to_scheduler(resumable.clone());
		match policy {
			SchedulePolicy::Pool => self.inner.scheduler.enqueue(resumable),
			SchedulePolicy::Dedicated => {
				let thread_cell = cell.clone();
				std::thread::Builder::new()
					.name(format!("troupe-{}", cell.instance_id()))
					.spawn(move || run_detached(thread_cell))
					.expect("failed to spawn a detached actor thread");
			},
		}
		actor_ref
	}

	/// Spawns a blocking actor: `body` owns an OS thread and receives
	/// messages by calling into the blocking receive API.
	///
	/// Returning `Ok(())` terminates with reason `Normal`; propagating the
	/// error of [`BlockingActor::quit`] terminates with the quit reason; any
	/// other error (or a panic) terminates with `UnhandledException`.
	pub fn spawn_blocking<S, F>(&self, options: SpawnOptions, state: S, body: F) -> ActorRef
	where
		S: Send + 'static,
		F: FnOnce(&mut BlockingActor<S>) -> anyhow::Result<()> + Send + 'static,
	{
		let cell = ActorCell::create(
			state,
			"BlockingActor",
			SchedulePolicy::Dedicated,
			options.priority_aware,
			options.hidden,
			self.clone(),
		);
		let actor_ref = cell.actor_ref().expect("a freshly created cell upgrades");
		self.inner.registry.register(cell.id(), cell.addr(), options.hidden);
		debug!(actor_id = %cell.instance_id(), "spawn-blocking-actor");
		// The thread is the one consumer; producers never need to schedule.
		cell.state().acquire_for_run();
		cell.body.lock().unwrap().initialized = true;
		let thread_cell = cell.clone();
		std::thread::Builder::new()
			.name(format!("troupe-{}", cell.instance_id()))
			.spawn(move || crate::blocking::run_blocking(thread_cell, body))
			.expect("failed to spawn a blocking actor thread");
		actor_ref
	}

	/// A blocking actor owned by the calling (non-actor) thread, terminated
	/// with reason `Normal` when the scope ends.
	pub fn scoped_actor<S: Send + 'static>(&self, state: S) -> ScopedActor<S> {
		let cell = ActorCell::create(
			state,
			"ScopedActor",
			SchedulePolicy::Dedicated,
			false,
			true,
			self.clone(),
		);
		self.inner.registry.register(cell.id(), cell.addr(), true);
		cell.state().acquire_for_run();
		cell.body.lock().unwrap().initialized = true;
		ScopedActor::new(BlockingActor::from_cell(cell))
	}

	/// Anonymous scoped actor with no state.
	pub fn scoped(&self) -> ScopedActor<()> {
		self.scoped_actor(())
	}

	/// Blocks until every spawned, non-hidden actor has terminated.
	pub fn await_all_actors_done(&self) {
		self.inner.registry.await_all_actors_done();
	}

	/// Stops the runtime: every remaining actor, the timer and printer
	/// services included, receives a `UserShutdown` exit; once the registry
	/// is empty the scheduler is torn down. Idempotent; must not be called
	/// from an actor thread.
	pub fn shutdown(&self) {
		if self.inner.shut_down.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("troupe-shutdown");
		for addr in self.inner.registry.living() {
			if let Some(actor) = addr.upgrade() {
				actor.send_exit(ExitReason::UserShutdown);
			}
		}
		self.inner.registry.await_no_live_actors();
		self.inner.printer.lock().unwrap().take();
		self.inner.timer.lock().unwrap().take();
		self.inner.scheduler.shutdown();
	}

	/// Shuts the runtime down and asserts nothing was still running.
	#[cfg(any(test, feature = "testsuite"))]
	pub fn assert_quit(self) {
		let still_running = self.num_live_actors();
		assert!(still_running == 0, "{still_running} actors were still running at shutdown");
		self.shutdown();
	}
}

