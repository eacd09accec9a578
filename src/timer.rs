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

//! The timer service: a single hidden actor running in blocking mode on its
//! own thread, outside the worker pool. Its sole state is a deadline-ordered
//! map of delayed envelopes; it sleeps on its mailbox until the earliest
//! deadline (or until a new request arrives) and re-injects due envelopes as
//! normal sends.
//!
//! Cancellation is implicit: timeout messages carry ids, and the receiver's
//! dispatcher drops the stale ones. An inbound exit terminates the timer
//! like any other actor, dropping whatever is still pending.

use std::{
	collections::BTreeMap,
	time::{Duration, Instant},
};

use tracing::debug;

use crate::{
	actor::ActorRef,
	behavior::{types, Behavior, Handled},
	envelope::Envelope,
	mailbox::Priority,
	msg,
	troupe::{SpawnOptions, Troupe},
};

/// One delayed send: where to re-inject what, and when.
#[derive(Clone, Debug, PartialEq)]
struct ScheduleDelayed {
	deadline: Instant,
	dest: ActorRef,
	envelope: Envelope,
	priority: Priority,
}

/// Handle for talking to the timer actor.
#[derive(Clone)]
pub(crate) struct TimerClient {
	timer: ActorRef,
}

impl TimerClient {
	/// Computes the absolute deadline and hands the delayed send over. Once
	/// the timer has terminated, late requests are silently dropped by the
	/// closed-mailbox rule.
	pub(crate) fn schedule(
		&self,
		delay: Duration,
		dest: ActorRef,
		envelope: Envelope,
		priority: Priority,
	) {
		let deadline = Instant::now() + delay;
		self.timer.send(msg![ScheduleDelayed { deadline, dest, envelope, priority }]);
	}
}

/// Spawns the timer as a hidden blocking actor of `troupe`, like any other
/// internal service. It terminates through the usual exit-message path.
pub(crate) fn start_timer(troupe: &Troupe) -> TimerClient {
	let timer = troupe.spawn_blocking(SpawnOptions::new().hidden(), (), |actor| {
		// Keyed by (deadline, insertion seq): deadline order across keys,
		// stable insertion order within one deadline.
		let mut queue: BTreeMap<(Instant, u64), ScheduleDelayed> = BTreeMap::new();
		let mut seq: u64 = 0;
		loop {
			let now = Instant::now();
			while matches!(queue.first_key_value(), Some(((deadline, _), _)) if *deadline <= now) {
				let (_, delayed) = queue.pop_first().expect("the map was just observed non-empty");
				delayed.dest.deliver(delayed.envelope, delayed.priority);
			}
			let next_deadline = queue.keys().next().map(|(deadline, _)| *deadline);
			let mut behavior =
				Behavior::new().on(types::<(ScheduleDelayed,)>(), |_, _ctx, message| {
					let delayed =
						message.get::<ScheduleDelayed>(0).expect("matched by type").clone();
					seq += 1;
					queue.insert((delayed.deadline, seq), delayed);
					Handled::Done
				});
			if let Some(deadline) = next_deadline {
				// Wake at the earliest deadline even if no request arrives.
				behavior = behavior
					.after(deadline.saturating_duration_since(Instant::now()), |_, _ctx| {});
			}
			actor.receive(&mut behavior)?;
		}
	});
	debug!(timer_id = %timer.instance_id(), "timer-started");
	TimerClient { timer }
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::*;
	use crate::{actor::ExitReason, tests::await_condition};

	fn recorder(troupe: &Troupe, log: Arc<Mutex<Vec<u32>>>) -> ActorRef {
		troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
			Behavior::new().on(types::<(u32,)>(), move |_, _, message| {
				log.lock().unwrap().push(*message.get::<u32>(0).unwrap());
				Handled::Done
			})
		})
	}

	#[test]
	fn test_fires_in_deadline_order() {
		let troupe = Troupe::with_workers(2);
		let log = Arc::new(Mutex::new(Vec::new()));
		let dest = recorder(&troupe, log.clone());
		let timer = troupe.timer();
		timer.schedule(
			Duration::from_millis(60),
			dest.clone(),
			Envelope::asynchronous(None, msg![2u32]),
			Priority::Normal,
		);
		timer.schedule(
			Duration::from_millis(20),
			dest.clone(),
			Envelope::asynchronous(None, msg![1u32]),
			Priority::Normal,
		);
		await_condition(|| log.lock().unwrap().len() == 2);
		assert_eq!(*log.lock().unwrap(), vec![1, 2]);
		dest.send_exit(ExitReason::UserShutdown);
		troupe.await_all_actors_done();
		troupe.shutdown();
	}

	#[test]
	fn test_same_deadline_keeps_insertion_order() {
		let troupe = Troupe::with_workers(2);
		let log = Arc::new(Mutex::new(Vec::new()));
		let dest = recorder(&troupe, log.clone());
		let timer = troupe.timer();
		let delay = Duration::from_millis(30);
		for tag in 1..=5u32 {
			timer.schedule(
				delay,
				dest.clone(),
				Envelope::asynchronous(None, msg![tag]),
				Priority::Normal,
			);
		}
		await_condition(|| log.lock().unwrap().len() == 5);
		assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4, 5]);
		dest.send_exit(ExitReason::UserShutdown);
		troupe.await_all_actors_done();
		troupe.shutdown();
	}

	#[test]
	fn test_shutdown_discards_pending_sends() {
		let troupe = Troupe::with_workers(2);
		let log = Arc::new(Mutex::new(Vec::new()));
		let dest = recorder(&troupe, log.clone());
		troupe.timer().schedule(
			Duration::from_secs(30),
			dest,
			Envelope::asynchronous(None, msg![1u32]),
			Priority::Normal,
		);
		troupe.shutdown();
		assert!(log.lock().unwrap().is_empty());
	}
}
