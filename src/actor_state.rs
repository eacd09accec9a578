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

use std::sync::atomic::{AtomicU32, Ordering};

/// Scheduling state of an actor.
///
/// Only the thread currently executing the actor moves the state between
/// `Running`, `AboutToBlock` and back; producers move `Blocked` (and
/// `AboutToBlock`) back to `Ready` when they enqueue a message.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActorState {
	/// The actor is enqueued on the scheduler (or about to be), waiting for a worker.
	Ready = 0,
	/// A worker is currently resuming the actor.
	Running = 1,
	/// The actor observed an empty mailbox and is about to park.
	AboutToBlock = 2,
	/// The actor is parked. The next producer re-enqueues it.
	Blocked = 3,
	/// The actor terminated and can never return to any other state.
	Done = 4,
}

impl From<u32> for ActorState {
	fn from(actor_state_u32: u32) -> Self {
		match actor_state_u32 {
			0 => ActorState::Ready,
			1 => ActorState::Running,
			2 => ActorState::AboutToBlock,
			3 => ActorState::Blocked,
			4 => ActorState::Done,
			_ => {
				panic!(
					"Found forbidden u32 value for ActorState `{actor_state_u32}`. This should \
					 never happen."
				);
			},
		}
	}
}

impl ActorState {
	pub fn is_exit(&self) -> bool {
		*self == ActorState::Done
	}
}

/// What a producer has to do after enqueueing into a mailbox.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WakeAction {
	/// The consumer is live (ready, running, or was caught mid-park): nothing to do.
	Ignore,
	/// The consumer was parked. The producer must re-enqueue it on its scheduler.
	Schedule,
	/// The actor is terminated.
	Dead,
}

pub(crate) struct AtomicState(AtomicU32);

impl Default for AtomicState {
	fn default() -> Self {
		AtomicState(AtomicU32::new(ActorState::Ready as u32))
	}
}

impl From<ActorState> for AtomicState {
	fn from(state: ActorState) -> Self {
		AtomicState(AtomicU32::from(state as u32))
	}
}

impl AtomicState {
	/// `Ready -> Running`, invoked by the worker that picked the actor up.
	pub(crate) fn acquire_for_run(&self) -> bool {
		self.0
			.compare_exchange(
				ActorState::Ready as u32,
				ActorState::Running as u32,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_ok()
	}

	/// `Running -> AboutToBlock`, invoked by the executing thread when the
	/// mailbox looked empty.
	pub(crate) fn begin_block(&self) {
		self.0.store(ActorState::AboutToBlock as u32, Ordering::SeqCst);
	}

	/// `AboutToBlock -> Blocked`. Fails if a producer intervened, in which
	/// case the executing thread must keep running.
	pub(crate) fn park(&self) -> bool {
		self.0
			.compare_exchange(
				ActorState::AboutToBlock as u32,
				ActorState::Blocked as u32,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_ok()
	}

	/// Back to `Running` after an aborted park.
	pub(crate) fn resume_running(&self) {
		self.0.store(ActorState::Running as u32, Ordering::SeqCst);
	}

	/// Producer-side wake-up protocol.
	pub(crate) fn wake(&self) -> WakeAction {
		loop {
			let observed = self.0.load(Ordering::SeqCst);
			match ActorState::from(observed) {
				ActorState::Ready | ActorState::Running => return WakeAction::Ignore,
				ActorState::AboutToBlock => {
					// The consumer is still on a worker, deciding whether to
					// park. Forcing `Ready` makes its park CAS fail, so it
					// picks the new message up itself.
					if self.transition(ActorState::AboutToBlock, ActorState::Ready) {
						return WakeAction::Ignore;
					}
				},
				ActorState::Blocked =>
					if self.transition(ActorState::Blocked, ActorState::Ready) {
						return WakeAction::Schedule;
					},
				ActorState::Done => return WakeAction::Dead,
			}
		}
	}

	pub(crate) fn exit(&self) {
		self.0.store(ActorState::Done as u32, Ordering::SeqCst);
	}

	pub fn get_state(&self) -> ActorState {
		ActorState::from(self.0.load(Ordering::Acquire))
	}

	fn transition(&self, from: ActorState, to: ActorState) -> bool {
		self.0
			.compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}
}
