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

//! The event-based resume loop: the glue between a worker thread and the
//! dispatcher.
//!
//! One resume pulls envelopes until the mailbox signals empty, then parks the
//! actor with the `AboutToBlock -> Blocked` CAS. A producer that enqueues
//! during the decision window forces the state back and the loop keeps going;
//! a producer that finds the actor parked re-enqueues it on the scheduler.

use std::sync::{atomic::Ordering, Arc};

use tracing::{debug, info};

use crate::{
	actor::{Actor, DownMsg, ExitMsg, ExitReason},
	actor_cell::{ActorCell, CellBody, ExitState},
	actor_context::CtxOp,
	dispatcher::{
		apply_ops, arm_top_timeout, dispatch, replay_skip_cache, run_user, DispatchOutcome,
		ReplayResult,
	},
	envelope::{Envelope, MessageId},
	mailbox::Priority,
	msg,
	scheduler::{Resumable, ResumeResult},
};

pub(crate) enum CleanupOutcome {
	/// `on_exit` reinstalled a behavior: the exit is aborted, nobody is
	/// notified, and the actor keeps running.
	Resurrected,
	Dead,
}

impl<A: Actor> Resumable for ActorCell<A> {
	fn resume(&self) -> ResumeResult {
		if !self.state().acquire_for_run() {
			// Terminated (or never handed out in `Ready`); nothing to run.
			return ResumeResult::Done;
		}
		let Some(cell) = self.self_arc() else {
			return ResumeResult::Done;
		};
		let mut body = self.body.lock().unwrap();
		if !body.initialized {
			initialize(&cell, &mut body);
		}
		loop {
			if !body.exit.is_alive() {
				match run_cleanup(&cell, &mut body) {
					CleanupOutcome::Resurrected => continue,
					CleanupOutcome::Dead => return ResumeResult::Done,
				}
			}
			if body.behaviors.is_empty() {
				// An empty behavior stack terminates the actor.
				body.exit = ExitState::Planned(ExitReason::Normal);
				continue;
			}
			match body.try_pop() {
				Some(envelope) => match dispatch(&cell, &mut body, envelope) {
					DispatchOutcome::Consumed { .. } => {
						// The behavior may now match previously skipped
						// envelopes; they come before anything newer in the
						// mailbox.
						if let ReplayResult::Terminated = replay_skip_cache(&cell, &mut body) {
							continue;
						}
						arm_top_timeout(&cell, &mut body);
					},
					DispatchOutcome::Skipped(envelope) => body.skip_cache.push_back(envelope),
					DispatchOutcome::Dropped => {},
					DispatchOutcome::Terminated => continue,
				},
				None => {
					self.state().begin_block();
					std::sync::atomic::fence(Ordering::SeqCst);
					if body.can_fetch_more() {
						self.state().resume_running();
						continue;
					}
					if self.state().park() {
						// Parked. The scheduling reference keeps the actor
						// alive; the next producer re-enqueues it.
						return ResumeResult::ResumeLater;
					}
					// A producer slipped in during the decision window.
					self.state().resume_running();
				},
			}
		}
	}
}

/// First resume: run `make_behavior` and install its return value.
fn initialize<A: Actor>(cell: &Arc<ActorCell<A>>, body: &mut CellBody<A>) {
	body.initialized = true;
	debug!(actor_id = %cell.instance_id(), "initialize-actor");
	match run_user(cell, body, None, MessageId::ASYNC, |state, ctx| state.make_behavior(ctx)) {
		Ok((behavior, outcome)) => {
			body.behaviors.push_keep(behavior);
			apply_ops(body, None, outcome.ops);
			arm_top_timeout(cell, body);
		},
		Err(()) => {
			body.exit = ExitState::Planned(ExitReason::UnhandledException);
		},
	}
}

/// Termination path of event-based actors: `on_exit` first (which may abort
/// the whole thing), then the common teardown.
pub(crate) fn run_cleanup<A: Actor>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
) -> CleanupOutcome {
	let reason = match &body.exit {
		ExitState::Planned(reason) | ExitState::Dead(reason) => reason.clone(),
		ExitState::Alive => ExitReason::Normal,
	};
	body.behaviors.clear();
	if let Ok(((), outcome)) =
		run_user(cell, body, None, MessageId::ASYNC, |state, ctx| state.on_exit(ctx, &reason))
	{
		let reinstalled = outcome.ops.iter().any(|op| matches!(op, CtxOp::Become { .. }));
		apply_ops(body, None, outcome.ops);
		if reinstalled && !body.behaviors.is_empty() {
			debug!(actor_id = %cell.instance_id(), "exit-aborted-by-on-exit");
			body.exit = ExitState::Alive;
			arm_top_timeout(cell, body);
			return CleanupOutcome::Resurrected;
		}
	}
	// A panicking `on_exit` does not keep the actor alive.
	cleanup_common(cell, body, reason);
	CleanupOutcome::Dead
}

/// Teardown shared by event-based and blocking actors: close and bounce the
/// mailbox, notify links and monitors, release the scheduling reference.
pub(crate) fn cleanup_common<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	reason: ExitReason,
) {
	cell.set_exit_code(&reason);
	body.exit = ExitState::Dead(reason.clone());
	body.behaviors.clear();
	body.continuations.clear();
	body.pending_responses.clear();
	// Everything still queued is undeliverable now. Requests among it get a
	// synthetic error response; the rest is discarded.
	let mut leftovers: Vec<Envelope> = body.skip_cache.drain(..).collect();
	if let Some(mailbox_rx) = body.mailbox_rx.take() {
		leftovers.extend(mailbox_rx.drain());
		// Dropping the receiver closes the mailbox; from here on producers
		// bounce their own requests.
	}
	for envelope in leftovers {
		cell.bounce(envelope);
	}
	let self_addr = cell.addr();
	for peer in body.links.drain() {
		if let Some(peer_ref) = peer.upgrade() {
			debug!(from = %cell.instance_id(), to = %peer_ref.instance_id(), reason = %reason, "exit-notify");
			peer_ref.deliver(
				Envelope::asynchronous(
					Some(self_addr.clone()),
					msg![ExitMsg { source: Some(self_addr.clone()), reason: reason.clone() }],
				),
				Priority::Normal,
			);
		}
	}
	for observer in body.monitors.drain() {
		if let Some(observer_ref) = observer.upgrade() {
			observer_ref.deliver(
				Envelope::asynchronous(
					Some(self_addr.clone()),
					msg![DownMsg { source: self_addr.clone(), reason: reason.clone() }],
				),
				Priority::Normal,
			);
		}
	}
	cell.state().exit();
	cell.detach_from_scheduler();
	cell.runtime().registry().unregister(cell.id(), cell.is_hidden());
	info!(actor_id = %cell.instance_id(), exit_reason = %reason, "actor-exit");
}

/// Thread body of a detached event-based actor: same resume loop, but parking
/// blocks the dedicated thread on the mailbox signal instead of returning to
/// the worker pool.
pub(crate) fn run_detached<A: Actor>(cell: Arc<ActorCell<A>>) {
	loop {
		match cell.as_ref().resume() {
			ResumeResult::Done | ResumeResult::ShutdownWorker => break,
			ResumeResult::ResumeLater => {
				let mailbox_alive = {
					let body = cell.body.lock().unwrap();
					match body.mailbox_rx.as_ref() {
						Some(mailbox_rx) => mailbox_rx.wait_until_nonempty().is_ok(),
						None => false,
					}
				};
				if !mailbox_alive {
					break;
				}
				// Un-park ourselves; a racing producer may already have.
				cell.state().wake();
			},
		}
	}
}
