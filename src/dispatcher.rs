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

//! Turns one dequeued envelope into one of: consumed, skipped-and-cached,
//! dropped, or actor-terminated.
//!
//! Classification runs first: exit messages, link/monitor bookkeeping,
//! behavior timeouts and synchronous responses are recognized before any
//! pattern matching. Whatever remains is matched against the current top
//! behavior (event-based actors) or the behavior handed to a blocking
//! `receive` call.

use std::{
	any::Any,
	collections::VecDeque,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
};

use tracing::{debug, error, warn};

use crate::{
	actor::{
		ActorAddr, DemonitorMsg, ExitMsg, ExitReason, LinkMsg, MonitorMsg, SyncTimeoutMsg,
		TimeoutMsg, UnlinkMsg,
	},
	actor_cell::{ActorCell, CellBody, ExitState, Hook},
	actor_context::{ActorContext, CtxOp},
	behavior::{Behavior, Handled, StackEntry, TimeoutSlot},
	envelope::{Envelope, MessageId},
	mailbox::Priority,
	msg,
};

/// What the dispatcher did with one envelope.
pub(crate) enum DispatchOutcome {
	Consumed { behavior_changed: bool },
	/// The envelope goes to the skip cache, to be re-presented when the
	/// behavior changes.
	Skipped(Envelope),
	Dropped,
	/// A planned exit is set on the body; the caller must run cleanup.
	Terminated,
}

pub(crate) enum ReplayResult {
	Completed,
	Terminated,
}

/// Full dispatch for event-based actors: classification, then the top
/// behavior.
pub(crate) fn dispatch<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	envelope: Envelope,
) -> DispatchOutcome {
	match dispatch_system(cell, body, envelope) {
		Ok(outcome) => outcome,
		Err(envelope) => dispatch_ordinary(cell, body, envelope),
	}
}

/// Classification pass shared by the event loop and blocking mode.
///
/// `Err` hands the envelope back for ordinary pattern matching.
pub(crate) fn dispatch_system<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	envelope: Envelope,
) -> Result<DispatchOutcome, Envelope> {
	if envelope.message.size() == 1 {
		if let Some(exit) = envelope.message.get::<ExitMsg>(0).cloned() {
			if body.trap_exit {
				// Delivered like any ordinary message.
				return Err(envelope);
			}
			if exit.reason.is_normal() {
				return Ok(DispatchOutcome::Dropped);
			}
			body.exit = ExitState::Planned(exit.reason);
			return Ok(DispatchOutcome::Terminated);
		}
		if let Some(link) = envelope.message.get::<LinkMsg>(0).cloned() {
			body.links.insert(link.peer);
			return Ok(DispatchOutcome::Consumed { behavior_changed: false });
		}
		if let Some(unlink) = envelope.message.get::<UnlinkMsg>(0).cloned() {
			body.links.remove(&unlink.peer);
			return Ok(DispatchOutcome::Consumed { behavior_changed: false });
		}
		if let Some(monitor) = envelope.message.get::<MonitorMsg>(0).cloned() {
			body.monitors.insert(monitor.observer);
			return Ok(DispatchOutcome::Consumed { behavior_changed: false });
		}
		if let Some(demonitor) = envelope.message.get::<DemonitorMsg>(0).cloned() {
			body.monitors.remove(&demonitor.observer);
			return Ok(DispatchOutcome::Consumed { behavior_changed: false });
		}
		if let Some(timeout) = envelope.message.get::<TimeoutMsg>(0).copied() {
			return Ok(match body.behaviors.classify_timeout(timeout.timeout_id) {
				TimeoutSlot::ActiveTop => run_behavior_timeout(cell, body),
				// Kept in arrival order: the behavior that armed it may
				// become the top again.
				TimeoutSlot::InactiveLower => DispatchOutcome::Skipped(envelope),
				TimeoutSlot::Stale => {
					debug!(actor = %cell.instance_id(), timeout_id = timeout.timeout_id, "drop-stale-timeout");
					DispatchOutcome::Dropped
				},
			});
		}
		if let Some(sync_timeout) = envelope.message.get::<SyncTimeoutMsg>(0).copied() {
			let response_id = sync_timeout.response_id;
			if body.pending_responses.remove(&response_id) {
				body.continuations.remove(&response_id);
				return Ok(run_sync_timeout(cell, body, envelope));
			}
			// The response won the race; the deadline tick is expired.
			return Ok(DispatchOutcome::Dropped);
		}
	}
	if envelope.message_id.is_response() {
		let response_id = envelope.message_id;
		if body.pending_responses.contains(&response_id) {
			if let Some(continuation) = body.continuations.remove(&response_id) {
				body.pending_responses.remove(&response_id);
				return Ok(run_continuation(cell, body, continuation, envelope));
			}
			// No continuation registered: a blocking actor will pick this
			// response up in `receive_response`. Ordinary matching (and the
			// skip cache) keeps it around until then.
			return Err(envelope);
		}
		debug!(actor = %cell.instance_id(), "drop-expired-response");
		return Ok(DispatchOutcome::Dropped);
	}
	Err(envelope)
}

/// Matches an ordinary (or trapped-exit) envelope against the top behavior.
fn dispatch_ordinary<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	envelope: Envelope,
) -> DispatchOutcome {
	let Some(mut entry) = body.behaviors.take_top() else {
		return DispatchOutcome::Skipped(envelope);
	};
	let Some(case_idx) = entry.behavior.find_match(&envelope.message) else {
		// Default handler: leave the message for a later behavior.
		body.behaviors.restore_top(entry);
		return DispatchOutcome::Skipped(envelope);
	};
	let run = run_user(cell, body, envelope.sender.clone(), envelope.message_id, |state, ctx| {
		entry.behavior.invoke(case_idx, state, ctx, &envelope.message)
	});
	match run {
		Ok((Handled::Skip, outcome)) => {
			apply_ops(body, Some(entry), outcome.ops);
			DispatchOutcome::Skipped(envelope)
		},
		Ok((handled, outcome)) => {
			auto_reply(cell, &envelope, handled, outcome.replied);
			let behavior_changed = apply_ops(body, Some(entry), outcome.ops);
			finish_consume(body, behavior_changed)
		},
		Err(()) => {
			body.behaviors.restore_top(entry);
			body.exit = ExitState::Planned(ExitReason::UnhandledException);
			DispatchOutcome::Terminated
		},
	}
}

/// Blocking-mode dispatch: ordinary matching against a caller-provided
/// behavior instead of the stack top. Classification must have run already.
pub(crate) fn dispatch_against<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	behavior: &mut Behavior<'_, A>,
	envelope: Envelope,
) -> DispatchOutcome {
	let Some(case_idx) = behavior.find_match(&envelope.message) else {
		return DispatchOutcome::Skipped(envelope);
	};
	let run = run_user(cell, body, envelope.sender.clone(), envelope.message_id, |state, ctx| {
		behavior.invoke(case_idx, state, ctx, &envelope.message)
	});
	match run {
		Ok((Handled::Skip, outcome)) => {
			apply_ops(body, None, outcome.ops);
			DispatchOutcome::Skipped(envelope)
		},
		Ok((handled, outcome)) => {
			auto_reply(cell, &envelope, handled, outcome.replied);
			apply_ops(body, None, outcome.ops);
			finish_consume(body, false)
		},
		Err(()) => {
			body.exit = ExitState::Planned(ExitReason::UnhandledException);
			DispatchOutcome::Terminated
		},
	}
}

/// Re-runs the skip cache from its beginning until a full pass makes no
/// progress. Relative order of still-skipped envelopes is preserved.
pub(crate) fn replay_skip_cache<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
) -> ReplayResult {
	loop {
		let mut progressed = false;
		let mut retained: VecDeque<Envelope> = VecDeque::new();
		while let Some(envelope) = body.skip_cache.pop_front() {
			match dispatch(cell, body, envelope) {
				DispatchOutcome::Consumed { .. } | DispatchOutcome::Dropped => progressed = true,
				DispatchOutcome::Skipped(envelope) => retained.push_back(envelope),
				DispatchOutcome::Terminated => {
					// Hand the cache back intact for the cleanup drain.
					while let Some(rest) = body.skip_cache.pop_front() {
						retained.push_back(rest);
					}
					body.skip_cache = retained;
					return ReplayResult::Terminated;
				},
			}
		}
		body.skip_cache = retained;
		if !progressed {
			return ReplayResult::Completed;
		}
	}
}

/// Applies the mutations a handler requested, after restoring the behavior it
/// executed in. Returns whether the behavior stack changed.
pub(crate) fn apply_ops<A: Send + 'static>(
	body: &mut CellBody<A>,
	executing: Option<StackEntry<A>>,
	ops: Vec<CtxOp<A>>,
) -> bool {
	if let Some(entry) = executing {
		body.behaviors.restore_top(entry);
	}
	let mut behavior_changed = false;
	for op in ops {
		match op {
			CtxOp::Become { behavior, keep } => {
				if keep {
					body.behaviors.push_keep(behavior);
				} else {
					body.behaviors.push_replace(behavior);
				}
				behavior_changed = true;
			},
			CtxOp::Unbecome => {
				body.behaviors.pop();
				behavior_changed = true;
			},
			CtxOp::Quit(reason) =>
				if body.exit.is_alive() {
					body.exit = ExitState::Planned(reason);
				},
			CtxOp::TrapExit(flag) => body.trap_exit = flag,
			CtxOp::AddLink(peer) => {
				body.links.insert(peer);
			},
			CtxOp::RemoveLink(peer) => {
				body.links.remove(&peer);
			},
			CtxOp::AddPendingResponse(response_id) => {
				body.pending_responses.insert(response_id);
			},
			CtxOp::AddContinuation(response_id, continuation) => {
				body.continuations.insert(response_id, continuation);
			},
			CtxOp::SetSyncFailureHook(hook) => body.sync_failure_hook = Some(hook),
			CtxOp::SetSyncTimeoutHook(hook) => body.sync_timeout_hook = Some(hook),
		}
	}
	behavior_changed
}

/// Arms the top behavior's timeout, invalidating whatever tick was armed
/// before: the id bumps, so a late tick is dropped by classification.
pub(crate) fn arm_top_timeout<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
) {
	let Some(duration) =
		body.behaviors.top_mut().and_then(|entry| entry.behavior.timeout_duration())
	else {
		if let Some(top) = body.behaviors.top_mut() {
			top.armed_timeout_id = None;
		}
		return;
	};
	let Some(self_ref) = cell.actor_ref() else {
		return;
	};
	let timeout_id = body.next_timeout_id();
	if let Some(top) = body.behaviors.top_mut() {
		top.armed_timeout_id = Some(timeout_id);
	}
	cell.runtime().timer().schedule(
		duration,
		self_ref,
		Envelope::asynchronous(None, msg![TimeoutMsg { timeout_id }]),
		Priority::Normal,
	);
}

pub(crate) struct HandlerOutcome<A> {
	pub(crate) ops: Vec<CtxOp<A>>,
	pub(crate) replied: bool,
}

/// Runs user code with the actor state and a fresh context, capturing
/// panics. `Err` means the handler panicked; the caller terminates the actor
/// with `UnhandledException`.
pub(crate) fn run_user<A: Send + 'static, R>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	sender: Option<ActorAddr>,
	message_id: MessageId,
	f: impl FnOnce(&mut A, &mut ActorContext<A>) -> R,
) -> Result<(R, HandlerOutcome<A>), ()> {
	let mut state = body
		.state_opt
		.take()
		.expect("actor state is present whenever the dispatcher runs");
	let mut ctx = ActorContext::new(cell.clone(), sender, message_id);
	let result = catch_unwind(AssertUnwindSafe(|| f(&mut state, &mut ctx)));
	body.state_opt = Some(state);
	match result {
		Ok(value) =>
			Ok((value, HandlerOutcome { ops: ctx.take_ops(), replied: ctx.replied })),
		Err(payload) => {
			error!(
				actor = %cell.instance_id(),
				cause = %panic_message(payload.as_ref()),
				"handler-panicked"
			);
			Err(())
		},
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(literal) = payload.downcast_ref::<&'static str>() {
		(*literal).to_string()
	} else if let Some(owned) = payload.downcast_ref::<String>() {
		owned.clone()
	} else {
		"opaque panic payload".to_string()
	}
}

/// Synthesizes the response envelope for a consumed request, unless a
/// response promise already claimed it.
fn auto_reply<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	envelope: &Envelope,
	handled: Handled,
	promise_taken: bool,
) {
	let Handled::Reply(message) = handled else {
		return;
	};
	if !envelope.is_request() || promise_taken {
		return;
	}
	if let Some(sender) = envelope.sender.as_ref().and_then(ActorAddr::upgrade) {
		sender.deliver(
			Envelope::response(Some(cell.addr()), envelope.message_id, message),
			Priority::Normal,
		);
	}
}

fn finish_consume<A>(body: &mut CellBody<A>, behavior_changed: bool) -> DispatchOutcome {
	if body.exit.is_alive() {
		DispatchOutcome::Consumed { behavior_changed }
	} else {
		DispatchOutcome::Terminated
	}
}

fn run_behavior_timeout<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
) -> DispatchOutcome {
	let Some(mut entry) = body.behaviors.take_top() else {
		return DispatchOutcome::Dropped;
	};
	let run = run_user(cell, body, None, MessageId::ASYNC, |state, ctx| {
		entry.behavior.invoke_timeout(state, ctx);
	});
	match run {
		Ok(((), outcome)) => {
			let behavior_changed = apply_ops(body, Some(entry), outcome.ops);
			finish_consume(body, behavior_changed)
		},
		Err(()) => {
			body.behaviors.restore_top(entry);
			body.exit = ExitState::Planned(ExitReason::UnhandledException);
			DispatchOutcome::Terminated
		},
	}
}

fn run_continuation<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	mut continuation: Behavior<'static, A>,
	envelope: Envelope,
) -> DispatchOutcome {
	let Some(case_idx) = continuation.find_match(&envelope.message) else {
		return run_sync_failure(cell, body, envelope);
	};
	let run = run_user(cell, body, envelope.sender.clone(), envelope.message_id, |state, ctx| {
		continuation.invoke(case_idx, state, ctx, &envelope.message)
	});
	match run {
		Ok((handled, outcome)) => {
			if matches!(handled, Handled::Skip) {
				warn!(actor = %cell.instance_id(), "sync continuation skipped its response");
			}
			auto_reply(cell, &envelope, handled, outcome.replied);
			let behavior_changed = apply_ops(body, None, outcome.ops);
			finish_consume(body, behavior_changed)
		},
		Err(()) => {
			body.exit = ExitState::Planned(ExitReason::UnhandledException);
			DispatchOutcome::Terminated
		},
	}
}

fn run_sync_failure<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	envelope: Envelope,
) -> DispatchOutcome {
	match body.sync_failure_hook.take() {
		Some(hook) => run_hook(cell, body, hook, envelope, |body, hook| {
			body.sync_failure_hook.get_or_insert(hook);
		}),
		None => {
			error!(actor = %cell.instance_id(), "unmatched sync response");
			body.exit = ExitState::Planned(ExitReason::UnhandledSyncFailure);
			DispatchOutcome::Terminated
		},
	}
}

fn run_sync_timeout<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	envelope: Envelope,
) -> DispatchOutcome {
	match body.sync_timeout_hook.take() {
		Some(hook) => run_hook(cell, body, hook, envelope, |body, hook| {
			body.sync_timeout_hook.get_or_insert(hook);
		}),
		None => {
			body.exit = ExitState::Planned(ExitReason::UnhandledSyncTimeout);
			DispatchOutcome::Terminated
		},
	}
}

fn run_hook<A: Send + 'static>(
	cell: &Arc<ActorCell<A>>,
	body: &mut CellBody<A>,
	mut hook: Hook<A>,
	envelope: Envelope,
	reinstall: impl FnOnce(&mut CellBody<A>, Hook<A>),
) -> DispatchOutcome {
	let run = run_user(cell, body, envelope.sender.clone(), envelope.message_id, |state, ctx| {
		hook(state, ctx, &envelope.message)
	});
	match run {
		Ok((_handled, outcome)) => {
			let behavior_changed = apply_ops(body, None, outcome.ops);
			// Keep the hook installed unless the handler replaced it.
			reinstall(body, hook);
			finish_consume(body, behavior_changed)
		},
		Err(()) => {
			body.exit = ExitState::Planned(ExitReason::UnhandledException);
			DispatchOutcome::Terminated
		},
	}
}
