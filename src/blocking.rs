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

//! Blocking-actor mode: the actor owns an OS thread, and `receive` calls
//! block that thread on the mailbox instead of yielding to the scheduler.
//!
//! Termination is an unwinding error: [`BlockingActor::quit`] returns an
//! [`ActorExited`] that user code propagates with `?` through its call stack;
//! the top-level loop owning the thread catches it and runs cleanup. User
//! code never observes a half-dead actor.

use std::{
	collections::VecDeque,
	ops::{Deref, DerefMut},
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
	time::{Duration, Instant},
};

use thiserror::Error;
use tracing::error;

use crate::{
	actor::{ActorAddr, ActorRef, ExitReason},
	actor_cell::{ActorCell, CellBody, ExitState},
	actor_context::ActorContext,
	behavior::Behavior,
	dispatcher::{apply_ops, dispatch_against, dispatch_system, run_user, DispatchOutcome},
	envelope::{Envelope, MessageId},
	mailbox::{Priority, RecvError},
	message::Message,
	resume::cleanup_common,
	DEFAULT_SYNC_TIMEOUT,
};

/// The unwinding error that carries a blocking actor's exit reason to the
/// top of its thread.
#[derive(Clone, Debug, Error)]
#[error("actor exited: {0}")]
pub struct ActorExited(pub ExitReason);

/// Error of a blocking `ask`/`receive_response`.
#[derive(Debug, Error)]
pub enum AskError {
	#[error("no response arrived before the deadline")]
	Timeout,
	#[error("the actor is exiting: {0}")]
	Exited(#[from] ActorExited),
}

/// Handle to the deferred response of a synchronous send, carrying the
/// awaited response id.
#[derive(Clone, Copy, Debug)]
pub struct ResponseFuture {
	response_id: MessageId,
}

impl ResponseFuture {
	pub fn response_id(&self) -> MessageId {
		self.response_id
	}
}

/// An actor that receives by blocking its own thread.
///
/// `S` is the actor's state type, passed to the handlers of every behavior
/// given to `receive`; handlers may additionally borrow from the enclosing
/// stack frame, which is why `receive` accepts non-`'static` behaviors.
pub struct BlockingActor<S> {
	cell: Arc<ActorCell<S>>,
}

impl<S: Send + 'static> BlockingActor<S> {
	pub(crate) fn from_cell(cell: Arc<ActorCell<S>>) -> BlockingActor<S> {
		BlockingActor { cell }
	}

	pub fn self_ref(&self) -> ActorRef {
		self.cell.actor_ref().expect("a blocking actor holds its own cell alive")
	}

	pub fn addr(&self) -> ActorAddr {
		self.cell.addr()
	}

	/// Runs `f` with a context and applies the bookkeeping it recorded.
	fn with_ctx<R>(&mut self, f: impl FnOnce(&mut ActorContext<S>) -> R) -> R {
		let mut ctx = ActorContext::new(self.cell.clone(), None, MessageId::ASYNC);
		let result = f(&mut ctx);
		let ops = ctx.take_ops();
		let mut body = self.cell.body.lock().unwrap();
		apply_ops(&mut body, None, ops);
		result
	}

	pub fn send(&mut self, dest: &ActorRef, message: Message) {
		self.with_ctx(|ctx| ctx.send(dest, message));
	}

	pub fn send_with_priority(&mut self, priority: Priority, dest: &ActorRef, message: Message) {
		self.with_ctx(|ctx| ctx.send_with_priority(priority, dest, message));
	}

	pub fn send_exit(&mut self, dest: &ActorAddr, reason: ExitReason) {
		self.with_ctx(|ctx| ctx.send_exit(dest, reason));
	}

	pub fn delayed_send(&mut self, dest: &ActorRef, delay: Duration, message: Message) {
		self.with_ctx(|ctx| ctx.delayed_send(dest, delay, message));
	}

	pub fn link_to(&mut self, peer: ActorAddr) {
		self.with_ctx(|ctx| ctx.link_to(peer));
	}

	pub fn unlink_from(&mut self, peer: ActorAddr) {
		self.with_ctx(|ctx| ctx.unlink_from(peer));
	}

	pub fn monitor(&mut self, peer: &ActorAddr) {
		self.with_ctx(|ctx| ctx.monitor(peer));
	}

	pub fn demonitor(&mut self, peer: &ActorAddr) {
		self.with_ctx(|ctx| ctx.demonitor(peer));
	}

	pub fn trap_exit(&mut self, flag: bool) {
		self.with_ctx(|ctx| ctx.trap_exit(flag));
	}

	/// Plans the exit and returns the error to propagate with `?`:
	///
	/// ```ignore
	/// return Err(actor.quit(ExitReason::Normal).into());
	/// ```
	pub fn quit(&mut self, reason: ExitReason) -> ActorExited {
		let mut body = self.cell.body.lock().unwrap();
		if body.exit.is_alive() {
			body.exit = ExitState::Planned(reason.clone());
		}
		ActorExited(reason)
	}

	/// Sends a request and returns the future carrying its response id.
	pub fn sync_send(&mut self, dest: &ActorRef, message: Message) -> ResponseFuture {
		let response_id = self.with_ctx(|ctx| {
			let request_id = ctx.new_request_id();
			dest.deliver(
				Envelope::request(Some(ctx.addr()), request_id, message),
				Priority::Normal,
			);
			request_id.response_id()
		});
		ResponseFuture { response_id }
	}

	/// Synchronous request/response round trip with the default sync
	/// timeout.
	pub fn ask(&mut self, dest: &ActorRef, message: Message) -> Result<Message, AskError> {
		self.ask_with_timeout(dest, *DEFAULT_SYNC_TIMEOUT, message)
	}

	pub fn ask_with_timeout(
		&mut self,
		dest: &ActorRef,
		timeout: Duration,
		message: Message,
	) -> Result<Message, AskError> {
		let future = self.sync_send(dest, message);
		let deadline = Instant::now() + timeout;
		let envelope = self.wait_response(future.response_id, deadline)?;
		Ok(envelope.message)
	}

	/// Dispatches mailbox envelopes against `behavior` until one is
	/// consumed. Envelopes the behavior does not want go to the skip cache;
	/// previously skipped envelopes are re-presented first, in order.
	///
	/// If the behavior carries a timeout and no message is consumed in time,
	/// the timeout handler runs and the call returns.
	pub fn receive(&mut self, behavior: &mut Behavior<'_, S>) -> Result<(), ActorExited> {
		let cell = self.cell.clone();
		let mut body = cell.body.lock().unwrap();
		if !body.exit.is_alive() {
			return Err(ActorExited(planned_reason(&body)));
		}
		if replay_against(&cell, &mut body, behavior)? {
			return Ok(());
		}
		let deadline = behavior.timeout_duration().map(|timeout| Instant::now() + timeout);
		loop {
			let envelope = match body.try_pop() {
				Some(envelope) => envelope,
				None => {
					let recv_result = {
						let Some(mailbox_rx) = body.mailbox_rx.as_ref() else {
							return Err(ActorExited(planned_reason(&body)));
						};
						match deadline {
							Some(deadline) => mailbox_rx.recv_deadline(deadline),
							None => mailbox_rx.recv_blocking(),
						}
					};
					match recv_result {
						Ok(envelope) => envelope,
						Err(RecvError::NoMessageAvailable) => {
							// The behavior timeout fired.
							let run = run_user(&cell, &mut body, None, MessageId::ASYNC, |state, ctx| {
								behavior.invoke_timeout(state, ctx);
							});
							return match run {
								Ok(((), outcome)) => {
									apply_ops(&mut body, None, outcome.ops);
									if body.exit.is_alive() {
										Ok(())
									} else {
										Err(ActorExited(planned_reason(&body)))
									}
								},
								Err(()) => {
									body.exit =
										ExitState::Planned(ExitReason::UnhandledException);
									Err(ActorExited(ExitReason::UnhandledException))
								},
							};
						},
						Err(RecvError::Disconnected) =>
							return Err(ActorExited(planned_reason(&body))),
					}
				},
			};
			match dispatch_system(&cell, &mut body, envelope) {
				Ok(DispatchOutcome::Terminated) =>
					return Err(ActorExited(planned_reason(&body))),
				Ok(DispatchOutcome::Skipped(envelope)) => body.skip_cache.push_back(envelope),
				Ok(_) => {
					if !body.exit.is_alive() {
						return Err(ActorExited(planned_reason(&body)));
					}
				},
				Err(envelope) => match dispatch_against(&cell, &mut body, behavior, envelope) {
					DispatchOutcome::Consumed { .. } =>
						return if body.exit.is_alive() {
							Ok(())
						} else {
							Err(ActorExited(planned_reason(&body)))
						},
					DispatchOutcome::Skipped(envelope) => body.skip_cache.push_back(envelope),
					DispatchOutcome::Dropped => {},
					DispatchOutcome::Terminated =>
						return Err(ActorExited(planned_reason(&body))),
				},
			}
		}
	}

	/// Receives while `pred` stays true (checked before each receive).
	pub fn receive_while(
		&mut self,
		mut pred: impl FnMut() -> bool,
		behavior: &mut Behavior<'_, S>,
	) -> Result<(), ActorExited> {
		while pred() {
			self.receive(behavior)?;
		}
		Ok(())
	}

	/// Receives exactly `times` messages.
	pub fn receive_for(
		&mut self,
		times: usize,
		behavior: &mut Behavior<'_, S>,
	) -> Result<(), ActorExited> {
		for _ in 0..times {
			self.receive(behavior)?;
		}
		Ok(())
	}

	/// `do_receive(b).until(pred)`: receive repeatedly until `pred` turns
	/// true (checked after each receive).
	pub fn do_receive<'a, 'b, 'c>(
		&'a mut self,
		behavior: &'b mut Behavior<'c, S>,
	) -> DoReceive<'a, 'b, 'c, S> {
		DoReceive { actor: self, behavior }
	}

	/// Waits for the exact response of `future`, dispatching it against
	/// `behavior`. Everything else that arrives meanwhile is parked in the
	/// skip cache. Times out after the default sync timeout.
	pub fn receive_response(
		&mut self,
		future: &ResponseFuture,
		behavior: &mut Behavior<'_, S>,
	) -> Result<(), AskError> {
		self.receive_response_within(*DEFAULT_SYNC_TIMEOUT, future, behavior)
	}

	pub fn receive_response_within(
		&mut self,
		timeout: Duration,
		future: &ResponseFuture,
		behavior: &mut Behavior<'_, S>,
	) -> Result<(), AskError> {
		let deadline = Instant::now() + timeout;
		let envelope = self.wait_response(future.response_id, deadline)?;
		let cell = self.cell.clone();
		let mut body = cell.body.lock().unwrap();
		match dispatch_against(&cell, &mut body, behavior, envelope) {
			DispatchOutcome::Consumed { .. } =>
				if body.exit.is_alive() {
					Ok(())
				} else {
					Err(AskError::Exited(ActorExited(planned_reason(&body))))
				},
			DispatchOutcome::Skipped(_) => {
				// The awaited response did not match the continuation.
				body.exit = ExitState::Planned(ExitReason::UnhandledSyncFailure);
				Err(AskError::Exited(ActorExited(ExitReason::UnhandledSyncFailure)))
			},
			DispatchOutcome::Dropped => Ok(()),
			DispatchOutcome::Terminated =>
				Err(AskError::Exited(ActorExited(planned_reason(&body)))),
		}
	}

	/// Blocks until the envelope carrying `response_id` arrives, parking
	/// everything else (after classification) in the skip cache.
	fn wait_response(
		&mut self,
		response_id: MessageId,
		deadline: Instant,
	) -> Result<Envelope, AskError> {
		let cell = self.cell.clone();
		let mut body = cell.body.lock().unwrap();
		if let Some(pos) =
			body.skip_cache.iter().position(|envelope| envelope.message_id == response_id)
		{
			let envelope = body.skip_cache.remove(pos).expect("position was just found");
			body.pending_responses.remove(&response_id);
			return Ok(envelope);
		}
		loop {
			if !body.exit.is_alive() {
				return Err(AskError::Exited(ActorExited(planned_reason(&body))));
			}
			let envelope = match body.try_pop() {
				Some(envelope) => envelope,
				None => {
					let recv_result = {
						let Some(mailbox_rx) = body.mailbox_rx.as_ref() else {
							return Err(AskError::Exited(ActorExited(planned_reason(&body))));
						};
						mailbox_rx.recv_deadline(deadline)
					};
					match recv_result {
						Ok(envelope) => envelope,
						Err(RecvError::NoMessageAvailable) => {
							body.pending_responses.remove(&response_id);
							return Err(AskError::Timeout);
						},
						Err(RecvError::Disconnected) =>
							return Err(AskError::Exited(ActorExited(planned_reason(&body)))),
					}
				},
			};
			if envelope.message_id == response_id {
				body.pending_responses.remove(&response_id);
				return Ok(envelope);
			}
			match dispatch_system(&cell, &mut body, envelope) {
				Ok(DispatchOutcome::Terminated) =>
					return Err(AskError::Exited(ActorExited(planned_reason(&body)))),
				Ok(DispatchOutcome::Skipped(envelope)) => body.skip_cache.push_back(envelope),
				Ok(_) => {},
				// Ordinary traffic waits for the next plain `receive`.
				Err(envelope) => body.skip_cache.push_back(envelope),
			}
		}
	}
}

pub struct DoReceive<'a, 'b, 'c, S: Send + 'static> {
	actor: &'a mut BlockingActor<S>,
	behavior: &'b mut Behavior<'c, S>,
}

impl<'a, 'b, 'c, S: Send + 'static> DoReceive<'a, 'b, 'c, S> {
	pub fn until(self, mut pred: impl FnMut() -> bool) -> Result<(), ActorExited> {
		loop {
			self.actor.receive(self.behavior)?;
			if pred() {
				return Ok(());
			}
		}
	}
}

/// Replays the skip cache against a behavior that just took effect. Returns
/// true if an envelope was consumed.
fn replay_against<S: Send + 'static>(
	cell: &Arc<ActorCell<S>>,
	body: &mut CellBody<S>,
	behavior: &mut Behavior<'_, S>,
) -> Result<bool, ActorExited> {
	let mut consumed = false;
	let mut retained: VecDeque<Envelope> = VecDeque::new();
	while let Some(envelope) = body.skip_cache.pop_front() {
		if consumed {
			retained.push_back(envelope);
			continue;
		}
		match dispatch_system(cell, body, envelope) {
			Ok(DispatchOutcome::Skipped(envelope)) => retained.push_back(envelope),
			Ok(DispatchOutcome::Terminated) => {
				restore_cache(body, retained);
				return Err(ActorExited(planned_reason(body)));
			},
			Ok(_) => {},
			Err(envelope) => match dispatch_against(cell, body, behavior, envelope) {
				DispatchOutcome::Consumed { .. } => consumed = true,
				DispatchOutcome::Skipped(envelope) => retained.push_back(envelope),
				DispatchOutcome::Dropped => {},
				DispatchOutcome::Terminated => {
					restore_cache(body, retained);
					return Err(ActorExited(planned_reason(body)));
				},
			},
		}
		if !body.exit.is_alive() {
			restore_cache(body, retained);
			return Err(ActorExited(planned_reason(body)));
		}
	}
	body.skip_cache = retained;
	Ok(consumed)
}

fn restore_cache<S>(body: &mut CellBody<S>, mut retained: VecDeque<Envelope>) {
	while let Some(envelope) = body.skip_cache.pop_front() {
		retained.push_back(envelope);
	}
	body.skip_cache = retained;
}

fn planned_reason<S>(body: &CellBody<S>) -> ExitReason {
	match &body.exit {
		ExitState::Planned(reason) | ExitState::Dead(reason) => reason.clone(),
		ExitState::Alive => ExitReason::Normal,
	}
}

/// Thread body of a spawned blocking actor: run the user code, map its
/// outcome to an exit reason, clean up.
pub(crate) fn run_blocking<S, F>(cell: Arc<ActorCell<S>>, body_fn: F)
where
	S: Send + 'static,
	F: FnOnce(&mut BlockingActor<S>) -> anyhow::Result<()>,
{
	let mut actor = BlockingActor::from_cell(cell.clone());
	let outcome = catch_unwind(AssertUnwindSafe(move || body_fn(&mut actor)));
	let unwind_reason = match outcome {
		Ok(Ok(())) => ExitReason::Normal,
		Ok(Err(error)) => match error.downcast::<ActorExited>() {
			Ok(exited) => exited.0,
			Err(other) => {
				error!(actor_id = %cell.instance_id(), cause = ?other, "blocking-actor-failed");
				ExitReason::UnhandledException
			},
		},
		Err(_payload) => {
			error!(actor_id = %cell.instance_id(), "blocking-actor-panicked");
			ExitReason::UnhandledException
		},
	};
	let mut body = cell.body.lock().unwrap();
	// A planned quit carries the authoritative reason.
	let reason = match &body.exit {
		ExitState::Planned(planned) => planned.clone(),
		_ => unwind_reason,
	};
	cleanup_common(&cell, &mut body, reason);
}

/// Owns a blocking actor for the lifetime of a scope, so a non-actor thread
/// can participate in communication as an anonymous peer. On scope exit the
/// actor terminates with reason `Normal`.
pub struct ScopedActor<S: Send + 'static = ()> {
	actor: BlockingActor<S>,
}

impl<S: Send + 'static> ScopedActor<S> {
	pub(crate) fn new(actor: BlockingActor<S>) -> ScopedActor<S> {
		ScopedActor { actor }
	}
}

impl<S: Send + 'static> Deref for ScopedActor<S> {
	type Target = BlockingActor<S>;

	fn deref(&self) -> &Self::Target {
		&self.actor
	}
}

impl<S: Send + 'static> DerefMut for ScopedActor<S> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.actor
	}
}

impl<S: Send + 'static> Drop for ScopedActor<S> {
	fn drop(&mut self) {
		let cell = self.actor.cell.clone();
		let mut body = cell.body.lock().unwrap();
		if matches!(body.exit, ExitState::Dead(_)) {
			return;
		}
		let reason = planned_reason(&body);
		cleanup_common(&cell, &mut body, reason);
	}
}
