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

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
	actor::{
		Actor, ActorAddr, ActorId, ActorRef, DemonitorMsg, ExitMsg, ExitReason, FnActor, LinkMsg,
		MonitorMsg, SyncTimeoutMsg, UnlinkMsg,
	},
	actor_cell::{ActorCell, Hook},
	behavior::{Behavior, Handled},
	envelope::{Envelope, MessageId},
	mailbox::Priority,
	message::Message,
	msg,
	troupe::{SpawnOptions, Troupe},
};

/// Deferred mutation of the actor's own state, recorded by the context while
/// a handler runs and applied when it returns.
///
/// Sends go out immediately (preserving per-sender FIFO order); everything
/// touching the behavior stack or the actor's bookkeeping waits until the
/// dispatcher has the body back, so a handler can never free the behavior it
/// is executing in.
pub(crate) enum CtxOp<A> {
	Become { behavior: Behavior<'static, A>, keep: bool },
	Unbecome,
	Quit(ExitReason),
	TrapExit(bool),
	AddLink(ActorAddr),
	RemoveLink(ActorAddr),
	AddPendingResponse(MessageId),
	AddContinuation(MessageId, Behavior<'static, A>),
	SetSyncFailureHook(Hook<A>),
	SetSyncTimeoutHook(Hook<A>),
}

/// The capability set of a running actor: everything a message handler (or
/// `make_behavior`/`on_exit`) may do.
///
/// A fresh context is handed to each invocation; the current envelope's
/// sender and request id are snapshotted into it so replies and response
/// promises can be built.
pub struct ActorContext<A> {
	cell: Arc<ActorCell<A>>,
	current_sender: Option<ActorAddr>,
	current_message_id: MessageId,
	/// Set once a response promise is taken, to suppress the automatic
	/// reply for this envelope.
	pub(crate) replied: bool,
	pub(crate) ops: Vec<CtxOp<A>>,
}

impl<A: Send + 'static> ActorContext<A> {
	pub(crate) fn new(
		cell: Arc<ActorCell<A>>,
		current_sender: Option<ActorAddr>,
		current_message_id: MessageId,
	) -> Self {
		ActorContext { cell, current_sender, current_message_id, replied: false, ops: Vec::new() }
	}

	pub(crate) fn take_ops(&mut self) -> Vec<CtxOp<A>> {
		std::mem::take(&mut self.ops)
	}

	pub fn id(&self) -> ActorId {
		self.cell.id()
	}

	pub fn instance_id(&self) -> &str {
		self.cell.instance_id()
	}

	/// Non-owning address of this actor.
	pub fn addr(&self) -> ActorAddr {
		self.cell.addr()
	}

	/// Owning handle to this actor.
	pub fn self_ref(&self) -> ActorRef {
		self.cell.actor_ref().expect("the running actor holds its own cell alive")
	}

	/// Sender of the envelope currently being handled, if any.
	pub fn sender(&self) -> Option<&ActorAddr> {
		self.current_sender.as_ref()
	}

	pub(crate) fn runtime(&self) -> &Troupe {
		self.cell.runtime()
	}

	/// The well-known printer actor.
	pub fn printer(&self) -> ActorRef {
		self.runtime().printer()
	}


	/// Asynchronous send with normal priority, sender = self.
	pub fn send(&self, dest: &ActorRef, message: Message) {
		self.send_with_priority(Priority::Normal, dest, message);
	}

	pub fn send_with_priority(&self, priority: Priority, dest: &ActorRef, message: Message) {
		debug!(from = %self.instance_id(), to = %dest.instance_id(), msg = ?message, "send");
		dest.deliver(Envelope::asynchronous(Some(self.addr()), message), priority);
	}

	/// Send to an address. If the peer is already gone, the message is
	/// silently dropped.
	pub fn send_to(&self, dest: &ActorAddr, message: Message) {
		if let Some(dest) = dest.upgrade() {
			self.send(&dest, message);
		}
	}

	/// Sends a synthesized exit message, as if this actor had terminated
	/// with `reason`.
	pub fn send_exit(&self, dest: &ActorAddr, reason: ExitReason) {
		if let Some(dest) = dest.upgrade() {
			debug!(from = %self.instance_id(), to = %dest.instance_id(), reason = %reason, "send-exit");
			dest.deliver(
				Envelope::asynchronous(
					Some(self.addr()),
					msg![ExitMsg { source: Some(self.addr()), reason }],
				),
				Priority::Normal,
			);
		}
	}

	/// Hands the message to the timer service, which re-injects it as a
	/// normal send once `delay` has elapsed.
	pub fn delayed_send(&self, dest: &ActorRef, delay: Duration, message: Message) {
		self.delayed_send_with_priority(Priority::Normal, dest, delay, message);
	}

	pub fn delayed_send_with_priority(
		&self,
		priority: Priority,
		dest: &ActorRef,
		delay: Duration,
		message: Message,
	) {
		self.runtime().timer().schedule(
			delay,
			dest.clone(),
			Envelope::asynchronous(Some(self.addr()), message),
			priority,
		);
	}


	/// Establishes a bidirectional link: when either side terminates
	/// abnormally, the other terminates with the same reason (unless it
	/// traps exits).
	pub fn link_to(&mut self, peer: ActorAddr) {
		if let Some(peer_ref) = peer.upgrade() {
			peer_ref.deliver(
				Envelope::asynchronous(Some(self.addr()), msg![LinkMsg { peer: self.addr() }]),
				Priority::Normal,
			);
		}
		self.ops.push(CtxOp::AddLink(peer));
	}

	pub fn unlink_from(&mut self, peer: ActorAddr) {
		if let Some(peer_ref) = peer.upgrade() {
			peer_ref.deliver(
				Envelope::asynchronous(Some(self.addr()), msg![UnlinkMsg { peer: self.addr() }]),
				Priority::Normal,
			);
		}
		self.ops.push(CtxOp::RemoveLink(peer));
	}

	/// Asks `peer` to send a [`crate::DownMsg`] to this actor when it
	/// terminates.
	pub fn monitor(&self, peer: &ActorAddr) {
		if let Some(peer_ref) = peer.upgrade() {
			peer_ref.deliver(
				Envelope::asynchronous(
					Some(self.addr()),
					msg![MonitorMsg { observer: self.addr() }],
				),
				Priority::Normal,
			);
		}
	}

	pub fn demonitor(&self, peer: &ActorAddr) {
		if let Some(peer_ref) = peer.upgrade() {
			peer_ref.deliver(
				Envelope::asynchronous(
					Some(self.addr()),
					msg![DemonitorMsg { observer: self.addr() }],
				),
				Priority::Normal,
			);
		}
	}

	/// With the flag set, inbound exit messages are delivered as ordinary
	/// messages instead of terminating the actor.
	pub fn trap_exit(&mut self, flag: bool) {
		self.ops.push(CtxOp::TrapExit(flag));
	}


	/// Replaces the current behavior once the running handler returns.
	pub fn become_(&mut self, behavior: Behavior<'static, A>) {
		self.ops.push(CtxOp::Become { behavior, keep: false });
	}

	/// Pushes a behavior, keeping the current one underneath.
	pub fn become_keep(&mut self, behavior: Behavior<'static, A>) {
		self.ops.push(CtxOp::Become { behavior, keep: true });
	}

	/// Pops the top of the behavior stack. An actor whose stack empties
	/// terminates.
	pub fn unbecome(&mut self) {
		self.ops.push(CtxOp::Unbecome);
	}

	/// Plans the actor's termination: cleanup runs after the current handler
	/// returns.
	pub fn quit(&mut self, reason: ExitReason) {
		self.ops.push(CtxOp::Quit(reason));
	}

	/// Returns a fresh request id and records the matching response id in the
	/// pending-response set.
	pub fn new_request_id(&mut self) -> MessageId {
		let request_id = self.cell.next_request_id();
		self.ops.push(CtxOp::AddPendingResponse(request_id.response_id()));
		request_id
	}

	/// Sends `message` as a request and installs `continuation` for the
	/// response: when the response envelope arrives, the dispatcher runs the
	/// continuation instead of the current behavior. Returns the awaited
	/// response id.
	pub fn sync_send(
		&mut self,
		dest: &ActorRef,
		message: Message,
		continuation: Behavior<'static, A>,
	) -> MessageId {
		let request_id = self.cell.next_request_id();
		let response_id = request_id.response_id();
		self.ops.push(CtxOp::AddPendingResponse(response_id));
		self.ops.push(CtxOp::AddContinuation(response_id, continuation));
		debug!(from = %self.instance_id(), to = %dest.instance_id(), msg = ?message, "sync-send");
		dest.deliver(Envelope::request(Some(self.addr()), request_id, message), Priority::Normal);
		response_id
	}

	/// Like [`ActorContext::sync_send`], with a deadline: if no response
	/// arrived after `timeout`, a sync-timeout message is delivered instead.
	pub fn timed_sync_send(
		&mut self,
		dest: &ActorRef,
		timeout: Duration,
		message: Message,
		continuation: Behavior<'static, A>,
	) -> MessageId {
		let response_id = self.sync_send(dest, message, continuation);
		self.runtime().timer().schedule(
			timeout,
			self.self_ref(),
			Envelope::asynchronous(None, msg![SyncTimeoutMsg { response_id }]),
			Priority::Normal,
		);
		response_id
	}

	/// Snapshots the current envelope's request id and sender into a
	/// first-class promise that can be fulfilled later, from any code holding
	/// it. The automatic reply for this envelope is suppressed.
	///
	/// If the current envelope is not a request, the promise is invalid and
	/// fulfilling it is a no-op.
	pub fn make_response_promise(&mut self) -> ResponsePromise {
		if !self.current_message_id.is_request() {
			return ResponsePromise { target: None, request_id: MessageId::ASYNC, responder: None };
		}
		self.replied = true;
		ResponsePromise {
			target: self.current_sender.clone(),
			request_id: self.current_message_id,
			responder: Some(self.addr()),
		}
	}

	/// Installs a hook running instead of terminating the actor when a sync
	/// response fails to match its continuation.
	pub fn on_sync_failure(
		&mut self,
		hook: impl FnMut(&mut A, &mut ActorContext<A>, &Message) -> Handled + Send + 'static,
	) {
		self.ops.push(CtxOp::SetSyncFailureHook(Box::new(hook)));
	}

	/// Installs a hook running instead of terminating the actor when a timed
	/// sync send expires.
	pub fn on_sync_timeout(
		&mut self,
		hook: impl FnMut(&mut A, &mut ActorContext<A>, &Message) -> Handled + Send + 'static,
	) {
		self.ops.push(CtxOp::SetSyncTimeoutHook(Box::new(hook)));
	}
}

impl<A: Actor> ActorContext<A> {
	/// Spawns a new actor. With [`SpawnOptions::linked`] the new actor is
	/// atomically linked to this one; with [`SpawnOptions::monitored`] this
	/// actor observes the new one.
	pub fn spawn<Spawned: Actor>(&mut self, options: SpawnOptions, actor: Spawned) -> ActorRef {
		let linked = options.linked;
		let child = self.runtime().spawn_with_parent(options, actor, Some(self.addr()));
		if linked {
			self.ops.push(CtxOp::AddLink(child.downgrade()));
		}
		child
	}

	/// Function-based counterpart of [`ActorContext::spawn`].
	pub fn spawn_fn(
		&mut self,
		options: SpawnOptions,
		factory: impl FnOnce(&mut ActorContext<FnActor>) -> Behavior<'static, FnActor>
		+ Send
		+ 'static,
	) -> ActorRef {
		self.spawn(options, FnActor::new(factory))
	}
}

/// A first-class handle to the deferred reply of a received request.
///
/// Obtained via [`ActorContext::make_response_promise`]; fulfilling it
/// delivers the response envelope to the original requester.
pub struct ResponsePromise {
	target: Option<ActorAddr>,
	request_id: MessageId,
	responder: Option<ActorAddr>,
}

impl ResponsePromise {
	/// False if the envelope the promise was made from was not a request.
	pub fn is_valid(&self) -> bool {
		self.request_id.is_request() && self.target.is_some()
	}

	/// Fulfills the promise. Delivery is a no-op for an invalid promise or a
	/// requester that already terminated.
	pub fn deliver(self, message: Message) {
		if !self.is_valid() {
			return;
		}
		if let Some(target) = self.target.as_ref().and_then(ActorAddr::upgrade) {
			target.deliver(
				Envelope::response(self.responder.clone(), self.request_id, message),
				Priority::Normal,
			);
		}
	}
}
