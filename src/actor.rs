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

use std::{
	any::type_name,
	fmt,
	hash::{Hash, Hasher},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
};

use thiserror::Error;

use crate::{
	actor_context::ActorContext,
	behavior::Behavior,
	envelope::{Envelope, MessageId},
	mailbox::Priority,
	message::Message,
	msg,
};

/// Process-unique actor id, generated from a monotonically increasing counter.
pub type ActorId = u64;

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_actor_id() -> ActorId {
	ACTOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Exit reasons are integer-coded, like the exit status of a process.
///
/// Codes below [`ExitReason::USER_THRESHOLD`] are reserved for the runtime;
/// user-defined reasons start at the threshold.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExitReason {
	/// Clean termination. Linked peers that do not trap exits ignore it.
	#[error("Normal")]
	Normal,

	/// A message handler panicked out of the actor.
	#[error("UnhandledException")]
	UnhandledException,

	/// A synchronous response arrived but did not match its continuation, and
	/// no sync-failure hook was installed.
	#[error("UnhandledSyncFailure")]
	UnhandledSyncFailure,

	/// A synchronous request timed out, and no sync-timeout hook was
	/// installed.
	#[error("UnhandledSyncTimeout")]
	UnhandledSyncTimeout,

	/// Shutdown was requested from the outside, e.g. by
	/// [`crate::Troupe::shutdown`] or an explicit `send_exit`.
	#[error("UserShutdown")]
	UserShutdown,

	/// Reserved for networked collaborators: a linked peer became
	/// unreachable.
	#[error("RemoteLinkUnreachable")]
	RemoteLinkUnreachable,

	/// Application-defined reason. The code is at least
	/// [`ExitReason::USER_THRESHOLD`].
	#[error("User({0})")]
	User(u64),
}

impl ExitReason {
	/// First exit code available to applications.
	pub const USER_THRESHOLD: u64 = 16;

	/// Builds an application-defined exit reason.
	///
	/// Panics if `code` falls into the range reserved for the runtime.
	pub fn user(code: u64) -> ExitReason {
		assert!(
			code >= Self::USER_THRESHOLD,
			"user exit codes start at {}, got {code}",
			Self::USER_THRESHOLD
		);
		ExitReason::User(code)
	}

	pub fn code(&self) -> u64 {
		match self {
			ExitReason::Normal => 0,
			ExitReason::UnhandledException => 1,
			ExitReason::UnhandledSyncFailure => 2,
			ExitReason::UnhandledSyncTimeout => 3,
			ExitReason::UserShutdown => 4,
			ExitReason::RemoteLinkUnreachable => 5,
			ExitReason::User(code) => *code,
		}
	}

	pub fn from_code(code: u64) -> ExitReason {
		match code {
			0 => ExitReason::Normal,
			1 => ExitReason::UnhandledException,
			2 => ExitReason::UnhandledSyncFailure,
			3 => ExitReason::UnhandledSyncTimeout,
			4 => ExitReason::UserShutdown,
			5 => ExitReason::RemoteLinkUnreachable,
			code => ExitReason::User(code),
		}
	}

	pub fn is_normal(&self) -> bool {
		matches!(self, ExitReason::Normal)
	}
}

/// An event-based actor: a piece of state driven by the behaviors it
/// installs.
///
/// The actor is created by a spawn call, and initialized on its first resume:
/// `make_behavior` runs and its return value becomes the first behavior.
/// After that the actor is entirely message-driven until its behavior stack
/// empties, it quits, or it receives an un-trapped exit.
pub trait Actor: Send + Sized + 'static {
	/// A name identifying the type of actor, used in logs.
	///
	/// It does not need to be instance-unique; every instance additionally
	/// gets a generated instance id.
	fn name(&self) -> String {
		type_name::<Self>().to_string()
	}

	/// Builds the initial behavior.
	///
	/// Calling [`ActorContext::quit`] here terminates the actor before any
	/// message is processed; `on_exit` still runs.
	fn make_behavior(&mut self, ctx: &mut ActorContext<Self>) -> Behavior<'static, Self>;

	/// Hook invoked when the actor terminates, before linked and monitoring
	/// peers are notified.
	///
	/// Installing a new behavior from this hook (via
	/// [`ActorContext::become_`]) aborts the termination: the actor goes back
	/// to processing messages and nobody is notified.
	fn on_exit(&mut self, _ctx: &mut ActorContext<Self>, _reason: &ExitReason) {}
}

type FnActorFactory =
	Box<dyn FnOnce(&mut ActorContext<FnActor>) -> Behavior<'static, FnActor> + Send>;

/// Adapter turning a behavior factory into an [`Actor`], for function-based
/// spawns: the factory runs once on the first resume, and whatever its
/// behaviors capture is the actor state from then on.
pub struct FnActor {
	factory: Option<FnActorFactory>,
}

impl FnActor {
	pub fn new(
		factory: impl FnOnce(&mut ActorContext<FnActor>) -> Behavior<'static, FnActor>
		+ Send
		+ 'static,
	) -> FnActor {
		FnActor { factory: Some(Box::new(factory)) }
	}
}

impl Actor for FnActor {
	fn name(&self) -> String {
		"FnActor".to_string()
	}

	fn make_behavior(&mut self, ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		let factory = self.factory.take().expect("make_behavior runs once");
		factory(ctx)
	}
}

/// Type-erased view of an actor cell, the common denominator every handle
/// needs: an identity and a way to push envelopes at it.
pub(crate) trait AnyActorCell: Send + Sync + 'static {
	fn id(&self) -> ActorId;
	fn instance_id(&self) -> &str;
	/// Enqueues the envelope, waking or re-scheduling the consumer as
	/// needed. On a closed mailbox, request envelopes are bounced with a
	/// synthetic error response and everything else is dropped silently.
	fn deliver(&self, envelope: Envelope, priority: Priority);
	fn is_terminated(&self) -> bool;
	/// Exit code of a terminated actor, if it already terminated.
	fn exit_code(&self) -> Option<u64>;
}

/// An owning, reference-counted handle that keeps the actor alive.
///
/// It is lightweight to clone. Handles compare and hash by actor id.
#[derive(Clone)]
pub struct ActorRef {
	pub(crate) cell: Arc<dyn AnyActorCell>,
}

impl ActorRef {
	pub fn id(&self) -> ActorId {
		self.cell.id()
	}

	pub fn instance_id(&self) -> &str {
		self.cell.instance_id()
	}

	/// Ownership-neutral address of this actor, suitable for link and
	/// monitor sets.
	pub fn downgrade(&self) -> ActorAddr {
		ActorAddr { cell: Arc::downgrade(&self.cell), id: self.cell.id() }
	}

	/// Anonymous asynchronous send: no sender, normal priority.
	pub fn send(&self, message: Message) {
		self.cell.deliver(Envelope::asynchronous(None, message), Priority::Normal);
	}

	pub fn send_with_priority(&self, priority: Priority, message: Message) {
		self.cell.deliver(Envelope::asynchronous(None, message), priority);
	}

	/// Sends a synthesized exit message, as if a linked peer had terminated
	/// with `reason`.
	pub fn send_exit(&self, reason: ExitReason) {
		self.cell
			.deliver(Envelope::asynchronous(None, msg![ExitMsg { source: None, reason }]), Priority::Normal);
	}

	pub fn is_terminated(&self) -> bool {
		self.cell.is_terminated()
	}

	/// Exit reason of a terminated actor, `None` while it is still alive.
	pub fn exit_reason(&self) -> Option<ExitReason> {
		self.cell.exit_code().map(ExitReason::from_code)
	}

	pub(crate) fn deliver(&self, envelope: Envelope, priority: Priority) {
		self.cell.deliver(envelope, priority);
	}
}

impl PartialEq for ActorRef {
	fn eq(&self, other: &Self) -> bool {
		self.id() == other.id()
	}
}

impl Eq for ActorRef {}

impl Hash for ActorRef {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id().hash(state);
	}
}

impl fmt::Debug for ActorRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ActorRef").field(&self.instance_id()).finish()
	}
}

/// A non-owning actor address.
///
/// Addresses do not keep the actor alive, which is what makes arbitrary
/// link/monitor graphs safe: a dead peer is simply absent when notifications
/// are delivered. Addresses compare and hash by actor id.
#[derive(Clone)]
pub struct ActorAddr {
	pub(crate) cell: Weak<dyn AnyActorCell>,
	pub(crate) id: ActorId,
}

impl ActorAddr {
	pub fn id(&self) -> ActorId {
		self.id
	}

	pub fn upgrade(&self) -> Option<ActorRef> {
		self.cell.upgrade().map(|cell| ActorRef { cell })
	}
}

impl PartialEq for ActorAddr {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for ActorAddr {}

impl Hash for ActorAddr {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Debug for ActorAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ActorAddr").field(&self.id).finish()
	}
}

/// Exit notification, delivered to linked peers of a terminated actor.
///
/// Actors with the trap-exit flag receive it as an ordinary message;
/// everyone else terminates with the same reason (unless it is `Normal`).
#[derive(Clone, Debug, PartialEq)]
pub struct ExitMsg {
	/// The terminated peer, `None` for synthesized exits without an origin.
	pub source: Option<ActorAddr>,
	pub reason: ExitReason,
}

/// Down notification, delivered to every monitor of a terminated actor.
#[derive(Clone, Debug, PartialEq)]
pub struct DownMsg {
	pub source: ActorAddr,
	pub reason: ExitReason,
}

/// Behavior-timeout tick. Ids are monotonic per actor: a tick whose id is not
/// armed by a behavior on the stack is stale and dropped.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeoutMsg {
	pub timeout_id: u64,
}

/// Deadline tick for a timed synchronous send, tagged with the awaited
/// response id.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncTimeoutMsg {
	pub response_id: MessageId,
}

/// Synthetic error response: the request could not be or will never be
/// answered (receiver terminated, or its mailbox was already closed).
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMsg {
	pub reason: ExitReason,
}

/// Internal: adds `peer` to the receiver's link set.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LinkMsg {
	pub peer: ActorAddr,
}

/// Internal: removes `peer` from the receiver's link set.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct UnlinkMsg {
	pub peer: ActorAddr,
}

/// Internal: `observer` wants a down notification when the receiver dies.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MonitorMsg {
	pub observer: ActorAddr,
}

/// Internal: `observer` is no longer interested.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DemonitorMsg {
	pub observer: ActorAddr,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_actor_ids_are_unique_and_monotonic() {
		let first = next_actor_id();
		let second = next_actor_id();
		assert!(second > first);
	}

	#[test]
	fn test_exit_reason_codes_round_trip() {
		for reason in [
			ExitReason::Normal,
			ExitReason::UnhandledException,
			ExitReason::UnhandledSyncFailure,
			ExitReason::UnhandledSyncTimeout,
			ExitReason::UserShutdown,
			ExitReason::RemoteLinkUnreachable,
			ExitReason::user(42),
		] {
			assert_eq!(ExitReason::from_code(reason.code()), reason);
		}
	}

	#[test]
	#[should_panic(expected = "user exit codes start at")]
	fn test_reserved_exit_codes_rejected() {
		let _ = ExitReason::user(3);
	}
}
