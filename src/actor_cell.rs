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
	collections::{HashMap, HashSet, VecDeque},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, Weak,
	},
};

use crate::{
	actor::{ActorAddr, ActorId, ActorRef, AnyActorCell, ErrorMsg, ExitReason},
	actor_context::ActorContext,
	actor_state::{AtomicState, WakeAction},
	behavior::{Behavior, BehaviorStack, Handled},
	envelope::{Envelope, MessageId},
	mailbox::{create_mailbox, MailboxReceiver, MailboxSender, Priority},
	message::Message,
	msg,
	quid::new_quid,
	scheduler::Resumable,
	troupe::Troupe,
};

/// Exit state of an actor, as seen from inside the actor.
pub(crate) enum ExitState {
	Alive,
	/// `quit` was called (or an un-trapped exit arrived); cleanup runs once
	/// the current handler returns.
	Planned(ExitReason),
	Dead(ExitReason),
}

impl ExitState {
	pub(crate) fn is_alive(&self) -> bool {
		matches!(self, ExitState::Alive)
	}
}

/// How the actor gets execution time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SchedulePolicy {
	/// Cooperatively scheduled on the worker pool.
	Pool,
	/// Owns a dedicated thread (detached event actors and blocking actors);
	/// wake-ups travel through the mailbox signal instead of the scheduler.
	Dedicated,
}

/// Hook invoked for sync failures and sync timeouts.
pub(crate) type Hook<A> =
	Box<dyn FnMut(&mut A, &mut ActorContext<A>, &Message) -> Handled + Send>;

/// The exclusive part of an actor: everything only the thread currently
/// executing the actor may touch.
pub(crate) struct CellBody<A> {
	/// The user state. Taken out for the duration of a handler invocation.
	pub(crate) state_opt: Option<A>,
	/// Consumer side of the mailbox. `None` once the mailbox is closed.
	pub(crate) mailbox_rx: Option<MailboxReceiver>,
	pub(crate) behaviors: BehaviorStack<A>,
	/// Envelopes the current behavior chose to skip, in arrival order.
	pub(crate) skip_cache: VecDeque<Envelope>,
	/// Response ids the actor is still awaiting.
	pub(crate) pending_responses: HashSet<MessageId>,
	/// Response-id-keyed one-shot continuations installed by `sync_send`.
	pub(crate) continuations: HashMap<MessageId, Behavior<'static, A>>,
	/// Peers to notify with an exit message on termination.
	pub(crate) links: HashSet<ActorAddr>,
	/// Peers to notify with a down message on termination.
	pub(crate) monitors: HashSet<ActorAddr>,
	pub(crate) trap_exit: bool,
	pub(crate) exit: ExitState,
	pub(crate) timeout_id_seq: u64,
	pub(crate) initialized: bool,
	pub(crate) sync_failure_hook: Option<Hook<A>>,
	pub(crate) sync_timeout_hook: Option<Hook<A>>,
}

impl<A> CellBody<A> {
	pub(crate) fn try_pop(&self) -> Option<Envelope> {
		self.mailbox_rx.as_ref()?.try_pop()
	}

	pub(crate) fn can_fetch_more(&self) -> bool {
		self.mailbox_rx.as_ref().map_or(false, MailboxReceiver::can_fetch_more)
	}

	pub(crate) fn next_timeout_id(&mut self) -> u64 {
		self.timeout_id_seq += 1;
		self.timeout_id_seq
	}
}

/// One actor: the shared core plus the mutex-protected exclusive body.
///
/// The body mutex is uncontended by construction (exactly one logical
/// consumer at a time); it exists so the cell can travel between worker
/// threads.
pub(crate) struct ActorCell<A> {
	id: ActorId,
	instance_id: String,
	mailbox_tx: MailboxSender,
	state: AtomicState,
	policy: SchedulePolicy,
	hidden: bool,
	runtime: Troupe,
	self_weak: Weak<ActorCell<A>>,
	/// Strong self-reference held while the actor is attached to the
	/// scheduler. A parked actor still owns it; cleanup releases it.
	sched_ref: Mutex<Option<Arc<dyn Resumable>>>,
	request_id_seq: AtomicU64,
	/// Exit code once terminated; `u64::MAX` while alive.
	exit_code: AtomicU64,
	pub(crate) body: Mutex<CellBody<A>>,
}

impl<A: Send + 'static> ActorCell<A> {
	pub(crate) fn create(
		state: A,
		name: &str,
		policy: SchedulePolicy,
		priority_aware: bool,
		hidden: bool,
		runtime: Troupe,
	) -> Arc<ActorCell<A>> {
		let (mailbox_tx, mailbox_rx) = create_mailbox(priority_aware);
		Arc::new_cyclic(|self_weak| ActorCell {
			id: crate::actor::next_actor_id(),
			instance_id: new_quid(name),
			mailbox_tx,
			state: AtomicState::default(),
			policy,
			hidden,
			runtime,
			self_weak: self_weak.clone(),
			sched_ref: Mutex::new(None),
			request_id_seq: AtomicU64::new(0),
			exit_code: AtomicU64::new(u64::MAX),
			body: Mutex::new(CellBody {
				state_opt: Some(state),
				mailbox_rx: Some(mailbox_rx),
				behaviors: BehaviorStack::default(),
				skip_cache: VecDeque::new(),
				pending_responses: HashSet::new(),
				continuations: HashMap::new(),
				links: HashSet::new(),
				monitors: HashSet::new(),
				trap_exit: false,
				exit: ExitState::Alive,
				timeout_id_seq: 0,
				initialized: false,
				sync_failure_hook: None,
				sync_timeout_hook: None,
			}),
		})
	}

	pub(crate) fn id(&self) -> ActorId {
		self.id
	}

	pub(crate) fn instance_id(&self) -> &str {
		&self.instance_id
	}

	pub(crate) fn state(&self) -> &AtomicState {
		&self.state
	}

	pub(crate) fn runtime(&self) -> &Troupe {
		&self.runtime
	}

	pub(crate) fn is_hidden(&self) -> bool {
		self.hidden
	}

	pub(crate) fn addr(&self) -> ActorAddr {
		let weak: Weak<dyn AnyActorCell> = self.self_weak.clone();
		ActorAddr { cell: weak, id: self.id }
	}

	pub(crate) fn actor_ref(&self) -> Option<ActorRef> {
		let cell = self.self_weak.upgrade()?;
		Some(ActorRef { cell })
	}

	pub(crate) fn self_arc(&self) -> Option<Arc<ActorCell<A>>> {
		self.self_weak.upgrade()
	}

	pub(crate) fn next_request_id(&self) -> MessageId {
		MessageId::request(self.request_id_seq.fetch_add(1, Ordering::Relaxed) + 1)
	}

	/// Takes the scheduling reference: `attach_to_scheduler`.
	pub(crate) fn attach_to_scheduler(&self, self_resumable: Arc<dyn Resumable>) {
		*self.sched_ref.lock().unwrap() = Some(self_resumable);
	}

	/// Releases the scheduling reference: `detach_from_scheduler`.
	pub(crate) fn detach_from_scheduler(&self) {
		self.sched_ref.lock().unwrap().take();
	}

	/// Re-enqueues the actor after a producer woke it up.
	pub(crate) fn schedule(&self) {
		match self.policy {
			SchedulePolicy::Pool => {
				let sched_ref = self.sched_ref.lock().unwrap().clone();
				if let Some(resumable) = sched_ref {
					self.runtime.scheduler().enqueue(resumable);
				}
			},
			SchedulePolicy::Dedicated => {
				// The dedicated thread blocks on the mailbox signal and saw
				// the enqueue already.
			},
		}
	}

	pub(crate) fn set_exit_code(&self, reason: &ExitReason) {
		self.exit_code.store(reason.code(), Ordering::Release);
	}

	/// Synthesizes an error response for an undeliverable request envelope.
	/// Non-request envelopes are dropped silently.
	pub(crate) fn bounce(&self, envelope: Envelope) {
		if !envelope.is_request() {
			return;
		}
		let Some(sender) = envelope.sender.as_ref().and_then(ActorAddr::upgrade) else {
			return;
		};
		let reason = match self.exit_code.load(Ordering::Acquire) {
			u64::MAX => ExitReason::Normal,
			code => ExitReason::from_code(code),
		};
		sender.deliver(
			Envelope::response(Some(self.addr()), envelope.message_id, msg![ErrorMsg { reason }]),
			Priority::Normal,
		);
	}
}

impl<A: Send + 'static> AnyActorCell for ActorCell<A> {
	fn id(&self) -> ActorId {
		self.id
	}

	fn instance_id(&self) -> &str {
		&self.instance_id
	}

	fn deliver(&self, envelope: Envelope, priority: Priority) {
		match self.mailbox_tx.enqueue(envelope, priority) {
			Ok(()) => match self.state.wake() {
				WakeAction::Ignore => {},
				WakeAction::Schedule => self.schedule(),
				WakeAction::Dead => {
					// Cleanup won the race; the mailbox is being torn down
					// and the closed-mailbox rule covers this envelope.
				},
			},
			Err(envelope) => self.bounce(envelope),
		}
	}

	fn is_terminated(&self) -> bool {
		self.state.get_state().is_exit()
	}

	fn exit_code(&self) -> Option<u64> {
		match self.exit_code.load(Ordering::Acquire) {
			u64::MAX => None,
			code => Some(code),
		}
	}
}
