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

use std::{any::TypeId, fmt, time::Duration};

use crate::{actor_context::ActorContext, message::Message};

/// Outcome of one match-case invocation.
#[derive(Debug)]
pub enum Handled {
	/// The message was consumed.
	Done,
	/// The message was consumed and, if it was a request, the value is sent
	/// back to the requester as the response.
	Reply(Message),
	/// The current behavior does not want this message yet. The envelope is
	/// parked in the skip cache and re-presented when the behavior changes.
	Skip,
}

type Action<'a, A> = Box<dyn FnMut(&mut A, &mut ActorContext<A>, &Message) -> Handled + Send + 'a>;
type TimeoutAction<'a, A> = Box<dyn FnMut(&mut A, &mut ActorContext<A>) + Send + 'a>;

enum PatternKind {
	/// Element-wise type-tag match.
	Types(Vec<TypeId>),
	/// Structural equality against a reference message.
	Value(Message),
	CatchAll,
}

/// What a match case matches on: a tuple of element types, a concrete tuple
/// value, or everything.
pub struct CasePattern {
	kind: PatternKind,
}

impl CasePattern {
	pub fn types<P: TuplePattern>() -> CasePattern {
		CasePattern { kind: PatternKind::Types(P::type_ids()) }
	}

	pub fn value(reference: Message) -> CasePattern {
		CasePattern { kind: PatternKind::Value(reference) }
	}

	pub fn catch_all() -> CasePattern {
		CasePattern { kind: PatternKind::CatchAll }
	}

	fn matches(&self, message: &Message) -> bool {
		match &self.kind {
			PatternKind::Types(tags) => message.has_types(tags),
			PatternKind::Value(reference) => message == reference,
			PatternKind::CatchAll => true,
		}
	}
}

/// Shorthand for [`CasePattern::types`].
pub fn types<P: TuplePattern>() -> CasePattern {
	CasePattern::types::<P>()
}

/// Shorthand for [`CasePattern::value`].
pub fn value(reference: Message) -> CasePattern {
	CasePattern::value(reference)
}

/// A tuple of `'static` types usable as a type pattern, e.g. `(Ping, u32)`.
pub trait TuplePattern {
	fn type_ids() -> Vec<TypeId>;
}

macro_rules! impl_tuple_pattern {
	($($name:ident),*) => {
		impl<$($name: 'static),*> TuplePattern for ($($name,)*) {
			fn type_ids() -> Vec<TypeId> {
				vec![$(TypeId::of::<$name>()),*]
			}
		}
	};
}

impl_tuple_pattern!();
impl_tuple_pattern!(T0);
impl_tuple_pattern!(T0, T1);
impl_tuple_pattern!(T0, T1, T2);
impl_tuple_pattern!(T0, T1, T2, T3);
impl_tuple_pattern!(T0, T1, T2, T3, T4);
impl_tuple_pattern!(T0, T1, T2, T3, T4, T5);
impl_tuple_pattern!(T0, T1, T2, T3, T4, T5, T6);
impl_tuple_pattern!(T0, T1, T2, T3, T4, T5, T6, T7);

struct MatchCase<'a, A> {
	pattern: CasePattern,
	action: Action<'a, A>,
}

/// An ordered list of match cases plus an optional timeout with handler.
///
/// Behaviors are first-class: actors install them with
/// [`ActorContext::become_`], push them with [`ActorContext::become_keep`]
/// and pop them with [`ActorContext::unbecome`]. Cases are tried in
/// declaration order, first match wins. The only externally visible state of
/// a behavior is whether it carries a timeout.
///
/// The lifetime parameter is `'static` for behaviors installed on an actor;
/// blocking-mode `receive` calls accept behaviors borrowing from the caller's
/// stack frame.
pub struct Behavior<'a, A> {
	cases: Vec<MatchCase<'a, A>>,
	timeout: Option<(Duration, TimeoutAction<'a, A>)>,
}

impl<'a, A> Default for Behavior<'a, A> {
	fn default() -> Self {
		Behavior::new()
	}
}

impl<'a, A> Behavior<'a, A> {
	pub fn new() -> Behavior<'a, A> {
		Behavior { cases: Vec::new(), timeout: None }
	}

	/// Appends a match case.
	pub fn on(
		mut self,
		pattern: CasePattern,
		action: impl FnMut(&mut A, &mut ActorContext<A>, &Message) -> Handled + Send + 'a,
	) -> Self {
		self.cases.push(MatchCase { pattern, action: Box::new(action) });
		self
	}

	/// Appends a catch-all case.
	pub fn otherwise(
		self,
		action: impl FnMut(&mut A, &mut ActorContext<A>, &Message) -> Handled + Send + 'a,
	) -> Self {
		self.on(CasePattern::catch_all(), action)
	}

	/// Arms a timeout: if the behavior stays current for `duration` without
	/// consuming a message, the handler runs.
	pub fn after(
		mut self,
		duration: Duration,
		action: impl FnMut(&mut A, &mut ActorContext<A>) + Send + 'a,
	) -> Self {
		self.timeout = Some((duration, Box::new(action)));
		self
	}

	pub fn has_timeout(&self) -> bool {
		self.timeout.is_some()
	}

	pub(crate) fn timeout_duration(&self) -> Option<Duration> {
		self.timeout.as_ref().map(|(duration, _)| *duration)
	}

	/// Index of the first case matching `message`, in declaration order.
	pub(crate) fn find_match(&self, message: &Message) -> Option<usize> {
		self.cases.iter().position(|case| case.pattern.matches(message))
	}

	pub(crate) fn invoke(
		&mut self,
		case_idx: usize,
		state: &mut A,
		ctx: &mut ActorContext<A>,
		message: &Message,
	) -> Handled {
		(self.cases[case_idx].action)(state, ctx, message)
	}

	pub(crate) fn invoke_timeout(&mut self, state: &mut A, ctx: &mut ActorContext<A>) {
		if let Some((_, action)) = self.timeout.as_mut() {
			action(state, ctx);
		}
	}
}

impl<'a, A> fmt::Debug for Behavior<'a, A> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Behavior")
			.field("cases", &self.cases.len())
			.field("has_timeout", &self.has_timeout())
			.finish()
	}
}

/// A behavior installed on the stack, together with the id of the timeout it
/// armed last. Timeout envelopes carrying any other id are stale.
pub(crate) struct StackEntry<A> {
	pub(crate) behavior: Behavior<'static, A>,
	pub(crate) armed_timeout_id: Option<u64>,
}

/// Where a timeout id points to within the stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TimeoutSlot {
	/// Armed by the current top behavior: the timeout fires.
	ActiveTop,
	/// Armed by a behavior below the top: kept around, it may become active
	/// again when the stack pops back to its behavior.
	InactiveLower,
	/// Armed by nobody on the stack: stale, dropped.
	Stale,
}

/// The per-actor behavior stack. Top is current.
///
/// The dispatcher moves the top entry out of the stack while it invokes the
/// behavior, so a handler can never free the behavior it is running in;
/// mutations requested by the handler are applied when it returns.
pub(crate) struct BehaviorStack<A> {
	entries: Vec<StackEntry<A>>,
}

impl<A> Default for BehaviorStack<A> {
	fn default() -> Self {
		BehaviorStack { entries: Vec::new() }
	}
}

impl<A> BehaviorStack<A> {
	pub(crate) fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Replaces the top behavior (or installs the first one).
	pub(crate) fn push_replace(&mut self, behavior: Behavior<'static, A>) {
		self.entries.pop();
		self.push_keep(behavior);
	}

	/// Pushes on top, keeping the previous behavior underneath.
	pub(crate) fn push_keep(&mut self, behavior: Behavior<'static, A>) {
		self.entries.push(StackEntry { behavior, armed_timeout_id: None });
	}

	pub(crate) fn pop(&mut self) {
		self.entries.pop();
	}

	pub(crate) fn clear(&mut self) {
		self.entries.clear();
	}

	pub(crate) fn top_mut(&mut self) -> Option<&mut StackEntry<A>> {
		self.entries.last_mut()
	}

	/// Moves the top entry out for the duration of an invocation.
	pub(crate) fn take_top(&mut self) -> Option<StackEntry<A>> {
		self.entries.pop()
	}

	pub(crate) fn restore_top(&mut self, entry: StackEntry<A>) {
		self.entries.push(entry);
	}

	pub(crate) fn classify_timeout(&self, timeout_id: u64) -> TimeoutSlot {
		match self.entries.iter().rposition(|entry| entry.armed_timeout_id == Some(timeout_id)) {
			Some(pos) if pos + 1 == self.entries.len() => TimeoutSlot::ActiveTop,
			Some(_) => TimeoutSlot::InactiveLower,
			None => TimeoutSlot::Stale,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::msg;

	struct Probe;

	#[test]
	fn test_first_match_wins() {
		let behavior: Behavior<Probe> = Behavior::new()
			.on(types::<(u32,)>(), |_, _, _| Handled::Done)
			.on(types::<(u32,)>(), |_, _, _| Handled::Skip)
			.otherwise(|_, _, _| Handled::Done);
		assert_eq!(behavior.find_match(&msg![1u32]), Some(0));
		assert_eq!(behavior.find_match(&msg!["text"]), Some(2));
	}

	#[test]
	fn test_type_pattern_requires_exact_arity() {
		let behavior: Behavior<Probe> =
			Behavior::new().on(types::<(u32, &str)>(), |_, _, _| Handled::Done);
		assert_eq!(behavior.find_match(&msg![1u32, "a"]), Some(0));
		assert_eq!(behavior.find_match(&msg![1u32]), None);
		assert_eq!(behavior.find_match(&msg![1u32, "a", 2u32]), None);
	}

	#[test]
	fn test_value_pattern() {
		let behavior: Behavior<Probe> =
			Behavior::new().on(value(msg!["kickoff", 3u32]), |_, _, _| Handled::Done);
		assert_eq!(behavior.find_match(&msg!["kickoff", 3u32]), Some(0));
		assert_eq!(behavior.find_match(&msg!["kickoff", 4u32]), None);
	}

	#[test]
	fn test_has_timeout_is_the_only_visible_state() {
		let without: Behavior<Probe> = Behavior::new();
		assert!(!without.has_timeout());
		let with: Behavior<Probe> =
			Behavior::new().after(Duration::from_millis(10), |_, _| {});
		assert!(with.has_timeout());
		assert_eq!(with.timeout_duration(), Some(Duration::from_millis(10)));
	}

	#[test]
	fn test_stack_timeout_classification() {
		let mut stack: BehaviorStack<Probe> = BehaviorStack::default();
		stack.push_keep(Behavior::new());
		stack.top_mut().unwrap().armed_timeout_id = Some(1);
		stack.push_keep(Behavior::new());
		stack.top_mut().unwrap().armed_timeout_id = Some(2);
		assert_eq!(stack.classify_timeout(2), TimeoutSlot::ActiveTop);
		assert_eq!(stack.classify_timeout(1), TimeoutSlot::InactiveLower);
		assert_eq!(stack.classify_timeout(17), TimeoutSlot::Stale);
	}

	#[test]
	fn test_push_replace_swaps_top() {
		let mut stack: BehaviorStack<Probe> = BehaviorStack::default();
		stack.push_keep(Behavior::new().otherwise(|_, _, _| Handled::Done));
		stack.push_replace(Behavior::new());
		stack.pop();
		assert!(stack.is_empty());
	}
}
