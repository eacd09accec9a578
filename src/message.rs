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
	any::{Any, TypeId},
	fmt,
	sync::Arc,
};

/// A single element of a [`Message`] tuple.
///
/// The trait is implemented for every `'static` value that is `Send + Sync`,
/// comparable and debug-printable, so in practice any plain message struct
/// qualifies. Elements are read through [`Any`] downcasts, the same way an
/// envelope recovers its typed payload.
pub trait MessageElement: Any + Send + Sync {
	fn as_any(&self) -> &dyn Any;

	/// Structural equality against another element, false if the types differ.
	fn eq_element(&self, other: &dyn MessageElement) -> bool;

	fn fmt_element(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T> MessageElement for T
where T: Any + Send + Sync + PartialEq + fmt::Debug
{
	fn as_any(&self) -> &dyn Any {
		self
	}

	fn eq_element(&self, other: &dyn MessageElement) -> bool {
		other.as_any().downcast_ref::<T>().map_or(false, |other| self == other)
	}

	fn fmt_element(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self:?}")
	}
}

/// An immutable, reference-counted tuple of heterogeneous values.
///
/// Messages are the unit of communication between actors. They are cheap to
/// clone: all clones share the same underlying storage, and no reader can
/// ever observe a mutation. [`Message::drop_front`] and
/// [`Message::drop_back`] hand out windows over the same storage rather than
/// copying elements.
#[derive(Clone)]
pub struct Message {
	elements: Arc<[Box<dyn MessageElement>]>,
	start: usize,
	len: usize,
}

impl Message {
	pub fn empty() -> Message {
		Message { elements: Vec::new().into(), start: 0, len: 0 }
	}

	pub fn from_elements(elements: Vec<Box<dyn MessageElement>>) -> Message {
		let len = elements.len();
		Message { elements: elements.into(), start: 0, len }
	}

	/// Number of elements in this view.
	pub fn size(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// The type tag of element `i`.
	///
	/// Tags compare equal across messages iff the element types are the same.
	/// Panics if `i` is out of range.
	pub fn type_at(&self, i: usize) -> TypeId {
		self.element(i).as_any().type_id()
	}

	/// Read-only access to element `i`. Panics if `i` is out of range.
	pub fn element(&self, i: usize) -> &dyn MessageElement {
		assert!(i < self.len, "message element index {i} out of range (size {})", self.len);
		&*self.elements[self.start + i]
	}

	/// Borrows element `i` as a `T`, or `None` if the element has another type.
	///
	/// Panics if `i` is out of range.
	pub fn get<T: 'static>(&self, i: usize) -> Option<&T> {
		self.element(i).as_any().downcast_ref::<T>()
	}

	/// True if the message is a single element of type `T`.
	pub fn is<T: 'static>(&self) -> bool {
		self.len == 1 && self.type_at(0) == TypeId::of::<T>()
	}

	/// True if the elements of this message carry exactly the given type tags.
	pub fn has_types(&self, tags: &[TypeId]) -> bool {
		self.len == tags.len() && (0..self.len).all(|i| self.type_at(i) == tags[i])
	}

	/// A view over the same storage with the first `n` elements removed.
	pub fn drop_front(&self, n: usize) -> Message {
		let n = n.min(self.len);
		Message { elements: self.elements.clone(), start: self.start + n, len: self.len - n }
	}

	/// A view over the same storage with the last `n` elements removed.
	pub fn drop_back(&self, n: usize) -> Message {
		let n = n.min(self.len);
		Message { elements: self.elements.clone(), start: self.start, len: self.len - n }
	}
}

impl PartialEq for Message {
	fn eq(&self, other: &Self) -> bool {
		self.len == other.len &&
			(0..self.len).all(|i| self.element(i).eq_element(other.element(i)))
	}
}

impl fmt::Debug for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "(")?;
		for i in 0..self.len {
			if i > 0 {
				write!(f, ", ")?;
			}
			self.element(i).fmt_element(f)?;
		}
		write!(f, ")")
	}
}

/// Builds a [`Message`] from a list of values.
///
/// ```
/// use troupe::msg;
/// let message = msg!["ping", 1u32];
/// assert_eq!(message.size(), 2);
/// ```
#[macro_export]
macro_rules! msg {
	() => {
		$crate::Message::empty()
	};
	($($element:expr),+ $(,)?) => {
		$crate::Message::from_elements(vec![
			$(Box::new($element) as Box<dyn $crate::MessageElement>),+
		])
	};
}

#[cfg(test)]
mod tests {
	use std::any::TypeId;

	use super::*;

	#[test]
	fn test_message_size_and_types() {
		let message = msg![1u32, "two", 3.0f64];
		assert_eq!(message.size(), 3);
		assert_eq!(message.type_at(0), TypeId::of::<u32>());
		assert_eq!(message.type_at(1), TypeId::of::<&str>());
		assert_eq!(message.type_at(2), TypeId::of::<f64>());
	}

	#[test]
	fn test_message_get() {
		let message = msg![1u32, "two"];
		assert_eq!(message.get::<u32>(0), Some(&1u32));
		assert_eq!(message.get::<&str>(1), Some(&"two"));
		assert_eq!(message.get::<u64>(0), None);
	}

	#[test]
	#[should_panic(expected = "out of range")]
	fn test_message_out_of_range_panics() {
		let message = msg![1u32];
		let _ = message.get::<u32>(1);
	}

	#[test]
	fn test_message_equality() {
		assert_eq!(msg![1u32, "two"], msg![1u32, "two"]);
		assert_ne!(msg![1u32, "two"], msg![1u32, "three"]);
		assert_ne!(msg![1u32], msg![1u64]);
		assert_ne!(msg![1u32], msg![1u32, 2u32]);
		assert_eq!(msg!(), msg!());
	}

	#[test]
	fn test_message_views() {
		let message = msg![1u32, "two", 3.0f64];
		let tail = message.drop_front(1);
		assert_eq!(tail.size(), 2);
		assert_eq!(tail.get::<&str>(0), Some(&"two"));
		let head = message.drop_back(2);
		assert_eq!(head.size(), 1);
		assert_eq!(head.get::<u32>(0), Some(&1u32));
		// The original view is untouched.
		assert_eq!(message.size(), 3);
	}

	#[test]
	fn test_message_view_equality() {
		let message = msg![1u32, "two", 3.0f64];
		assert_eq!(message.drop_front(1).drop_back(1), msg!["two"]);
		assert_eq!(message.drop_front(3), msg!());
		assert_eq!(message.drop_front(17).size(), 0);
	}

	#[test]
	fn test_message_is_single_element() {
		assert!(msg!["chunk"].is::<&str>());
		assert!(!msg!["chunk", 1u32].is::<&str>());
		assert!(!msg![1u32].is::<&str>());
	}
}
