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

use std::fmt;

use crate::{actor::ActorAddr, message::Message};

/// Tags an envelope as an asynchronous send, a request, or a response.
///
/// The id packs a 63 bit sequence number and a response flag in the top bit.
/// `ASYNC` (all zeroes) marks a plain fire-and-forget message. Request ids
/// are allocated from a per-actor monotonic counter, so they are unique per
/// requester; the matching response id is the request id with the response
/// flag set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u64);

impl MessageId {
	pub const ASYNC: MessageId = MessageId(0);
	const RESPONSE_FLAG: u64 = 1 << 63;

	pub(crate) fn request(seq: u64) -> MessageId {
		assert!(seq != 0, "request sequence numbers start at 1");
		assert!(seq & Self::RESPONSE_FLAG == 0, "request sequence number overflow");
		MessageId(seq)
	}

	pub fn is_async(self) -> bool {
		self.0 == 0
	}

	pub fn is_request(self) -> bool {
		!self.is_async() && self.0 & Self::RESPONSE_FLAG == 0
	}

	pub fn is_response(self) -> bool {
		self.0 & Self::RESPONSE_FLAG != 0
	}

	/// The response id answering this request id.
	pub fn response_id(self) -> MessageId {
		debug_assert!(self.is_request());
		MessageId(self.0 | Self::RESPONSE_FLAG)
	}

	/// The request id this response id answers.
	pub fn request_id(self) -> MessageId {
		MessageId(self.0 & !Self::RESPONSE_FLAG)
	}
}

impl fmt::Debug for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_async() {
			write!(f, "MessageId(async)")
		} else if self.is_request() {
			write!(f, "MessageId(request {})", self.0)
		} else {
			write!(f, "MessageId(response {})", self.request_id().0)
		}
	}
}

/// The unit stored in a mailbox: who sent what, and under which id.
///
/// Envelopes are single-owner. Once dequeued, ownership moves to the
/// dispatcher, which either consumes the message, parks the envelope in the
/// skip cache, or drops it. Cloning is cheap (the message storage is shared)
/// and produces an independent envelope, e.g. for a delayed re-injection.
#[derive(Clone)]
pub struct Envelope {
	pub sender: Option<ActorAddr>,
	pub message_id: MessageId,
	pub message: Message,
}

impl Envelope {
	pub fn asynchronous(sender: Option<ActorAddr>, message: Message) -> Envelope {
		Envelope { sender, message_id: MessageId::ASYNC, message }
	}

	pub fn request(sender: Option<ActorAddr>, id: MessageId, message: Message) -> Envelope {
		debug_assert!(id.is_request());
		Envelope { sender, message_id: id, message }
	}

	/// The response envelope answering `request_id`.
	pub fn response(
		sender: Option<ActorAddr>,
		request_id: MessageId,
		message: Message,
	) -> Envelope {
		Envelope { sender, message_id: request_id.response_id(), message }
	}

	pub fn is_request(&self) -> bool {
		self.message_id.is_request()
	}
}

impl PartialEq for Envelope {
	fn eq(&self, other: &Self) -> bool {
		self.sender == other.sender &&
			self.message_id == other.message_id &&
			self.message == other.message
	}
}

impl fmt::Debug for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Envelope")
			.field("sender", &self.sender)
			.field("message_id", &self.message_id)
			.field("message", &self.message)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::msg;

	#[test]
	fn test_message_id_classification() {
		assert!(MessageId::ASYNC.is_async());
		assert!(!MessageId::ASYNC.is_request());
		assert!(!MessageId::ASYNC.is_response());
		let request = MessageId::request(42);
		assert!(request.is_request());
		assert!(!request.is_response());
		let response = request.response_id();
		assert!(response.is_response());
		assert!(!response.is_request());
		assert_eq!(response.request_id(), request);
	}

	#[test]
	#[should_panic(expected = "start at 1")]
	fn test_message_id_zero_request_rejected() {
		let _ = MessageId::request(0);
	}

	#[test]
	fn test_envelope_response_id_derivation() {
		let request_id = MessageId::request(7);
		let envelope = Envelope::request(None, request_id, msg!["ask"]);
		assert!(envelope.is_request());
		let response = Envelope::response(None, envelope.message_id, msg!["answer"]);
		assert_eq!(response.message_id, request_id.response_id());
		assert!(!response.is_request());
	}
}
