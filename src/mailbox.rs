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

use std::{sync::Arc, time::Instant};

use thiserror::Error;

use crate::envelope::Envelope;

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum RecvError {
	#[error("no message is currently available")]
	NoMessageAvailable,
	#[error("the mailbox is closed and empty")]
	Disconnected,
}

impl From<flume::RecvTimeoutError> for RecvError {
	fn from(flume_err: flume::RecvTimeoutError) -> Self {
		match flume_err {
			flume::RecvTimeoutError::Timeout => Self::NoMessageAvailable,
			flume::RecvTimeoutError::Disconnected => Self::Disconnected,
		}
	}
}

/// Priority of a send.
///
/// A high priority message is guaranteed to be consumed before any normal
/// priority message sent after it, provided the receiving actor was spawned
/// priority aware. For other actors both levels share one FIFO queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
	Normal,
	High,
}

enum SenderQueues {
	Single(flume::Sender<Envelope>),
	TwoLevel { high: flume::Sender<Envelope>, low: flume::Sender<Envelope> },
}

enum ReceiverQueues {
	Single(flume::Receiver<Envelope>),
	TwoLevel { high: flume::Receiver<Envelope>, low: flume::Receiver<Envelope> },
}

/// Producer side of a mailbox. Cloned into every handle of the actor.
///
/// Producers only ever push: the consumer-park rendezvous is carried by the
/// actor's scheduling state, not by the queue itself.
#[derive(Clone)]
pub(crate) struct MailboxSender {
	queues: Arc<SenderQueues>,
	signal_tx: flume::Sender<()>,
}

/// Consumer side of a mailbox. Owned by the actor body: there is exactly one
/// logical consumer. Dropping it closes the mailbox, which producers observe
/// as a disconnection.
pub(crate) struct MailboxReceiver {
	queues: ReceiverQueues,
	signal_rx: flume::Receiver<()>,
}

pub(crate) fn create_mailbox(priority_aware: bool) -> (MailboxSender, MailboxReceiver) {
	let (signal_tx, signal_rx) = flume::unbounded();
	let (sender_queues, receiver_queues) = if priority_aware {
		let (high_tx, high_rx) = flume::unbounded();
		let (low_tx, low_rx) = flume::unbounded();
		(
			SenderQueues::TwoLevel { high: high_tx, low: low_tx },
			ReceiverQueues::TwoLevel { high: high_rx, low: low_rx },
		)
	} else {
		let (tx, rx) = flume::unbounded();
		(SenderQueues::Single(tx), ReceiverQueues::Single(rx))
	};
	let sender = MailboxSender { queues: Arc::new(sender_queues), signal_tx };
	let receiver = MailboxReceiver { queues: receiver_queues, signal_rx };
	(sender, receiver)
}

impl MailboxSender {
	/// Pushes an envelope. On a closed mailbox the envelope is handed back so
	/// the caller can bounce it.
	pub(crate) fn enqueue(&self, envelope: Envelope, priority: Priority) -> Result<(), Envelope> {
		let push_result = match (&*self.queues, priority) {
			(SenderQueues::Single(tx), _) => tx.send(envelope),
			(SenderQueues::TwoLevel { high, .. }, Priority::High) => high.send(envelope),
			(SenderQueues::TwoLevel { low, .. }, Priority::Normal) => low.send(envelope),
		};
		match push_result {
			Ok(()) => {
				// Wake a consumer blocked in `recv_blocking`/`recv_deadline`.
				// The envelope is visible before its signal, so a consumer
				// woken by the signal always finds it.
				let _ = self.signal_tx.send(());
				Ok(())
			},
			Err(flume::SendError(envelope)) => Err(envelope),
		}
	}

	pub(crate) fn is_closed(&self) -> bool {
		match &*self.queues {
			SenderQueues::Single(tx) => tx.is_disconnected(),
			SenderQueues::TwoLevel { low, .. } => low.is_disconnected(),
		}
	}
}

impl MailboxReceiver {
	/// Returns an envelope if one is immediately available.
	pub(crate) fn try_pop(&self) -> Option<Envelope> {
		match &self.queues {
			ReceiverQueues::Single(rx) => rx.try_recv().ok(),
			ReceiverQueues::TwoLevel { high, low } =>
				high.try_recv().ok().or_else(|| low.try_recv().ok()),
		}
	}

	/// Cheap hint that an envelope is known to be ready. Not authoritative:
	/// a producer may enqueue right after the check.
	pub(crate) fn can_fetch_more(&self) -> bool {
		match &self.queues {
			ReceiverQueues::Single(rx) => !rx.is_empty(),
			ReceiverQueues::TwoLevel { high, low } => !high.is_empty() || !low.is_empty(),
		}
	}

	/// Blocks the calling thread until an envelope is available.
	///
	/// Only blocking-mode actors (the timer service among them) use this;
	/// event-based actors never block, they park through the scheduling
	/// state instead.
	pub(crate) fn recv_blocking(&self) -> Result<Envelope, RecvError> {
		loop {
			if let Some(envelope) = self.try_pop() {
				return Ok(envelope);
			}
			if self.signal_rx.recv().is_err() {
				return Err(RecvError::Disconnected);
			}
		}
	}

	/// Blocks until an envelope is available or `deadline` passes.
	pub(crate) fn recv_deadline(&self, deadline: Instant) -> Result<Envelope, RecvError> {
		loop {
			if let Some(envelope) = self.try_pop() {
				return Ok(envelope);
			}
			match self.signal_rx.recv_deadline(deadline) {
				Ok(()) => continue,
				Err(flume_err) => return Err(flume_err.into()),
			}
		}
	}

	/// Blocks until the mailbox is known non-empty, without consuming
	/// anything. Used by dedicated-thread actors parked on an empty mailbox.
	pub(crate) fn wait_until_nonempty(&self) -> Result<(), RecvError> {
		loop {
			if self.can_fetch_more() {
				return Ok(());
			}
			self.signal_rx.recv().map_err(|_| RecvError::Disconnected)?;
		}
	}

	/// Removes and returns every pending envelope, high priority first.
	pub(crate) fn drain(&self) -> Vec<Envelope> {
		let mut envelopes = Vec::new();
		match &self.queues {
			ReceiverQueues::Single(rx) => envelopes.extend(rx.drain()),
			ReceiverQueues::TwoLevel { high, low } => {
				envelopes.extend(high.drain());
				envelopes.extend(low.drain());
			},
		}
		envelopes
	}
}
