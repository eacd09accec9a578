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

#![deny(clippy::disallowed_methods)]

//! troupe is a dynamic actor runtime.
//!
//! It gives a program many lightweight concurrent entities ("actors") that
//! communicate exclusively by sending immutable, type-erased messages to each
//! other:
//! - messages are tuples of arbitrary values, matched by behaviors an actor
//!   installs and swaps at runtime,
//! - actors are multiplexed onto a fixed pool of OS threads by a
//!   work-stealing scheduler, or own a thread of their own,
//! - failures propagate through links and monitors, never through call
//!   stacks.
//!
//! The entry point is [`Troupe`], the runtime handle owning the scheduler,
//! the timer service and the printer service.

use std::{
	num::{NonZeroU64, NonZeroUsize},
	time::Duration,
};

use once_cell::sync::Lazy;
use tracing::{info, warn};

mod actor;
mod actor_cell;
mod actor_context;
mod actor_state;
mod behavior;
mod blocking;
mod dispatcher;
mod envelope;
mod mailbox;
mod message;
mod printer;
mod quid;
mod registry;
mod resume;
mod scheduler;
mod timer;
mod troupe;

#[cfg(test)]
pub(crate) mod tests;

pub use self::{
	actor::{
		Actor, ActorAddr, ActorId, ActorRef, DownMsg, ErrorMsg, ExitMsg, ExitReason, FnActor,
		SyncTimeoutMsg, TimeoutMsg,
	},
	actor_context::{ActorContext, ResponsePromise},
	behavior::{types, value, Behavior, CasePattern, Handled, TuplePattern},
	blocking::{ActorExited, AskError, BlockingActor, DoReceive, ResponseFuture, ScopedActor},
	envelope::{Envelope, MessageId},
	mailbox::{Priority, RecvError},
	message::{Message, MessageElement},
	printer::{PrintChunk, PrintFlush},
	scheduler::{Resumable, ResumeResult, SchedulerClient},
	troupe::{SpawnOptions, Troupe},
};

/// Default deadline of `ask` and `receive_response`:
/// - Derived from `TROUPE_SYNC_TIMEOUT_SECS` if set and valid.
/// - Defaults to 10 seconds.
pub static DEFAULT_SYNC_TIMEOUT: Lazy<Duration> = Lazy::new(sync_timeout_from_env_or_default);

fn sync_timeout_from_env_or_default() -> Duration {
	match std::env::var("TROUPE_SYNC_TIMEOUT_SECS") {
		Ok(sync_timeout_secs_str) => {
			if let Ok(sync_timeout_secs) = sync_timeout_secs_str.parse::<NonZeroU64>() {
				info!("set the default sync timeout to {sync_timeout_secs} seconds");
				return Duration::from_secs(sync_timeout_secs.get());
			} else {
				warn!(
					"failed to parse `TROUPE_SYNC_TIMEOUT_SECS={sync_timeout_secs_str}` in \
					 seconds > 0, using the default sync timeout (10 seconds)"
				);
			}
		},
		Err(std::env::VarError::NotUnicode(os_str)) => {
			warn!(
				"failed to parse `TROUPE_SYNC_TIMEOUT_SECS={os_str:?}` in a valid unicode \
				 string, using the default sync timeout (10 seconds)"
			);
		},
		Err(std::env::VarError::NotPresent) => {},
	}
	Duration::from_secs(10)
}

/// Worker-pool size: `TROUPE_WORKER_THREADS` if set and valid, hardware
/// concurrency otherwise.
pub(crate) fn worker_threads_from_env_or_default() -> usize {
	match std::env::var("TROUPE_WORKER_THREADS") {
		Ok(worker_threads_str) =>
			if let Ok(worker_threads) = worker_threads_str.parse::<NonZeroUsize>() {
				return worker_threads.get();
			} else {
				warn!(
					"failed to parse `TROUPE_WORKER_THREADS={worker_threads_str}` as a number \
					 > 0, using the hardware concurrency"
				);
			},
		Err(std::env::VarError::NotUnicode(os_str)) => {
			warn!(
				"failed to parse `TROUPE_WORKER_THREADS={os_str:?}` in a valid unicode string, \
				 using the hardware concurrency"
			);
		},
		Err(std::env::VarError::NotPresent) => {},
	}
	num_cpus::get().max(1)
}
