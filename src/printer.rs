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

use std::{collections::HashMap, io::Write};

use crate::{
	actor::{Actor, ActorId, ExitReason},
	actor_context::ActorContext,
	behavior::{types, Behavior, Handled},
};

/// Appends a chunk to the printer buffer of the sending actor.
#[derive(Clone, Debug, PartialEq)]
pub struct PrintChunk(pub String);

/// Flushes the sender's buffer to stdout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrintFlush;

/// The well-known printer service: buffers chunks per sender and writes a
/// whole buffer at once on flush, so output of concurrent actors does not
/// interleave mid-line. Used by the runtime's own diagnostics as well.
///
/// Anonymous senders share one buffer.
#[derive(Default)]
pub(crate) struct Printer {
	buffers: HashMap<Option<ActorId>, String>,
}

impl Actor for Printer {
	fn name(&self) -> String {
		"Printer".to_string()
	}

	fn make_behavior(&mut self, _ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		Behavior::new()
			.on(types::<(PrintChunk,)>(), |printer: &mut Self, ctx, message| {
				let chunk = message.get::<PrintChunk>(0).expect("matched by type");
				let key = ctx.sender().map(|sender| sender.id());
				printer.buffers.entry(key).or_default().push_str(&chunk.0);
				Handled::Done
			})
			.on(types::<(PrintFlush,)>(), |printer: &mut Self, ctx, _message| {
				let key = ctx.sender().map(|sender| sender.id());
				if let Some(buffer) = printer.buffers.remove(&key) {
					write_out(&buffer);
				}
				Handled::Done
			})
	}

	fn on_exit(&mut self, _ctx: &mut ActorContext<Self>, _reason: &ExitReason) {
		for (_, buffer) in self.buffers.drain() {
			write_out(&buffer);
		}
	}
}

fn write_out(buffer: &str) {
	let mut stdout = std::io::stdout().lock();
	let _ = stdout.write_all(buffer.as_bytes());
	let _ = stdout.flush();
}
