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

//! End-to-end scenarios, plus the message types shared by the tests of the
//! other modules.

use std::{
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use crate::{
	msg, types, value, Actor, ActorContext, ActorRef, Behavior, DownMsg, ErrorMsg, ExitMsg,
	ExitReason, Handled, PrintChunk, PrintFlush, Priority, Resumable, ResumeResult, SpawnOptions,
	Troupe,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Ping(pub u32);

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Pong(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Kickoff(pub ActorRef);

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Ask;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Answer(pub u32);

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Tick;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Tag(pub &'static str);

#[track_caller]
pub(crate) fn await_condition(mut condition: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while !condition() {
		assert!(Instant::now() < deadline, "condition not reached in time");
		std::thread::sleep(Duration::from_millis(1));
	}
}

#[track_caller]
pub(crate) fn await_terminated(actor: &ActorRef) {
	await_condition(|| actor.is_terminated());
}

fn spawn_pong(troupe: &Troupe) -> ActorRef {
	troupe.spawn_fn(SpawnOptions::new(), |_ctx| {
		Behavior::new().on(types::<(Ping,)>(), |_, ctx, message| {
			let Ping(n) = *message.get::<Ping>(0).unwrap();
			if let Some(sender) = ctx.sender().cloned() {
				ctx.send_to(&sender, msg![Pong(n)]);
			}
			Handled::Done
		})
	})
}

#[test]
fn test_ping_pong_ten_round_trips() {
	let troupe = Troupe::with_workers(2);
	let pong = spawn_pong(&troupe);
	let ping = troupe.spawn_fn(SpawnOptions::new(), |_ctx| {
		Behavior::new().on(types::<(Kickoff,)>(), |_, ctx, message| {
			let Kickoff(pong) = message.get::<Kickoff>(0).unwrap();
			ctx.send(pong, msg![Ping(1)]);
			ctx.become_(Behavior::new().on(types::<(Pong,)>(), |_, ctx, message| {
				let Pong(n) = *message.get::<Pong>(0).unwrap();
				if n >= 10 {
					ctx.quit(ExitReason::Normal);
				} else if let Some(sender) = ctx.sender().cloned() {
					ctx.send_to(&sender, msg![Ping(n + 1)]);
				}
				Handled::Done
			}));
			Handled::Done
		})
	});
	ping.send(msg![Kickoff(pong.clone())]);
	await_terminated(&ping);
	assert_eq!(ping.exit_reason(), Some(ExitReason::Normal));
	assert!(!pong.is_terminated());
	pong.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

struct SilentActor;

impl Actor for SilentActor {
	fn make_behavior(&mut self, _ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		Behavior::new()
	}
}

struct QuitOnSpawn {
	reason: ExitReason,
}

impl Actor for QuitOnSpawn {
	fn make_behavior(&mut self, ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		ctx.quit(self.reason.clone());
		Behavior::new()
	}
}

struct LinkedPair;

impl Actor for LinkedPair {
	fn make_behavior(&mut self, ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		ctx.spawn(
			SpawnOptions::new().linked(),
			QuitOnSpawn { reason: ExitReason::user(42) },
		);
		Behavior::new()
	}
}

#[test]
fn test_linked_failure_propagates_and_monitor_observes() {
	let troupe = Troupe::with_workers(2);
	let down_reason: Arc<Mutex<Option<ExitReason>>> = Arc::new(Mutex::new(None));
	let down_reason_clone = down_reason.clone();
	let observer = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		// The monitored option installs the monitor atomically with the
		// spawn, so the down message cannot be lost to a race.
		ctx.spawn(SpawnOptions::new().monitored(), LinkedPair);
		Behavior::new().on(types::<(DownMsg,)>(), move |_, ctx, message| {
			let down = message.get::<DownMsg>(0).unwrap();
			*down_reason_clone.lock().unwrap() = Some(down.reason.clone());
			ctx.quit(ExitReason::Normal);
			Handled::Done
		})
	});
	await_terminated(&observer);
	assert_eq!(*down_reason.lock().unwrap(), Some(ExitReason::user(42)));
	troupe.await_all_actors_done();
	troupe.shutdown();
}

struct Responder;

impl Actor for Responder {
	fn make_behavior(&mut self, _ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		Behavior::new().on(types::<(Ask,)>(), |_, _ctx, _message| {
			Handled::Reply(msg![Answer(42)])
		})
	}
}

#[test]
fn test_sync_send_runs_continuation() {
	let troupe = Troupe::with_workers(2);
	let responder = troupe.spawn(SpawnOptions::new(), Responder);
	let got: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
	let got_clone = got.clone();
	let asker = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		let continuation = Behavior::new().on(types::<(Answer,)>(), move |_, ctx, message| {
			*got_clone.lock().unwrap() = Some(message.get::<Answer>(0).unwrap().0);
			ctx.quit(ExitReason::Normal);
			Handled::Done
		});
		ctx.sync_send(&responder, msg![Ask], continuation);
		Behavior::new()
	});
	await_terminated(&asker);
	assert_eq!(*got.lock().unwrap(), Some(42));
	assert_eq!(asker.exit_reason(), Some(ExitReason::Normal));
	troupe.shutdown();
}

#[test]
fn test_sync_timeout_without_handler_terminates() {
	let troupe = Troupe::with_workers(2);
	let silent = troupe.spawn(SpawnOptions::new(), SilentActor);
	let asker = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		let continuation =
			Behavior::new().on(types::<(Answer,)>(), |_, _, _| Handled::Done);
		ctx.timed_sync_send(&silent, Duration::from_millis(50), msg![Ask], continuation);
		Behavior::new()
	});
	await_terminated(&asker);
	assert_eq!(asker.exit_reason(), Some(ExitReason::UnhandledSyncTimeout));
	troupe.shutdown();
}

#[test]
fn test_sync_timeout_handler_fires_instead() {
	let troupe = Troupe::with_workers(2);
	let silent = troupe.spawn(SpawnOptions::new(), SilentActor);
	let timed_out = Arc::new(Mutex::new(false));
	let timed_out_clone = timed_out.clone();
	let asker = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		ctx.on_sync_timeout(move |_, ctx, _message| {
			*timed_out_clone.lock().unwrap() = true;
			ctx.quit(ExitReason::Normal);
			Handled::Done
		});
		let continuation =
			Behavior::new().on(types::<(Answer,)>(), |_, _, _| Handled::Done);
		ctx.timed_sync_send(&silent, Duration::from_millis(50), msg![Ask], continuation);
		Behavior::new()
	});
	await_terminated(&asker);
	assert!(*timed_out.lock().unwrap());
	assert_eq!(asker.exit_reason(), Some(ExitReason::Normal));
	troupe.shutdown();
}

#[test]
fn test_unmatched_sync_response_terminates() {
	let troupe = Troupe::with_workers(2);
	let responder = troupe.spawn(SpawnOptions::new(), Responder);
	let asker = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		// The continuation only accepts strings; `Answer` will not match.
		let continuation =
			Behavior::new().on(types::<(&'static str,)>(), |_, _, _| Handled::Done);
		ctx.sync_send(&responder, msg![Ask], continuation);
		Behavior::new()
	});
	await_terminated(&asker);
	assert_eq!(asker.exit_reason(), Some(ExitReason::UnhandledSyncFailure));
	troupe.shutdown();
}

#[test]
fn test_skip_cache_replayed_on_become() {
	let troupe = Troupe::with_workers(2);
	let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let actor = troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
		let log_ints = log_clone.clone();
		Behavior::new().on(types::<(i32,)>(), move |_, ctx, message| {
			log_ints.lock().unwrap().push(format!("int:{}", message.get::<i32>(0).unwrap()));
			let log_strings = log_ints.clone();
			ctx.become_(Behavior::new().on(
				types::<(&'static str,)>(),
				move |_, _, message| {
					log_strings
						.lock()
						.unwrap()
						.push(format!("str:{}", message.get::<&'static str>(0).unwrap()));
					Handled::Done
				},
			));
			Handled::Done
		})
	});
	// The string and the float do not match the first behavior and go to the
	// skip cache; the int is consumed and swaps the behavior, which replays
	// the cached string before the tail message sent after it.
	actor.send(msg!["first"]);
	actor.send(msg![1.5f64]);
	actor.send(msg![7i32]);
	actor.send(msg!["tail"]);
	await_condition(|| log.lock().unwrap().len() == 3);
	assert_eq!(*log.lock().unwrap(), vec!["int:7", "str:first", "str:tail"]);
	actor.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_many_self_messaging_actors_drain() {
	let troupe = Troupe::with_workers(4);
	for _ in 0..64 {
		troupe.spawn_fn(SpawnOptions::new(), |ctx| {
			ctx.send(&ctx.self_ref(), msg![Tick]);
			let mut remaining = 200u32;
			Behavior::new().on(types::<(Tick,)>(), move |_, ctx, _message| {
				remaining -= 1;
				if remaining == 0 {
					ctx.quit(ExitReason::Normal);
				} else {
					ctx.send(&ctx.self_ref(), msg![Tick]);
				}
				Handled::Done
			})
		});
	}
	troupe.await_all_actors_done();
	assert_eq!(troupe.num_live_actors(), 0);
	troupe.shutdown();
}

struct InstantQuit {
	log: Arc<Mutex<Vec<&'static str>>>,
}

impl Actor for InstantQuit {
	fn make_behavior(&mut self, ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		self.log.lock().unwrap().push("make_behavior");
		ctx.quit(ExitReason::Normal);
		Behavior::new().otherwise(|state: &mut InstantQuit, _, _| {
			state.log.lock().unwrap().push("handled");
			Handled::Done
		})
	}

	fn on_exit(&mut self, _ctx: &mut ActorContext<Self>, reason: &ExitReason) {
		assert!(reason.is_normal());
		self.log.lock().unwrap().push("on_exit");
	}
}

#[test]
fn test_immediate_quit_never_enters_behavior() {
	let troupe = Troupe::with_workers(2);
	let log = Arc::new(Mutex::new(Vec::new()));
	let actor = troupe.spawn(SpawnOptions::new(), InstantQuit { log: log.clone() });
	actor.send(msg![Tick]);
	await_terminated(&actor);
	assert_eq!(actor.exit_reason(), Some(ExitReason::Normal));
	assert_eq!(*log.lock().unwrap(), vec!["make_behavior", "on_exit"]);
	troupe.shutdown();
}

struct Phoenix {
	log: Arc<Mutex<Vec<u64>>>,
	revived: bool,
}

impl Actor for Phoenix {
	fn make_behavior(&mut self, _ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		Behavior::new().on(types::<(Ping,)>(), |_, ctx, _| {
			ctx.quit(ExitReason::user(42));
			Handled::Done
		})
	}

	fn on_exit(&mut self, ctx: &mut ActorContext<Self>, reason: &ExitReason) {
		self.log.lock().unwrap().push(reason.code());
		if !self.revived {
			self.revived = true;
			ctx.become_(Behavior::new().on(types::<(Ping,)>(), |_, ctx, _| {
				ctx.quit(ExitReason::user(43));
				Handled::Done
			}));
		}
	}
}

#[test]
fn test_on_exit_can_resurrect_once() {
	let troupe = Troupe::with_workers(2);
	let log = Arc::new(Mutex::new(Vec::new()));
	let actor =
		troupe.spawn(SpawnOptions::new(), Phoenix { log: log.clone(), revived: false });
	actor.send(msg![Ping(1)]);
	await_condition(|| log.lock().unwrap().len() == 1);
	assert!(!actor.is_terminated());
	actor.send(msg![Ping(2)]);
	await_terminated(&actor);
	assert_eq!(*log.lock().unwrap(), vec![42, 43]);
	assert_eq!(actor.exit_reason(), Some(ExitReason::user(43)));
	troupe.shutdown();
}

#[test]
fn test_trap_exit_converts_exit_to_message() {
	let troupe = Troupe::with_workers(2);
	let trapped: Arc<Mutex<Option<ExitReason>>> = Arc::new(Mutex::new(None));
	let trapped_clone = trapped.clone();
	let actor = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		ctx.trap_exit(true);
		Behavior::new().on(types::<(ExitMsg,)>(), move |_, ctx, message| {
			let exit = message.get::<ExitMsg>(0).unwrap();
			*trapped_clone.lock().unwrap() = Some(exit.reason.clone());
			ctx.quit(ExitReason::Normal);
			Handled::Done
		})
	});
	actor.send_exit(ExitReason::user(33));
	await_terminated(&actor);
	assert_eq!(*trapped.lock().unwrap(), Some(ExitReason::user(33)));
	assert_eq!(actor.exit_reason(), Some(ExitReason::Normal));
	troupe.shutdown();
}

#[test]
fn test_untrapped_exits() {
	let troupe = Troupe::with_workers(2);
	let actor = troupe.spawn(SpawnOptions::new(), SilentActor);
	// A normal exit is dropped for actors that do not trap.
	actor.send_exit(ExitReason::Normal);
	std::thread::sleep(Duration::from_millis(30));
	assert!(!actor.is_terminated());
	actor.send_exit(ExitReason::user(44));
	await_terminated(&actor);
	assert_eq!(actor.exit_reason(), Some(ExitReason::user(44)));
	troupe.shutdown();
}

struct PromisingResponder;

impl Actor for PromisingResponder {
	fn make_behavior(&mut self, _ctx: &mut ActorContext<Self>) -> Behavior<'static, Self> {
		Behavior::new().on(types::<(Ask,)>(), |_, ctx, _message| {
			let promise = ctx.make_response_promise();
			assert!(promise.is_valid());
			promise.deliver(msg![Answer(9)]);
			// Suppressed: the promise already owns the reply.
			Handled::Reply(msg![Answer(0)])
		})
	}
}

#[test]
fn test_response_promise_suppresses_auto_reply() {
	let troupe = Troupe::with_workers(2);
	let responder = troupe.spawn(SpawnOptions::new(), PromisingResponder);
	let mut scoped = troupe.scoped();
	let response = scoped.ask(&responder, msg![Ask]).unwrap();
	assert_eq!(response.get::<Answer>(0), Some(&Answer(9)));
	drop(scoped);
	responder.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_blocking_actor_replies_and_scoped_ask() {
	let troupe = Troupe::with_workers(2);
	let echo = troupe.spawn_blocking(SpawnOptions::new(), (), |actor| {
		let mut behavior = Behavior::new().on(types::<(Ping,)>(), |_, _ctx, message| {
			let Ping(n) = *message.get::<Ping>(0).unwrap();
			Handled::Reply(msg![Pong(n)])
		});
		loop {
			actor.receive(&mut behavior)?;
		}
	});
	let mut scoped = troupe.scoped();
	let response = scoped.ask(&echo, msg![Ping(7)]).unwrap();
	assert_eq!(response.get::<Pong>(0), Some(&Pong(7)));
	drop(scoped);
	troupe.shutdown();
}

#[test]
fn test_blocking_receive_for_counts_messages() {
	let troupe = Troupe::with_workers(2);
	let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
	let seen_clone = seen.clone();
	let counter = troupe.spawn_blocking(SpawnOptions::new(), (), move |actor| {
		let mut behavior = Behavior::new().on(types::<(Ping,)>(), move |_, _ctx, message| {
			seen_clone.lock().unwrap().push(message.get::<Ping>(0).unwrap().0);
			Handled::Done
		});
		actor.receive_for(3, &mut behavior)?;
		Ok(())
	});
	for n in 1..=3 {
		counter.send(msg![Ping(n)]);
	}
	await_terminated(&counter);
	assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
	assert_eq!(counter.exit_reason(), Some(ExitReason::Normal));
	troupe.shutdown();
}

#[test]
fn test_fifo_per_sender() {
	let troupe = Troupe::with_workers(2);
	let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let receiver = troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
		Behavior::new().on(types::<(Ping,)>(), move |_, _, message| {
			log_clone.lock().unwrap().push(message.get::<Ping>(0).unwrap().0);
			Handled::Done
		})
	});
	for n in 0..100 {
		receiver.send(msg![Ping(n)]);
	}
	await_condition(|| log.lock().unwrap().len() == 100);
	assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<u32>>());
	receiver.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_delayed_send_arrives_after_direct_send() {
	let troupe = Troupe::with_workers(2);
	let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let receiver = troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
		Behavior::new().on(types::<(Tag,)>(), move |_, _, message| {
			log_clone.lock().unwrap().push(message.get::<Tag>(0).unwrap().0);
			Handled::Done
		})
	});
	let mut scoped = troupe.scoped();
	scoped.delayed_send(&receiver, Duration::from_millis(40), msg![Tag("late")]);
	scoped.send(&receiver, msg![Tag("early")]);
	await_condition(|| log.lock().unwrap().len() == 2);
	assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
	drop(scoped);
	receiver.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_behavior_timeout_fires_when_idle() {
	let troupe = Troupe::with_workers(2);
	let fired = Arc::new(Mutex::new(false));
	let fired_clone = fired.clone();
	let actor = troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
		Behavior::new()
			.on(types::<(Ping,)>(), |_, _, _| Handled::Done)
			.after(Duration::from_millis(30), move |_, ctx| {
				*fired_clone.lock().unwrap() = true;
				ctx.quit(ExitReason::Normal);
			})
	});
	await_terminated(&actor);
	assert!(*fired.lock().unwrap());
	troupe.shutdown();
}

#[test]
fn test_become_invalidates_pending_timeout() {
	let troupe = Troupe::with_workers(2);
	let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let actor = troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
		let stale_log = log_clone.clone();
		let swap_log = log_clone.clone();
		Behavior::new()
			.on(types::<(Tag,)>(), move |_, ctx, _| {
				let fresh_log = swap_log.clone();
				ctx.become_(
					Behavior::new()
						.on(types::<(Ping,)>(), |_, _, _| Handled::Done)
						.after(Duration::from_millis(150), move |_, ctx| {
							fresh_log.lock().unwrap().push("second");
							ctx.quit(ExitReason::Normal);
						}),
				);
				Handled::Done
			})
			.after(Duration::from_millis(40), move |_, ctx| {
				stale_log.lock().unwrap().push("first");
				ctx.quit(ExitReason::Normal);
			})
	});
	// Swapping behaviors immediately invalidates the 40 ms timeout: its id
	// is stale by the time it fires.
	actor.send(msg![Tag("swap")]);
	await_terminated(&actor);
	assert_eq!(*log.lock().unwrap(), vec!["second"]);
	troupe.shutdown();
}

#[test]
fn test_priority_aware_mailbox_overtakes() {
	let troupe = Troupe::with_workers(2);
	let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let actor = troupe.spawn_fn(SpawnOptions::new().priority_aware(), move |_ctx| {
		Behavior::new()
			.on(types::<(Tick,)>(), |_, _, _| {
				// Hold the actor busy so the next sends queue up behind it.
				std::thread::sleep(Duration::from_millis(50));
				Handled::Done
			})
			.on(types::<(Tag,)>(), move |_, _, message| {
				log_clone.lock().unwrap().push(message.get::<Tag>(0).unwrap().0);
				Handled::Done
			})
	});
	actor.send(msg![Tick]);
	std::thread::sleep(Duration::from_millis(10));
	actor.send(msg![Tag("normal")]);
	actor.send_with_priority(Priority::High, msg![Tag("high")]);
	await_condition(|| log.lock().unwrap().len() == 2);
	assert_eq!(*log.lock().unwrap(), vec!["high", "normal"]);
	actor.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_request_to_terminated_actor_bounces() {
	let troupe = Troupe::with_workers(2);
	let short_lived =
		troupe.spawn(SpawnOptions::new(), QuitOnSpawn { reason: ExitReason::Normal });
	await_terminated(&short_lived);
	let mut scoped = troupe.scoped();
	let response = scoped.ask(&short_lived, msg![Ask]).unwrap();
	assert!(response.is::<ErrorMsg>());
	drop(scoped);
	troupe.shutdown();
}

#[test]
fn test_await_all_actors_done_ignores_hidden() {
	let troupe = Troupe::with_workers(2);
	let _hidden = troupe.spawn(SpawnOptions::new().hidden(), SilentActor);
	let visible = troupe.spawn(SpawnOptions::new(), QuitOnSpawn { reason: ExitReason::Normal });
	// Returns even though the hidden actor is still alive.
	troupe.await_all_actors_done();
	assert!(visible.is_terminated());
	assert_eq!(troupe.num_live_actors(), 0);
	troupe.shutdown();
}

#[test]
fn test_detached_actor_runs_off_pool() {
	let troupe = Troupe::with_workers(1);
	let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let detached = troupe.spawn_fn(SpawnOptions::new().detached(), move |_ctx| {
		Behavior::new().on(types::<(Ping,)>(), move |_, _, message| {
			log_clone.lock().unwrap().push(message.get::<Ping>(0).unwrap().0);
			Handled::Done
		})
	});
	detached.send(msg![Ping(1)]);
	await_condition(|| log.lock().unwrap().len() == 1);
	// Parked on its own thread, then woken by a later send.
	detached.send(msg![Ping(2)]);
	await_condition(|| log.lock().unwrap().len() == 2);
	detached.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_become_keep_and_unbecome_replay_the_cache() {
	let troupe = Troupe::with_workers(2);
	let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
	let log_clone = log.clone();
	let actor = troupe.spawn_fn(SpawnOptions::new(), move |_ctx| {
		let bottom_log = log_clone.clone();
		let push_log = log_clone.clone();
		Behavior::new()
			.on(value(msg![Tag("push")]), move |_, ctx, _| {
				let top_log = push_log.clone();
				ctx.become_keep(
					Behavior::new()
						.on(types::<(&'static str,)>(), move |_, _, message| {
							top_log
								.lock()
								.unwrap()
								.push(format!("top:{}", message.get::<&'static str>(0).unwrap()));
							Handled::Done
						})
						.on(value(msg![Tag("pop")]), |_, ctx, _| {
							ctx.unbecome();
							Handled::Done
						}),
				);
				Handled::Done
			})
			.on(types::<(i32,)>(), move |_, _, message| {
				bottom_log
					.lock()
					.unwrap()
					.push(format!("bottom:{}", message.get::<i32>(0).unwrap()));
				Handled::Done
			})
	});
	// The string only matches the pushed behavior; the int only matches the
	// bottom one. Each becomes consumable when its behavior reaches the top.
	actor.send(msg!["hello"]);
	actor.send(msg![Tag("push")]);
	actor.send(msg![5i32]);
	actor.send(msg![Tag("pop")]);
	await_condition(|| log.lock().unwrap().len() == 2);
	assert_eq!(*log.lock().unwrap(), vec!["top:hello", "bottom:5"]);
	actor.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_monitor_and_demonitor() {
	let troupe = Troupe::with_workers(2);
	let target = troupe.spawn(SpawnOptions::new(), SilentActor);
	let watching: Arc<Mutex<Vec<ExitReason>>> = Arc::new(Mutex::new(Vec::new()));
	let watching_clone = watching.clone();
	let target_for_watcher = target.clone();
	let watcher = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		ctx.monitor(&target_for_watcher.downgrade());
		Behavior::new().on(types::<(DownMsg,)>(), move |_, ctx, message| {
			watching_clone.lock().unwrap().push(message.get::<DownMsg>(0).unwrap().reason.clone());
			ctx.quit(ExitReason::Normal);
			Handled::Done
		})
	});
	let target_for_quitter = target.clone();
	let quitter = troupe.spawn_fn(SpawnOptions::new(), move |ctx| {
		ctx.monitor(&target_for_quitter.downgrade());
		ctx.demonitor(&target_for_quitter.downgrade());
		Behavior::new().on(types::<(DownMsg,)>(), |_, _, _| {
			panic!("the demonitored observer must not get a down message");
		})
	});
	// Let both monitor requests reach the target before it dies.
	std::thread::sleep(Duration::from_millis(50));
	target.send_exit(ExitReason::user(77));
	await_terminated(&watcher);
	assert_eq!(*watching.lock().unwrap(), vec![ExitReason::user(77)]);
	assert!(!quitter.is_terminated());
	quitter.send_exit(ExitReason::UserShutdown);
	troupe.await_all_actors_done();
	troupe.shutdown();
}

#[test]
fn test_do_receive_until() {
	let troupe = Troupe::with_workers(2);
	let accumulator = troupe.spawn_blocking(SpawnOptions::new(), 0u32, move |actor| {
		let mut behavior = Behavior::new().on(types::<(Ping,)>(), |sum: &mut u32, _ctx, message| {
			*sum += message.get::<Ping>(0).unwrap().0;
			Handled::Done
		});
		// `until` checks after each receive; stop after the third message.
		let mut received = 0;
		actor.do_receive(&mut behavior).until(|| {
			received += 1;
			received >= 3
		})?;
		// Expose the accumulated sum, then stop.
		let mut read_back = Behavior::new().on(types::<(Ask,)>(), |sum: &mut u32, _ctx, _| {
			Handled::Reply(msg![Answer(*sum)])
		});
		actor.receive(&mut read_back)?;
		Ok(())
	});
	for n in [1u32, 2, 3] {
		accumulator.send(msg![Ping(n)]);
	}
	let mut scoped = troupe.scoped();
	let response = scoped.ask(&accumulator, msg![Ask]).unwrap();
	assert_eq!(response.get::<Answer>(0), Some(&Answer(6)));
	drop(scoped);
	await_terminated(&accumulator);
	troupe.shutdown();
}

#[test]
fn test_receive_while() {
	let troupe = Troupe::with_workers(2);
	let processed: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
	let processed_in_handler = processed.clone();
	let processed_in_pred = processed.clone();
	let worker = troupe.spawn_blocking(SpawnOptions::new(), (), move |actor| {
		let mut behavior = Behavior::new().on(types::<(Ping,)>(), move |_, _ctx, message| {
			*processed_in_handler.lock().unwrap() += 1;
			Handled::Reply(msg![Pong(message.get::<Ping>(0).unwrap().0)])
		});
		actor.receive_while(|| *processed_in_pred.lock().unwrap() < 2, &mut behavior)?;
		Ok(())
	});
	let mut scoped = troupe.scoped();
	assert!(scoped.ask(&worker, msg![Ping(1)]).is_ok());
	assert!(scoped.ask(&worker, msg![Ping(2)]).is_ok());
	await_terminated(&worker);
	assert_eq!(*processed.lock().unwrap(), 2);
	assert_eq!(worker.exit_reason(), Some(ExitReason::Normal));
	drop(scoped);
	troupe.shutdown();
}

#[test]
fn test_printer_accepts_chunks_and_flushes() {
	let troupe = Troupe::with_workers(2);
	let printer = troupe.printer();
	let mut scoped = troupe.scoped();
	scoped.send(&printer, msg![PrintChunk("hello ".to_string())]);
	scoped.send(&printer, msg![PrintChunk("world\n".to_string())]);
	scoped.send(&printer, msg![PrintFlush]);
	drop(scoped);
	troupe.shutdown();
}

struct Blip {
	counter: Arc<Mutex<u32>>,
}

impl Resumable for Blip {
	fn resume(&self) -> ResumeResult {
		*self.counter.lock().unwrap() += 1;
		ResumeResult::Done
	}
}

#[test]
fn test_exec_later_runs_side_runnables() {
	let troupe = Troupe::with_workers(2);
	let counter = Arc::new(Mutex::new(0));
	troupe.scheduler_client().exec_later(Arc::new(Blip { counter: counter.clone() }));
	await_condition(|| *counter.lock().unwrap() == 1);
	troupe.shutdown();
}

#[test]
fn test_handler_panic_terminates_with_unhandled_exception() {
	let troupe = Troupe::with_workers(2);
	let actor = troupe.spawn_fn(SpawnOptions::new(), |_ctx| {
		Behavior::new().on(types::<(Ping,)>(), |_, _, _| -> Handled {
			panic!("boom");
		})
	});
	actor.send(msg![Ping(1)]);
	await_terminated(&actor);
	assert_eq!(actor.exit_reason(), Some(ExitReason::UnhandledException));
	troupe.shutdown();
}
