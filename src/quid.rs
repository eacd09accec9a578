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

use rand::{distributions::Alphanumeric, prelude::*};

const ADJECTIVES: &[&str] = &[
	"amber", "bold", "brisk", "calm", "crimson", "dawn", "dusty", "eager", "faint", "frosty",
	"gentle", "hidden", "icy", "keen", "late", "misty", "nimble", "pale", "quiet", "rapid",
	"rustic", "silent", "solar", "stormy", "swift", "tidal", "vivid", "wandering", "wild",
	"young",
];

/// Returns a human-readable, collision-unlikely instance id for logs, e.g.
/// `PongActor-quiet-x3Fh`.
pub(crate) fn new_quid(name: &str) -> String {
	let mut rng = rand::thread_rng();
	let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
	let slug: String = rng.sample_iter(&Alphanumeric).take(4).map(char::from).collect();
	format!("{name}-{adjective}-{slug}")
}
