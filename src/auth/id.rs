//! Session Identifiers
//!
//! Human-readable ids such as `amber-falcon-3fa2`. Meant to tell sessions
//! apart in logs, not to be unguessable.

use rand::seq::SliceRandom;
use std::time::{SystemTime, UNIX_EPOCH};

const WORDS: &[&str] = &[
    "amber", "anchor", "arrow", "aspen", "autumn", "badger", "basil", "birch", "bison", "blaze",
    "breeze", "brook", "canyon", "cedar", "cinder", "clover", "comet", "coral", "cosmic", "crane",
    "crimson", "dawn", "delta", "dune", "ember", "falcon", "fern", "fjord", "flint", "frost",
    "gale", "garnet", "glacier", "granite", "harbor", "hazel", "heron", "indigo", "iris", "ivory",
    "jasper", "juniper", "kestrel", "lagoon", "lark", "lotus", "lunar", "maple", "meadow", "mesa",
    "misty", "nimbus", "oak", "onyx", "orbit", "otter", "pebble", "pine", "prairie", "quartz",
    "quiet", "raven", "reef", "ridge", "river", "sable", "saffron", "sage", "shadow", "sierra",
    "silver", "solar", "sparrow", "spruce", "storm", "summit", "swift", "thistle", "thunder",
    "tide", "timber", "topaz", "tundra", "velvet", "willow", "winter", "wren", "zephyr",
];

const WORD_COUNT: usize = 2;

/// Generate a new session id
pub fn unique_id() -> String {
    let mut rng = rand::thread_rng();
    let phrase: Vec<&str> = (0..WORD_COUNT)
        .filter_map(|_| WORDS.choose(&mut rng).copied())
        .collect();

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    format!("{}-{:04x}", phrase.join("-"), nanos as u16)
}
