use std::time::Duration;

use appset_core::ApplicationSet;
use appset_generators::{min_duration, GeneratorRegistry};
use appset_kubehub::DestinationSnapshot;

/// Next wake-up for `set`: the smallest preference among its generators.
/// `None` when no generator asks for a periodic requeue.
pub fn min_requeue(
    set: &ApplicationSet,
    generators: &GeneratorRegistry,
    snapshot: &DestinationSnapshot,
) -> Option<Duration> {
    min_duration(set.spec.generators.iter().map(|g| generators.requeue_after(g, snapshot)))
}

/// Exponential backoff for the `failures`-th consecutive failure, capped at `max`.
pub fn backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures.saturating_sub(1).min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}
