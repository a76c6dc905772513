use tracing::debug;

use super::lookup::NodeLookupTask;
use super::task::{Task, TaskContext};

/// Recurring maintenance: looks up a random id in every stale bucket.
///
/// A bucket's staleness clock is reset when its lookup is spawned, not when
/// the lookup finishes.
#[derive(Debug, Default)]
pub struct BucketRefreshTask {
    finished: bool,
    force_refresh: bool,
}

impl BucketRefreshTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes every bucket on the next pass, stale or not.
    pub fn forced() -> Self {
        Self {
            finished: false,
            force_refresh: true,
        }
    }

    pub fn set_force_refresh(&mut self, force: bool) {
        self.force_refresh = force;
    }
}

impl Task for BucketRefreshTask {
    fn startup(&mut self, ctx: &mut TaskContext<'_>) {
        let mut targets = Vec::new();
        for bucket in ctx.table.buckets_mut() {
            if self.force_refresh || bucket.needs_refresh() {
                bucket.notify_update();
                targets.push(bucket.random_node_id());
            }
        }

        if !targets.is_empty() {
            debug!("Refreshing {} DHT buckets", targets.len());
        }
        for target in targets {
            ctx.spawn(Box::new(NodeLookupTask::new(target, ctx.config)));
        }

        self.force_refresh = false;
        self.finished = true;
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn reset(&mut self) {
        self.finished = false;
    }

    fn name(&self) -> &'static str {
        "bucket refresh"
    }
}
