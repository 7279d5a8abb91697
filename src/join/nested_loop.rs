//! Index-free join: every window against every streamed object.

use super::{DedupParams, JoinStats, JoinStream, Matcher};
use crate::geometry::SpatialObject;
use std::sync::Arc;

/// Materializes the left (window) side, then streams the right (object)
/// side once, testing each object against every window.
///
/// Cost is `O(n * m)` per unit of work. It is the fallback when no index
/// is requested.
#[derive(Debug, Clone)]
pub struct NestedLoopJudgement {
    matcher: Matcher,
}

impl NestedLoopJudgement {
    pub fn new(consider_boundary_intersection: bool, dedup: Option<Arc<DedupParams>>) -> Self {
        Self {
            matcher: Matcher::new(consider_boundary_intersection, dedup),
        }
    }

    pub fn run<'a, L, R, IL, IR>(&self, left: IL, right: IR) -> JoinStream<'a, L, R>
    where
        L: SpatialObject + Clone + 'a,
        R: SpatialObject + Clone + 'a,
        IL: IntoIterator<Item = L>,
        IR: IntoIterator<Item = R>,
        IR::IntoIter: 'a,
    {
        let windows: Vec<L> = left.into_iter().collect();
        let mut objects = right.into_iter().peekable();
        if windows.is_empty() || objects.peek().is_none() {
            return JoinStream::empty();
        }

        log::debug!(
            "{}Nested loop {} join over {} windows",
            self.matcher.log_prefix(),
            self.matcher.predicate(),
            windows.len()
        );

        let matcher = self.matcher.clone();
        JoinStream::new(JoinStats::default(), move |stats| {
            for object in objects.by_ref() {
                stats.stream_count += 1;
                let mut batch = Vec::new();
                for window in &windows {
                    stats.candidate_count += 1;
                    if matcher.matches(window, &object, stats) {
                        batch.push((window.clone(), object.clone()));
                    }
                }
                if !batch.is_empty() {
                    stats.result_count += batch.len() as u64;
                    return Some(batch);
                }
            }
            None
        })
    }
}
