use crate::error::{ErrorKind, Result};
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use std::collections::BTreeSet;
use tagmap_cache::{Completion, MappingScope, Mismatch, TagCache, TagServiceId};
use tokio_util::sync::CancellationToken;

/// Events emitted by [`sweep`].
///
/// A complete sweep reports every inconsistency it found (each one already
/// quarantined) and then [`Complete`](Self::Complete). A cancelled sweep
/// commits nothing and reports [`Cancelled`](Self::Cancelled) instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEvent {
    Started,
    LookupsInconsistent { service: TagServiceId, mismatches: BTreeSet<Mismatch> },
    ScopeInconsistent { scope: MappingScope, mismatches: BTreeSet<Mismatch> },
    Cancelled,
    Complete { scopes_checked: usize, services_checked: usize },
}

/// Compare every derived table with a rebuild.
pub fn sweep<'a>(cache: &'a TagCache, cancel: &'a CancellationToken) -> impl Stream<Item = Result<SweepEvent>> + 'a {
    stream!({
        yield Ok(SweepEvent::Started);
        let completion = match cache.check_consistency(cancel).await.or_raise(|| ErrorKind::Sweep) {
            Ok(completion) => completion,
            Err(e) => {
                yield Err(e);
                return;
            },
        };
        let Completion::Complete(report) = completion else {
            yield Ok(SweepEvent::Cancelled);
            return;
        };
        for (service, mismatches) in report.services {
            yield Ok(SweepEvent::LookupsInconsistent { service, mismatches });
        }
        for (scope, mismatches) in report.scopes {
            yield Ok(SweepEvent::ScopeInconsistent { scope, mismatches });
        }
        yield Ok(SweepEvent::Complete {
            scopes_checked: report.scopes_checked,
            services_checked: report.services_checked,
        });
    })
}

/// Events emitted by [`recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverEvent {
    Started,
    Repaired(MappingScope),
    Complete(usize),
}

/// Regenerate every quarantined scope.
pub fn recover(cache: &TagCache) -> impl Stream<Item = Result<RecoverEvent>> + '_ {
    stream!({
        yield Ok(RecoverEvent::Started);
        let repaired = match cache.recover().await.or_raise(|| ErrorKind::Recover) {
            Ok(repaired) => repaired,
            Err(e) => {
                yield Err(e);
                return;
            },
        };
        let count = repaired.len();
        for scope in repaired {
            yield Ok(RecoverEvent::Repaired(scope));
        }
        yield Ok(RecoverEvent::Complete(count));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Fixture;
    use futures::StreamExt;

    #[tokio::test]
    async fn consistent_cache_sweeps_clean() {
        let fixture = Fixture::new(8).await;
        let cancel = CancellationToken::new();
        let events: Vec<SweepEvent> = sweep(&fixture.cache, &cancel).map(|event| event.unwrap()).collect().await;
        assert_eq!(
            events,
            vec![SweepEvent::Started, SweepEvent::Complete { scopes_checked: 2, services_checked: 1 }]
        );
    }

    #[tokio::test]
    async fn tampered_scope_is_found_and_recovered() {
        let fixture = Fixture::new(8).await;
        fixture.tamper_counts().await;

        let cancel = CancellationToken::new();
        let events: Vec<SweepEvent> = sweep(&fixture.cache, &cancel).map(|event| event.unwrap()).collect().await;
        let found: Vec<MappingScope> = events
            .iter()
            .filter_map(|event| match event {
                SweepEvent::ScopeInconsistent { scope, mismatches } => {
                    assert!(mismatches.contains(&Mismatch::DisplayCounts));
                    Some(*scope)
                },
                _ => None,
            })
            .collect();
        assert_eq!(found, vec![Fixture::SCOPE]);

        let events: Vec<RecoverEvent> = recover(&fixture.cache).map(|event| event.unwrap()).collect().await;
        assert_eq!(
            events,
            vec![RecoverEvent::Started, RecoverEvent::Repaired(Fixture::SCOPE), RecoverEvent::Complete(1)]
        );
        fixture.assert_consistent().await;
    }

    #[tokio::test]
    async fn cancelled_sweep_reports_it() {
        let fixture = Fixture::new(8).await;
        fixture.tamper_counts().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<SweepEvent> = sweep(&fixture.cache, &cancel).map(|event| event.unwrap()).collect().await;
        assert_eq!(events, vec![SweepEvent::Started, SweepEvent::Cancelled]);

        // Nothing was quarantined, so there's nothing to recover.
        let events: Vec<RecoverEvent> = recover(&fixture.cache).map(|event| event.unwrap()).collect().await;
        assert_eq!(events, vec![RecoverEvent::Started, RecoverEvent::Complete(0)]);
    }
}
