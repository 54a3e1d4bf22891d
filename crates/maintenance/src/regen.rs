use crate::error::{ErrorKind, Result};
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use tagmap_cache::{SyncProgress, TagCache, TagServiceId};
use tokio_util::sync::CancellationToken;

/// Progress events emitted by [`regenerate`] and [`resume`].
///
/// Per service, events follow a strict ordering:
/// 1. [`Queued`](Self::Queued), only from [`regenerate`].
/// 2. [`Chunk`](Self::Chunk), zero or more times, one per committed chunk.
/// 3. [`Synced`](Self::Synced) once the service's queue is empty.
///
/// [`Cancelled`](Self::Cancelled) ends the stream early; every chunk reported
/// before it is committed and the rest stays queued for [`resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenEvent {
    Queued { service: TagServiceId, tags: u64 },
    Chunk { service: TagServiceId, progress: SyncProgress },
    Synced(TagServiceId),
    Cancelled { service: TagServiceId, remaining: u64 },
}

/// Queue every chain tag of `services` and regenerate them one committed
/// chunk at a time.
pub fn regenerate<'a>(
    cache: &'a TagCache,
    services: Vec<TagServiceId>,
    cancel: &'a CancellationToken,
) -> impl Stream<Item = Result<RegenEvent>> + 'a {
    drain(cache, services, cancel, true)
}

/// Carry on with whatever an earlier [`regenerate`] left queued.
pub fn resume<'a>(
    cache: &'a TagCache,
    services: Vec<TagServiceId>,
    cancel: &'a CancellationToken,
) -> impl Stream<Item = Result<RegenEvent>> + 'a {
    drain(cache, services, cancel, false)
}

fn drain<'a>(
    cache: &'a TagCache,
    services: Vec<TagServiceId>,
    cancel: &'a CancellationToken,
    queue: bool,
) -> impl Stream<Item = Result<RegenEvent>> + 'a {
    stream!({
        for service in services {
            if queue {
                match cache.queue_regen(service).await.or_raise(|| ErrorKind::Regenerate) {
                    Ok(tags) => yield Ok(RegenEvent::Queued { service, tags }),
                    Err(e) => {
                        yield Err(e);
                        return;
                    },
                }
            }
            loop {
                if cancel.is_cancelled() {
                    tracing::info!(service = %service, "Chain regeneration cancelled");
                    let remaining = cache.queued(service).await.or_raise(|| ErrorKind::Regenerate);
                    yield remaining.map(|remaining| RegenEvent::Cancelled { service, remaining });
                    return;
                }
                let progress = match cache.sync_chunk(service).await.or_raise(|| ErrorKind::Regenerate) {
                    Ok(progress) => progress,
                    Err(e) => {
                        yield Err(e);
                        return;
                    },
                };
                if progress.processed > 0 {
                    yield Ok(RegenEvent::Chunk { service, progress });
                }
                if progress.is_done() {
                    break;
                }
            }
            yield Ok(RegenEvent::Synced(service));
        }
    })
}
