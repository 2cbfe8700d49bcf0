use appcache_engine::{AppCacheEvent, CacheId, FrontendSink, HostId, Status};
use tokio::sync::mpsc;

/// Notification forwarded from the engine to the command loop.
#[derive(Debug)]
pub enum SinkMessage {
    CacheSelected {
        cache_id: Option<CacheId>,
        status: Status,
    },
    StatusChanged(Status),
    Event(AppCacheEvent),
}

/// Forwards every notification for the CLI's single host to a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, message: SinkMessage) {
        // The receiver is gone once the command has finished.
        let _ = self.tx.send(message);
    }
}

impl FrontendSink for ChannelSink {
    fn on_cache_selected(&self, _host_id: HostId, cache_id: Option<CacheId>, status: Status) {
        self.forward(SinkMessage::CacheSelected { cache_id, status });
    }

    fn on_status_changed(&self, _host_ids: &[HostId], status: Status) {
        self.forward(SinkMessage::StatusChanged(status));
    }

    fn on_event_raised(&self, _host_ids: &[HostId], event: &AppCacheEvent) {
        self.forward(SinkMessage::Event(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_cache_selected(HostId(1), None, Status::Uncached);
        sink.on_event_raised(&[HostId(1)], &AppCacheEvent::Checking);
        sink.on_status_changed(&[HostId(1)], Status::Idle);

        assert!(matches!(
            rx.recv().await,
            Some(SinkMessage::CacheSelected {
                cache_id: None,
                status: Status::Uncached
            })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SinkMessage::Event(AppCacheEvent::Checking))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SinkMessage::StatusChanged(Status::Idle))
        ));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_status_changed(&[HostId(1)], Status::Idle);
    }
}
