// Typing indicators
// Local side: debounce keystrokes into one typing=true per burst and a single
// typing=false after a quiet period. Remote side: mirror what peers report,
// with a fallback expiry in case their "stopped typing" never arrives.

use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::UserId;
use super::EngineEvent;

/// A typing indicator the engine should publish for the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub peer: UserId,
    pub is_typing: bool,
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

impl TimerSlot {
    fn cancel(self) {
        self.handle.abort();
    }
}

pub struct TypingTracker {
    idle_after: Duration,
    remote_ttl: Duration,
    local: HashMap<UserId, TimerSlot>,
    remote: HashMap<UserId, bool>,
    remote_expiry: HashMap<UserId, TimerSlot>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TypingTracker {
    pub fn new(
        idle_after: Duration,
        remote_ttl: Duration,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        TypingTracker {
            idle_after,
            remote_ttl,
            local: HashMap::new(),
            remote: HashMap::new(),
            remote_expiry: HashMap::new(),
            next_generation: 0,
            events_tx,
        }
    }

    /// A local keystroke in the conversation with `peer`. Returns a typing=true
    /// signal only for the first keystroke of a burst; always restarts the
    /// idle countdown.
    pub fn notify_local_typing(&mut self, peer: UserId) -> Option<TypingSignal> {
        let generation = self.bump_generation();
        let handle = self.spawn_timer(
            self.idle_after,
            EngineEvent::LocalTypingIdle { peer, generation },
        );

        match self.local.insert(peer, TimerSlot { generation, handle }) {
            Some(previous) => {
                previous.cancel();
                None
            }
            None => {
                debug!("Local typing started for {}", peer);
                Some(TypingSignal { peer, is_typing: true })
            }
        }
    }

    /// Idle countdown fired. Only the newest countdown for a peer counts.
    pub fn local_idle(&mut self, peer: UserId, generation: u64) -> Option<TypingSignal> {
        match self.local.get(&peer) {
            Some(slot) if slot.generation == generation => {
                self.local.remove(&peer);
                debug!("Local typing stopped for {} (idle)", peer);
                Some(TypingSignal { peer, is_typing: false })
            }
            _ => None,
        }
    }

    /// End the typing window right away, e.g. because the message was sent.
    pub fn stop_local_typing(&mut self, peer: UserId) -> Option<TypingSignal> {
        self.local.remove(&peer).map(|slot| {
            slot.cancel();
            TypingSignal { peer, is_typing: false }
        })
    }

    pub fn is_local_typing(&self, peer: UserId) -> bool {
        self.local.contains_key(&peer)
    }

    /// A peer's typing notification. Returns true if the visible state changed.
    pub fn on_remote_typing(&mut self, peer: UserId, is_typing: bool) -> bool {
        if let Some(slot) = self.remote_expiry.remove(&peer) {
            slot.cancel();
        }
        let previous = self.remote.insert(peer, is_typing).unwrap_or(false);

        if is_typing {
            let generation = self.bump_generation();
            let handle = self.spawn_timer(
                self.remote_ttl,
                EngineEvent::RemoteTypingExpired { peer, generation },
            );
            self.remote_expiry.insert(peer, TimerSlot { generation, handle });
        }
        previous != is_typing
    }

    /// Fallback expiry fired. Returns true if it forced the state back to false.
    pub fn remote_expired(&mut self, peer: UserId, generation: u64) -> bool {
        match self.remote_expiry.get(&peer) {
            Some(slot) if slot.generation == generation => {
                self.remote_expiry.remove(&peer);
                self.remote.insert(peer, false);
                debug!("Typing indicator from {} expired without a stop", peer);
                true
            }
            _ => false,
        }
    }

    pub fn is_typing(&self, peer: UserId) -> bool {
        self.remote.get(&peer).copied().unwrap_or(false)
    }

    pub fn typing_peers(&self) -> Vec<UserId> {
        let mut peers: Vec<UserId> = self
            .remote
            .iter()
            .filter(|(_, typing)| **typing)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    pub fn clear(&mut self) {
        for (_, slot) in self.local.drain() {
            slot.cancel();
        }
        for (_, slot) in self.remote_expiry.drain() {
            slot.cancel();
        }
        self.remote.clear();
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn spawn_timer(&self, delay: Duration, event: EngineEvent) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(event);
        })
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn tracker() -> (TypingTracker, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TypingTracker::new(Duration::from_millis(2000), Duration::from_millis(5000), tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_keystroke_then_silence() {
        let (mut typing, mut rx) = tracker();
        let peer = UserId(2);
        let start = Instant::now();

        assert_eq!(
            typing.notify_local_typing(peer),
            Some(TypingSignal { peer, is_typing: true })
        );

        let signal = match rx.recv().await {
            Some(EngineEvent::LocalTypingIdle { peer, generation }) => typing.local_idle(peer, generation),
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(signal, Some(TypingSignal { peer, is_typing: false }));
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
        assert!(!typing.is_local_typing(peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_emits_true_once_and_false_once() {
        let (mut typing, mut rx) = tracker();
        let peer = UserId(2);
        let start = Instant::now();

        let mut emitted = Vec::new();
        for _ in 0..4 {
            emitted.extend(typing.notify_local_typing(peer));
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        assert_eq!(emitted, vec![TypingSignal { peer, is_typing: true }]);

        let mut stops = Vec::new();
        // Let every timer, cancelled or not, run out
        tokio::time::sleep(Duration::from_millis(5000)).await;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::LocalTypingIdle { peer, generation } = event {
                stops.extend(typing.local_idle(peer, generation));
            }
        }
        assert_eq!(stops, vec![TypingSignal { peer, is_typing: false }]);
        assert!(start.elapsed() >= Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_idle_generation_is_ignored() {
        let (mut typing, _rx) = tracker();
        let peer = UserId(2);
        typing.notify_local_typing(peer);
        typing.notify_local_typing(peer);

        // Generation 1 belonged to the first keystroke and was superseded
        assert_eq!(typing.local_idle(peer, 1), None);
        assert!(typing.is_local_typing(peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_local_typing_on_send() {
        let (mut typing, _rx) = tracker();
        let peer = UserId(2);
        assert_eq!(typing.stop_local_typing(peer), None);

        typing.notify_local_typing(peer);
        assert_eq!(
            typing.stop_local_typing(peer),
            Some(TypingSignal { peer, is_typing: false })
        );
        // Next keystroke opens a new window
        assert!(typing.notify_local_typing(peer).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_typing_expires_without_stop() {
        let (mut typing, mut rx) = tracker();
        let peer = UserId(3);
        let start = Instant::now();

        assert!(typing.on_remote_typing(peer, true));
        assert!(typing.is_typing(peer));
        assert_eq!(typing.typing_peers(), vec![peer]);

        match rx.recv().await {
            Some(EngineEvent::RemoteTypingExpired { peer, generation }) => {
                assert!(typing.remote_expired(peer, generation));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
        assert!(!typing.is_typing(peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_disarms_expiry() {
        let (mut typing, mut rx) = tracker();
        let peer = UserId(3);

        typing.on_remote_typing(peer, true);
        assert!(typing.on_remote_typing(peer, false));
        assert!(!typing.is_typing(peer));

        tokio::time::sleep(Duration::from_millis(6000)).await;
        assert!(rx.try_recv().is_err(), "cancelled expiry must not fire");
    }
}
