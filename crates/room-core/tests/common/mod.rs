//! Shared helpers for room integration tests.
#![allow(dead_code)]

use room_core::{
    Channel, ChannelEvent, ChannelProvider, EventBus, MemoryNetwork, MemoryProvider, PeerId,
    Room, RoomConfig, RoomEvent, RoomMessage, Subscription,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn peer(id: &str) -> PeerId {
    id.parse().unwrap()
}

/// Let every queued message be processed (paused clock: costs no real time).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Captures every event a room emits.
pub struct Recorder {
    events: Arc<Mutex<Vec<RoomEvent>>>,
    _subscription: Subscription,
}

impl Recorder {
    pub fn attach(bus: &Arc<EventBus>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = bus.subscribe_all(move |event| sink.lock().unwrap().push(event));
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<RoomEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn contains(&self, event: &RoomEvent) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == event)
    }

    pub fn count(&self, predicate: impl Fn(&RoomEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

pub async fn room(network: &MemoryNetwork, id: &str) -> (Room, Recorder) {
    room_with(network, id, RoomConfig::default()).await
}

pub async fn room_with(network: &MemoryNetwork, id: &str, config: RoomConfig) -> (Room, Recorder) {
    init_tracing();
    let bus = Arc::new(EventBus::new());
    let recorder = Recorder::attach(&bus);
    let provider = Arc::new(network.provider(peer(id)));
    let room = Room::init_with_events(provider, config, bus).await.unwrap();
    (room, recorder)
}

/// A bare endpoint driven by hand, for playing a scripted host.
pub struct RawPeer {
    pub provider: MemoryProvider,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl RawPeer {
    pub async fn register(network: &MemoryNetwork, id: &str) -> Self {
        let provider = network.provider(peer(id));
        let (tx, events) = mpsc::unbounded_channel();
        provider.register(tx).await.unwrap();
        Self { provider, events }
    }

    /// Wait for the next inbound channel.
    pub async fn accept(&mut self) -> Arc<dyn Channel> {
        loop {
            match self.events.recv().await {
                Some(ChannelEvent::Inbound(channel)) => return channel,
                Some(_) => continue,
                None => panic!("raw peer event stream ended"),
            }
        }
    }

    /// Decoded messages received so far.
    pub fn drain_messages(&mut self) -> Vec<RoomMessage> {
        let mut messages = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ChannelEvent::Data(_, data) = event {
                messages.push(RoomMessage::from_json(&data).unwrap());
            }
        }
        messages
    }
}

pub fn send(channel: &Arc<dyn Channel>, message: &RoomMessage) {
    channel.send(&message.to_json()).unwrap();
}
