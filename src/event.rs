// This file is part of SEELE-CORE.
//
// Copyright (C) 2022 Seele Contributors.
//
// SEELE-CORE is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// SEELE-CORE is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with SEELE-CORE. If not, see <https://www.gnu.org/licenses/>.

//! In-process publish/subscribe bus for node lifecycle events.
//!
//! The bus is an explicit dependency handed to each component, never a global.
//! Every topic owns a bounded queue drained by a dedicated dispatcher task, so
//! listeners of one topic observe events in firing order while topics stay
//! independent. `fire` returns right after the enqueue; when a queue is full
//! the oldest event is dropped, since for head tracking only the latest entry
//! matters.

use crate::{
    base::{schema::Block, Mutex, RwLock},
    channel,
    crypto::Hash,
    Transaction,
};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Per-topic queue bound.
const TOPIC_QUEUE_BOUND: usize = 100;

/// Event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A chain head moved (new block or reorg).
    ChainHeaderChanged,
    /// The local miner sealed and persisted a block.
    BlockMined,
    /// A transaction entered one of the local pools.
    TxInserted,
    /// Synchronization lifecycle (start/done/failed).
    Downloader,
}

/// Events travelling on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    ChainHeaderChanged { chain_num: u64, head_hash: Hash },
    BlockMined { chain_num: u64, block: Block },
    TxInserted { chain_num: u64, tx: Transaction },
    DownloaderStart,
    DownloaderDone,
    DownloaderFailed,
}

impl Event {
    /// Topic an event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::ChainHeaderChanged { .. } => Topic::ChainHeaderChanged,
            Event::BlockMined { .. } => Topic::BlockMined,
            Event::TxInserted { .. } => Topic::TxInserted,
            Event::DownloaderStart | Event::DownloaderDone | Event::DownloaderFailed => {
                Topic::Downloader
            }
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct TopicQueue {
    tx: channel::Sender<Event>,
    /// Receiver clone kept to shed the oldest element on overflow.
    rx: channel::Receiver<Event>,
    listeners: Arc<RwLock<Vec<(String, Listener)>>>,
}

/// Process-local event bus.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<Topic, TopicQueue>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register a listener on a topic under the given identifier.
    /// A listener registered twice with the same id replaces the previous one.
    pub fn subscribe<F>(&self, topic: Topic, id: &str, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        debug!("[bus] '{}' subscribed to '{:?}'", id, topic);
        let mut topics = self.topics.lock();
        let queue = topics.entry(topic).or_insert_with(|| spawn_topic(topic));
        let mut listeners = queue.listeners.write();
        listeners.retain(|(lid, _)| lid != id);
        listeners.push((id.to_owned(), Arc::new(listener)));
    }

    /// Remove a listener from a topic.
    pub fn unsubscribe(&self, topic: Topic, id: &str) {
        debug!("[bus] '{}' unsubscribed from '{:?}'", id, topic);
        let topics = self.topics.lock();
        if let Some(queue) = topics.get(&topic) {
            queue.listeners.write().retain(|(lid, _)| lid != id);
        }
    }

    /// Publish an event.
    ///
    /// Returns as soon as the event has been enqueued on its topic queue; the
    /// listeners run later on the topic dispatcher task.
    pub fn fire(&self, event: Event) {
        let topic = event.topic();
        let mut topics = self.topics.lock();
        let queue = topics.entry(topic).or_insert_with(|| spawn_topic(topic));
        loop {
            match queue.tx.try_send(event.clone()) {
                Ok(()) => return,
                Err(channel::ChannelError::SendFull) => {
                    // Shed the oldest element, only the latest matters.
                    let _ = queue.rx.try_recv();
                }
                Err(_) => {
                    warn!("[bus] topic '{:?}' queue is closed", topic);
                    return;
                }
            }
        }
    }
}

fn spawn_topic(topic: Topic) -> TopicQueue {
    let (tx, rx) = channel::bounded_channel(TOPIC_QUEUE_BOUND);
    let listeners: Arc<RwLock<Vec<(String, Listener)>>> = Arc::new(RwLock::new(Vec::new()));

    let task_rx: channel::Receiver<Event> = rx.clone();
    let task_listeners = listeners.clone();
    async_std::task::spawn(async move {
        while let Ok(event) = task_rx.recv().await {
            let listeners = task_listeners.read().clone();
            for (id, listener) in listeners {
                let res = catch_unwind(AssertUnwindSafe(|| listener(&event)));
                if res.is_err() {
                    error!("[bus] listener '{}' panicked on '{:?}'", id, topic);
                }
            }
        }
        debug!("[bus] topic '{:?}' dispatcher terminated", topic);
    });

    TopicQueue { tx, rx, listeners }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..50 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not met in time");
    }

    #[test]
    fn fire_reaches_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(Topic::Downloader, "test", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.fire(Event::DownloaderStart);
        bus.fire(Event::DownloaderDone);

        wait_until(|| hits.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(Topic::Downloader, "test", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.fire(Event::DownloaderStart);
        wait_until(|| hits.load(Ordering::SeqCst) == 1);

        bus.unsubscribe(Topic::Downloader, "test");
        bus.fire(Event::DownloaderStart);
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_topic_order_is_preserved() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(Topic::ChainHeaderChanged, "test", move |event| {
            if let Event::ChainHeaderChanged { chain_num, .. } = event {
                seen_clone.lock().push(*chain_num);
            }
        });

        for i in 0..10 {
            bus.fire(Event::ChainHeaderChanged {
                chain_num: i,
                head_hash: Hash::default(),
            });
        }

        wait_until(|| seen.lock().len() == 10);
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn listener_panic_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(Topic::Downloader, "bad", |_| panic!("boom"));
        bus.subscribe(Topic::Downloader, "good", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.fire(Event::DownloaderStart);

        wait_until(|| hits.load(Ordering::SeqCst) == 1);
    }
}
