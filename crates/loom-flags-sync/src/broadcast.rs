// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Publish/subscribe for status changes.
//!
//! Each listener owns a bounded queue. Publishing never waits on a listener:
//! when a queue is full its oldest entry is dropped to make room, so a stalled
//! listener only ever loses its own history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Default number of undelivered statuses kept per listener.
pub const DEFAULT_LISTENER_CAPACITY: usize = 16;

/// Identifies a listener registered with a [`StatusBroadcaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of status values to any number of listeners.
///
/// Clones share the same listener set.
pub struct StatusBroadcaster<T> {
	inner: Arc<BroadcasterInner<T>>,
}

struct BroadcasterInner<T> {
	state: Mutex<BroadcasterState<T>>,
	capacity: usize,
}

struct BroadcasterState<T> {
	next_id: u64,
	listeners: HashMap<ListenerId, Arc<ListenerQueue<T>>>,
	closed: bool,
}

struct ListenerQueue<T> {
	items: Mutex<VecDeque<T>>,
	capacity: usize,
	closed: AtomicBool,
	dropped: AtomicU64,
	notify: Notify,
}

impl<T> ListenerQueue<T> {
	fn new(capacity: usize) -> Self {
		Self {
			items: Mutex::new(VecDeque::with_capacity(capacity)),
			capacity,
			closed: AtomicBool::new(false),
			dropped: AtomicU64::new(0),
			notify: Notify::new(),
		}
	}

	fn push(&self, value: T) {
		{
			let mut items = self.items.lock();
			while items.len() >= self.capacity {
				items.pop_front();
				self.dropped.fetch_add(1, Ordering::Relaxed);
			}
			items.push_back(value);
		}
		self.notify.notify_one();
	}

	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}
}

impl<T: Clone + Send + 'static> StatusBroadcaster<T> {
	/// Creates a broadcaster with the default per-listener capacity.
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_LISTENER_CAPACITY)
	}

	/// Creates a broadcaster whose listeners buffer at most `capacity` values.
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			inner: Arc::new(BroadcasterInner {
				state: Mutex::new(BroadcasterState {
					next_id: 0,
					listeners: HashMap::new(),
					closed: false,
				}),
				capacity: capacity.max(1),
			}),
		}
	}

	/// Registers a listener that receives every later broadcast.
	///
	/// Values broadcast before this call are never delivered to it. A listener
	/// added after [`close`](Self::close) is already closed.
	pub fn add_listener(&self) -> StatusListener<T> {
		let queue = Arc::new(ListenerQueue::new(self.inner.capacity));
		let mut state = self.inner.state.lock();
		let id = ListenerId(state.next_id);
		state.next_id += 1;

		if state.closed {
			queue.close();
		} else {
			state.listeners.insert(id, Arc::clone(&queue));
		}

		StatusListener { id, queue }
	}

	/// Unregisters a listener. Unknown or already removed ids are ignored.
	pub fn remove_listener(&self, id: ListenerId) {
		let removed = self.inner.state.lock().listeners.remove(&id);
		if let Some(queue) = removed {
			queue.close();
		}
	}

	/// Returns true if at least one listener is registered.
	pub fn has_listeners(&self) -> bool {
		!self.inner.state.lock().listeners.is_empty()
	}

	/// Delivers `value` to every current listener without blocking.
	///
	/// Does nothing once the broadcaster is closed.
	pub fn broadcast(&self, value: T) {
		let state = self.inner.state.lock();
		if state.closed {
			return;
		}
		for queue in state.listeners.values() {
			queue.push(value.clone());
		}
	}

	/// Closes every listener and rejects further broadcasts. Idempotent.
	pub fn close(&self) {
		let listeners = {
			let mut state = self.inner.state.lock();
			if state.closed {
				return;
			}
			state.closed = true;
			std::mem::take(&mut state.listeners)
		};
		debug!(listeners = listeners.len(), "Closing status broadcaster");
		for queue in listeners.values() {
			queue.close();
		}
	}
}

impl<T: Clone + Send + 'static> Default for StatusBroadcaster<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Clone for StatusBroadcaster<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> std::fmt::Debug for StatusBroadcaster<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.inner.state.lock();
		f.debug_struct("StatusBroadcaster")
			.field("listeners", &state.listeners.len())
			.field("closed", &state.closed)
			.finish()
	}
}

/// Receiving half of a broadcaster subscription.
pub struct StatusListener<T> {
	id: ListenerId,
	queue: Arc<ListenerQueue<T>>,
}

impl<T> StatusListener<T> {
	/// Returns the id used to unregister this listener.
	pub fn id(&self) -> ListenerId {
		self.id
	}

	/// Waits for the next value.
	///
	/// Returns `None` once the listener has been removed or the broadcaster
	/// closed and every queued value has been drained.
	pub async fn recv(&mut self) -> Option<T> {
		loop {
			if let Some(value) = self.try_recv() {
				return Some(value);
			}
			if self.queue.closed.load(Ordering::SeqCst) {
				return self.try_recv();
			}
			self.queue.notify.notified().await;
		}
	}

	/// Returns the next queued value without waiting.
	pub fn try_recv(&mut self) -> Option<T> {
		self.queue.items.lock().pop_front()
	}

	/// Number of values discarded because this listener fell behind.
	pub fn dropped(&self) -> u64 {
		self.queue.dropped.load(Ordering::Relaxed)
	}
}

impl<T> std::fmt::Debug for StatusListener<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StatusListener").field("id", &self.id).finish()
	}
}
