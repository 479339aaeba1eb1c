//! Recording delegates for asserting callback order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use spindle::{ConnectionDelegate, Error, Headers, RequestDelegate};

/// One recorded request callback.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Event {
    Response(Headers),
    Data(Bytes),
    Error(Error),
    End,
}

/// Captures request callbacks in delivery order.
pub struct RecordingDelegate {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

#[allow(dead_code)]
impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until at least `count` callbacks have been recorded.
    pub async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.events.lock().unwrap().len() >= count {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for delegate callbacks");
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_one();
    }
}

impl RequestDelegate for RecordingDelegate {
    fn on_response(&self, headers: Headers) {
        self.push(Event::Response(headers));
    }

    fn on_data(&self, data: Bytes) {
        self.push(Event::Data(data));
    }

    fn on_error(&self, error: Error) {
        self.push(Event::Error(error));
    }

    fn on_end(&self) {
        self.push(Event::End);
    }
}

/// Captures connection-level errors.
pub struct RecordingConnDelegate {
    errors: Mutex<Vec<Error>>,
    notify: Notify,
}

#[allow(dead_code)]
impl RecordingConnDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            errors: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().unwrap().clone()
    }

    pub async fn wait_for_error(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !self.errors.lock().unwrap().is_empty() {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("timed out waiting for connection error");
    }
}

impl ConnectionDelegate for RecordingConnDelegate {
    fn on_connection_error(&self, error: Error) {
        self.errors.lock().unwrap().push(error);
        self.notify.notify_one();
    }
}
