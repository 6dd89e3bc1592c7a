//! The host loop: a single thread delivering completion-sink callbacks and
//! scheduler events in the order they were produced.

use crate::task::{TaskEvent, TaskEventHandler};
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send>;
type HandlerList = Arc<RwLock<Vec<Box<dyn TaskEventHandler + Send + Sync>>>>;

enum HostMessage {
    Event(TaskEvent),
    Callback(Callback),
    Stop,
}

pub(crate) struct HostLoop {
    sender: UnboundedSender<HostMessage>,
    receiver: Mutex<Option<UnboundedReceiver<HostMessage>>>,
    handlers: HandlerList,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HostLoop {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            handlers: Arc::new(RwLock::new(Vec::new())),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self) -> std::io::Result<()> {
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        let handlers = self.handlers.clone();
        let thread = std::thread::Builder::new()
            .name("taskpool-host".to_string())
            .spawn(move || run(receiver, handlers))?;
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    pub(crate) fn add_handler(&self, handler: Box<dyn TaskEventHandler + Send + Sync>) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        if self.sender.send(HostMessage::Event(event)).is_err() {
            debug!("Host loop stopped, dropping event");
        }
    }

    pub(crate) fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(HostMessage::Callback(Box::new(callback))).is_err() {
            debug!("Host loop stopped, dropping callback");
        }
    }

    /// Deliver everything already posted, then stop the thread
    pub(crate) fn stop(&self) {
        let _ = self.sender.send(HostMessage::Stop);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("Host loop thread panicked");
            }
        }
    }
}

fn run(mut receiver: UnboundedReceiver<HostMessage>, handlers: HandlerList) {
    while let Some(message) = receiver.blocking_recv() {
        match message {
            HostMessage::Event(event) => {
                for handler in handlers.read().iter() {
                    if let Err(e) = handler.handle_event(&event) {
                        warn!("Event handler failed: {}", e);
                    }
                }
            }
            HostMessage::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    warn!("Completion callback panicked on the host loop");
                }
            }
            HostMessage::Stop => break,
        }
    }
    debug!("Host loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);

    impl TaskEventHandler for CountingHandler {
        fn handle_event(&self, _event: &TaskEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_delivers_in_order_before_stop() {
        let host = HostLoop::new();
        let count = Arc::new(AtomicUsize::new(0));
        host.add_handler(Box::new(CountingHandler(count.clone())));
        host.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            host.post(move || order.lock().push(i));
        }
        host.emit(TaskEvent::TaskEnqueued {
            task_id: TaskId::from_raw(1),
            priority: crate::task::Priority::High,
        });
        host.post(|| panic!("callback failure"));
        host.post({
            let order = order.clone();
            move || order.lock().push(5)
        });
        host.stop();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
