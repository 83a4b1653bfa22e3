use std::{io, thread};

use super::EventLoop;

/// Runs [`EventLoop::dispatch`] on a dedicated thread for as long as it lives.
///
/// Dropping the pump asks the loop to exit and joins the thread.
pub struct EventPumpThread {
    event_loop: EventLoop,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventPumpThread {
    pub fn new(event_loop: EventLoop) -> io::Result<Self> {
        let pumped = event_loop.clone();
        let thread = thread::Builder::new()
            .name("ct-fetch-event-pump".to_owned())
            .spawn(move || {
                // created up front so the first lookup does not pay for reading the system config
                let _ = pumped.dns();
                pumped.dispatch();
            })?;
        Ok(Self {
            event_loop,
            thread: Some(thread),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl Drop for EventPumpThread {
    fn drop(&mut self) {
        self.event_loop.loop_exit();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if EventLoop::on_event_thread() {
            tracing::error!("EventPumpThread dropped on a dispatching thread, not joining");
            return;
        }
        if thread.join().is_err() {
            tracing::error!("event pump thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::EventPumpThread;
    use crate::event_loop::EventLoop;

    #[test]
    fn runs_closures_until_dropped() {
        let event_loop = EventLoop::new().unwrap();
        let pump = EventPumpThread::new(event_loop.clone()).unwrap();

        let (tx, rx) = mpsc::channel();
        event_loop.add(move || {
            tx.send((EventLoop::on_event_thread(), std::thread::current().name().map(str::to_owned)))
                .unwrap();
        });
        let (on_event_thread, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(on_event_thread);
        assert_eq!(name.as_deref(), Some("ct-fetch-event-pump"));

        drop(pump);

        // the loop can be pumped again after the thread exited
        let (tx, rx) = mpsc::channel();
        event_loop.add(move || tx.send(()).unwrap());
        event_loop.dispatch_once();
        rx.try_recv().unwrap();
    }

    #[test]
    fn drop_without_work_returns() {
        let event_loop = EventLoop::new().unwrap();
        let pump = EventPumpThread::new(event_loop).unwrap();
        assert!(!EventLoop::on_event_thread());
        drop(pump);
    }
}
