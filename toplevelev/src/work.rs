//! Hand-off queue between the Wayland dispatch thread and the X11 bridge
//! thread.
//!
//! The dispatch thread appends commands and rings the wakeup ping; the
//! bridge thread drains the queue from inside its poll loop. Commands carry
//! owned snapshots of everything the bridge needs, so no registry state is
//! ever read from the bridge thread.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use calloop::ping::{Ping, PingSource, make_ping};

/// One mirroring step, captured as values at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorCommand {
    /// Create the placeholder window for a freshly listed toplevel.
    Create {
        toplevel: u64,
        title: String,
        app_id: String,
    },
    /// Re-title an existing placeholder window.
    SetTitle { toplevel: u64, title: String },
    /// Tear down the placeholder window, if one was ever created.
    Destroy { toplevel: u64 },
    /// Last command of the program; makes the bridge loop return.
    Shutdown,
}

/// Mutex-guarded FIFO plus a ping used to interrupt the bridge poll.
///
/// Multiple pending commands may collapse into a single wakeup, but every
/// command is still drained exactly once, in enqueue order.
pub struct WorkQueue {
    commands: Mutex<VecDeque<MirrorCommand>>,
    wakeup: Ping,
}

impl WorkQueue {
    /// Create the queue together with the ping source the bridge loop
    /// registers as its wakeup channel.
    pub fn new() -> std::io::Result<(Arc<Self>, PingSource)> {
        let (wakeup, source) = make_ping()?;
        let queue = Arc::new(WorkQueue {
            commands: Mutex::new(VecDeque::new()),
            wakeup,
        });
        Ok((queue, source))
    }

    /// Append a command and wake the bridge thread.
    pub fn push(&self, command: MirrorCommand) {
        self.commands
            .lock()
            .expect("work queue poisoned")
            .push_back(command);
        self.wakeup.ping();
    }

    /// Move all pending commands out of the queue. The lock is held only
    /// for the copy; execution happens on the caller's side.
    pub fn drain(&self) -> Vec<MirrorCommand> {
        self.commands
            .lock()
            .expect("work queue poisoned")
            .drain(..)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn drains_in_enqueue_order() {
        let (queue, _source) = WorkQueue::new().unwrap();
        queue.push(MirrorCommand::Create {
            toplevel: 1,
            title: "one".into(),
            app_id: "app".into(),
        });
        queue.push(MirrorCommand::SetTitle {
            toplevel: 1,
            title: "two".into(),
        });
        queue.push(MirrorCommand::Destroy { toplevel: 1 });

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[0], MirrorCommand::Create { .. }));
        assert!(matches!(drained[1], MirrorCommand::SetTitle { .. }));
        assert!(matches!(drained[2], MirrorCommand::Destroy { .. }));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn concurrent_enqueue_never_drops_or_duplicates() {
        const COUNT: u64 = 1000;
        let (queue, _source) = WorkQueue::new().unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for toplevel in 0..COUNT {
                    queue.push(MirrorCommand::Destroy { toplevel });
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < COUNT as usize {
            for command in queue.drain() {
                let MirrorCommand::Destroy { toplevel } = command else {
                    panic!("unexpected command");
                };
                seen.push(toplevel);
            }
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..COUNT).collect::<Vec<_>>());
        assert!(queue.drain().is_empty());
    }
}
