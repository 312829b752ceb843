//! Multi-producer, single-consumer command bus.
//!
//! Every worker's capability pump holds a [`CommandSender`]; the event
//! dispatcher owns the only [`CommandReceiver`] and polls it without
//! blocking once per tick.
//!
//! Built on [`tokio::sync::mpsc::unbounded_channel`], so:
//!
//! | Operation | Behaviour |
//! |---|---|
//! | [`CommandSender::put`] | Never blocks, never fails while the hub is alive |
//! | [`CommandReceiver::try_get`] | Returns `None` immediately when empty |
//! | Ordering | FIFO per producer; no ordering across producers |

use robohub_types::{Command, Identifier};
use tokio::sync::mpsc;
use tracing::debug;

/// Item carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A well-formed plugin command.
    Command(Command),
    /// A plugin named a verb outside the closed set.  The dispatcher treats
    /// this as fatal.
    UnknownVerb { origin: Identifier, verb: String },
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        Envelope::Command(command)
    }
}

/// Constructor namespace for the bus halves.
pub struct CommandBus;

impl CommandBus {
    /// Create a connected sender/receiver pair.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (CommandSender, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CommandSender { tx }, CommandReceiver { rx })
    }
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Cloneable producer handle.  One clone per worker.
#[derive(Clone, Debug)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl CommandSender {
    /// Enqueue `envelope`.
    ///
    /// Once the dispatcher has shut down the item is dropped; workers are
    /// being torn down at that point, so this is logged at debug level only.
    pub fn put(&self, envelope: impl Into<Envelope>) {
        if let Err(mpsc::error::SendError(dropped)) = self.tx.send(envelope.into()) {
            debug!(?dropped, "command bus closed; dropping item");
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// The single consumer handle, owned by the event dispatcher.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl CommandReceiver {
    /// Non-blocking poll.  Returns `None` when nothing is queued.
    pub fn try_get(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Every item ready right now, in arrival order.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut ready = Vec::new();
        while let Some(envelope) = self.try_get() {
            ready.push(envelope);
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robohub_types::Verb;

    fn origin(id: &str) -> Identifier {
        Identifier::new(id, "tester", "Test Plugin")
    }

    fn message(id: &str, text: &str) -> Command {
        Command::new(origin(id), Verb::SendMessage(text.to_string()))
    }

    #[test]
    fn empty_bus_returns_none() {
        let (_tx, mut rx) = CommandBus::new();
        assert!(rx.try_get().is_none());
    }

    #[test]
    fn single_producer_order_is_preserved() {
        let (tx, mut rx) = CommandBus::new();
        for i in 0..50 {
            tx.put(message("a", &i.to_string()));
        }

        let received: Vec<String> = rx
            .drain()
            .into_iter()
            .map(|e| match e {
                Envelope::Command(Command {
                    verb: Verb::SendMessage(text),
                    ..
                }) => text,
                other => panic!("unexpected envelope: {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn multiple_producers_keep_per_producer_order() {
        let (tx, mut rx) = CommandBus::new();
        let mut handles = Vec::new();
        for producer in ["a", "b", "c"] {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    tx.put(message(producer, &i.to_string()));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let all = rx.drain();
        assert_eq!(all.len(), 60);
        for producer in ["a", "b", "c"] {
            let seq: Vec<i32> = all
                .iter()
                .filter_map(|e| match e {
                    Envelope::Command(Command {
                        origin,
                        verb: Verb::SendMessage(text),
                    }) if origin.module_id == producer => text.parse().ok(),
                    _ => None,
                })
                .collect();
            assert_eq!(seq, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn put_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = CommandBus::new();
        drop(rx);
        tx.put(message("a", "late"));
    }

    #[test]
    fn unknown_verb_travels_on_the_bus() {
        let (tx, mut rx) = CommandBus::new();
        tx.put(Envelope::UnknownVerb {
            origin: origin("x"),
            verb: "dance".into(),
        });
        tx.put(Command::new(
            origin("x"),
            Verb::Event {
                name: "wave".into(),
                payload: serde_json::json!({"hand": "left"}),
            },
        ));
        assert!(matches!(rx.try_get(), Some(Envelope::UnknownVerb { .. })));
        assert!(matches!(rx.try_get(), Some(Envelope::Command(_))));
        assert!(rx.try_get().is_none());
    }
}
