//! Operator input abstraction (§4.7 Driver traits, §6 Operator surface).
//! The gpio-backed encoder is an out-of-scope external collaborator; the
//! coordinator consumes only [`InputSource`].

use tokio::sync::mpsc;

/// A raw operator action (§6: short press ≥50 ms and <1 s, long press
/// ≥1 s; exactly 1 s resolves as long-press per §8 boundary behavior).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Rotate(i8),
    ShortPress,
    LongPress,
}

pub trait InputSource: Send {
    /// Awaits the next input event, or `None` once the source is closed.
    fn next(&mut self) -> impl std::future::Future<Output = Option<InputEvent>> + Send;
}

/// An `mpsc`-backed input source: the real binary feeds it from a gpio
/// poller task, tests and `--simulate` mode feed it directly.
pub struct ChannelInput {
    rx: mpsc::Receiver<InputEvent>,
}

impl ChannelInput {
    pub fn new(capacity: usize) -> (mpsc::Sender<InputEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

impl InputSource for ChannelInput {
    async fn next(&mut self) -> Option<InputEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_events_in_order() {
        let (tx, mut input) = ChannelInput::new(4);
        tx.send(InputEvent::Rotate(1)).await.unwrap();
        tx.send(InputEvent::ShortPress).await.unwrap();
        assert_eq!(input.next().await, Some(InputEvent::Rotate(1)));
        assert_eq!(input.next().await, Some(InputEvent::ShortPress));
    }

    #[tokio::test]
    async fn closed_channel_yields_none() {
        let (tx, mut input) = ChannelInput::new(1);
        drop(tx);
        assert_eq!(input.next().await, None);
    }
}
