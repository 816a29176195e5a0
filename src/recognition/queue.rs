//! Thread-safe FIFO between the consume loop and the relay poll loop.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::sentence::Sentence;

/// Unbounded sentence FIFO. Pushes never block; pops never block. Order
/// of arrival is preserved for the consumer.
#[derive(Clone)]
pub struct ResultQueue {
    tx: Sender<Sentence>,
    rx: Receiver<Sentence>,
}

impl ResultQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, sentence: Sentence) {
        // Cannot fail while this queue (holding the receiver) is alive.
        let _ = self.tx.send(sentence);
    }

    /// The oldest queued sentence, if any.
    pub fn try_pop(&self) -> Option<Sentence> {
        self.rx.try_recv().ok()
    }
}

impl Default for ResultQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::sentence::{ElaboratingSentence, SentenceElement, SentenceId};
    use super::*;

    fn sentence(text: &str) -> Sentence {
        Sentence::Elaborating(ElaboratingSentence {
            id: SentenceId::mint(),
            start: Duration::ZERO,
            elements: vec![SentenceElement {
                text: text.to_string(),
                is_stable: false,
            }],
        })
    }

    #[test]
    fn preserves_push_order() {
        let queue = ResultQueue::new();
        queue.push(sentence("one"));
        queue.push(sentence("two"));
        queue.push(sentence("three"));

        let texts: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|s| match s {
                Sentence::Elaborating(e) => e.elements[0].text.clone(),
                Sentence::Finalized(_) => unreachable!(),
            })
            .collect();
        assert_eq!(texts, ["one", "two", "three"]);
    }

    #[test]
    fn pop_on_empty_is_none() {
        let queue = ResultQueue::new();
        assert!(queue.try_pop().is_none());
        queue.push(sentence("only"));
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }
}
