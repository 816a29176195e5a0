//! Sentence domain model and assembly of raw backend results.
//!
//! A sentence is the unit relayed to the show controller. While the
//! backend is still revising an utterance it is an
//! [`ElaboratingSentence`] (stable and unstable text spans); once the
//! backend commits, a [`FinalizedSentence`] with word-level timing and a
//! confidence score terminates the identity.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};

use super::session::{FinalAlternative, ResultBatch};

/// Interim spans with a stability score above this are reported as
/// stable text that will no longer change.
const STABLE_THRESHOLD: f32 = 0.5;

/// Opaque identity of one logical sentence. Minted when a partial result
/// arrives with no identity open; retired when a final result lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SentenceId(Uuid);

impl SentenceId {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SentenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One recognized word with session-relative timing.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

/// One span of an in-progress utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceElement {
    pub text: String,
    /// Backend-confirmed; stable spans will not be revised.
    pub is_stable: bool,
}

/// An utterance the backend is still revising.
#[derive(Debug, Clone, PartialEq)]
pub struct ElaboratingSentence {
    pub id: SentenceId,
    /// Time since session start at which the identity was minted.
    pub start: Duration,
    pub elements: Vec<SentenceElement>,
}

impl ElaboratingSentence {
    /// Stable spans joined with single spaces, in batch order.
    pub fn stable_text(&self) -> String {
        join_elements(&self.elements, true)
    }

    /// Unstable spans joined with single spaces, in batch order.
    pub fn unstable_text(&self) -> String {
        join_elements(&self.elements, false)
    }
}

fn join_elements(elements: &[SentenceElement], stable: bool) -> String {
    elements
        .iter()
        .filter(|e| e.is_stable == stable)
        .map(|e| e.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A completed utterance; immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedSentence {
    pub id: SentenceId,
    pub start: Duration,
    pub end: Duration,
    pub words: Vec<Word>,
    /// Backend confidence in [0, 1].
    pub confidence: f32,
}

impl FinalizedSentence {
    /// The full committed text, word texts joined with single spaces.
    pub fn full_text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Elaborating(ElaboratingSentence),
    Finalized(FinalizedSentence),
}

impl Sentence {
    pub fn id(&self) -> SentenceId {
        match self {
            Sentence::Elaborating(s) => s.id,
            Sentence::Finalized(s) => s.id,
        }
    }

    pub fn start(&self) -> Duration {
        match self {
            Sentence::Elaborating(s) => s.start,
            Sentence::Finalized(s) => s.start,
        }
    }
}

/// Groups raw backend batches into sentences.
///
/// At most one identity is open at any time: an interim batch with no
/// open identity mints one, and a final batch always retires it, so the
/// next interim mints a fresh identity.
#[derive(Debug, Default)]
pub struct SentenceAssembler {
    open: Option<(SentenceId, Duration)>,
}

impl SentenceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shape one batch into a sentence.
    ///
    /// `now` is the elapsed time since session start; `stream_began` is
    /// the elapsed time at which the current streaming call opened (word
    /// offsets from the backend are relative to it). A final batch with
    /// no open identity fails with [`Error::NoOpenIdentity`] and leaves
    /// the assembler unchanged; an interim batch whose elements were all
    /// discarded yields `None`.
    pub fn handle_batch(
        &mut self,
        batch: ResultBatch,
        now: Duration,
        stream_began: Duration,
    ) -> Result<Option<Sentence>> {
        match batch {
            ResultBatch::Final(alternative) => {
                let (id, start) = self.open.take().ok_or(Error::NoOpenIdentity)?;
                Ok(Some(Sentence::Finalized(finalize(
                    id,
                    start,
                    now,
                    stream_began,
                    alternative,
                ))))
            }
            ResultBatch::Interim(elements) => {
                if elements.is_empty() {
                    return Ok(None);
                }
                let (id, start) = *self
                    .open
                    .get_or_insert_with(|| (SentenceId::mint(), now));
                let elements = elements
                    .into_iter()
                    .map(|e| SentenceElement {
                        text: e.transcript,
                        is_stable: e.stability > STABLE_THRESHOLD,
                    })
                    .collect();
                Ok(Some(Sentence::Elaborating(ElaboratingSentence {
                    id,
                    start,
                    elements,
                })))
            }
        }
    }
}

fn finalize(
    id: SentenceId,
    start: Duration,
    now: Duration,
    stream_began: Duration,
    alternative: FinalAlternative,
) -> FinalizedSentence {
    let words = alternative
        .words
        .into_iter()
        .map(|w| Word {
            start: stream_began + offset_duration(w.start_offset),
            end: stream_began + offset_duration(w.end_offset),
            text: w.word,
        })
        .collect();
    FinalizedSentence {
        id,
        start,
        end: now,
        words,
        confidence: alternative.confidence.clamp(0.0, 1.0),
    }
}

/// A word offset missing from the backend falls back to the beginning of
/// the streaming call.
fn offset_duration(seconds: Option<f64>) -> Duration {
    seconds
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::ZERO)
}
