//! The turn state machine.
//!
//! `transition` is a pure function from `(state, event)` to the next state
//! plus the commands the engine must execute. It never touches devices or
//! the network, so the whole table is testable without a timer or I/O.
//!
//! ```text
//!            SpeechEnded                ResponseReady
//! Listening ───────────► Thinking ─────────────────► Speaking
//!     ▲                     │  empty transcript          │
//!     │                     │  stage failure             │ PlaybackEnded
//!     └─────────────────────┴────────────────────────────┘ PlaybackFailed
//!                                                          Synthesize failure
//!
//! any non-Ended state ── EndCall ──► Ended (absorbing)
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    audio::Recording, error::PipelineStage, playback::SynthesizedAudio,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Listening,
    Thinking,
    Speaking,
    Ended,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine: detector output and stage completions.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    SpeechEnded,
    RecordingReady(Recording),
    TranscriptReady(String),
    ResponseReady(String),
    AudioReady(SynthesizedAudio),
    StageFailed(PipelineStage, String),
    PlaybackEnded,
    PlaybackFailed(String),
    EndCall,
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SpeechEnded => "speech_ended",
            Self::RecordingReady(_) => "recording_ready",
            Self::TranscriptReady(_) => "transcript_ready",
            Self::ResponseReady(_) => "response_ready",
            Self::AudioReady(_) => "audio_ready",
            Self::StageFailed(..) => "stage_failed",
            Self::PlaybackEnded => "playback_ended",
            Self::PlaybackFailed(_) => "playback_failed",
            Self::EndCall => "end_call",
        }
    }

    /// Human-readable reason for a failure event, `None` otherwise.
    pub fn failure(&self) -> Option<String> {
        match self {
            Self::StageFailed(stage, message) => Some(format!("{stage} failed: {message}")),
            Self::PlaybackFailed(message) => Some(format!("playback failed: {message}")),
            _ => None,
        }
    }
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnCommand {
    StopRecording,
    Transcribe(Recording),
    Respond(String),
    Synthesize(String),
    Play(SynthesizedAudio),
    StartRecording,
    ReleaseAll,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    /// `None` when the event does not change the state.
    pub next: Option<TurnState>,
    pub commands: Vec<TurnCommand>,
}

impl Transition {
    fn ignore() -> Self {
        Self::default()
    }

    fn stay(commands: Vec<TurnCommand>) -> Self {
        Self {
            next: None,
            commands,
        }
    }

    fn to(next: TurnState, commands: Vec<TurnCommand>) -> Self {
        Self {
            next: Some(next),
            commands,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.next.is_none() && self.commands.is_empty()
    }
}

pub fn transition(state: TurnState, event: TurnEvent) -> Transition {
    use TurnCommand as C;
    use TurnEvent as E;
    use TurnState as S;

    match (state, event) {
        (S::Ended, _) => Transition::ignore(),
        (_, E::EndCall) => Transition::to(S::Ended, vec![C::ReleaseAll]),

        (S::Listening, E::SpeechEnded) => Transition::to(S::Thinking, vec![C::StopRecording]),

        (S::Thinking, E::RecordingReady(recording)) => {
            Transition::stay(vec![C::Transcribe(recording)])
        }
        (S::Thinking, E::TranscriptReady(text)) => {
            if text.trim().is_empty() {
                Transition::to(S::Listening, vec![C::StartRecording])
            } else {
                Transition::stay(vec![C::Respond(text)])
            }
        }
        (S::Thinking, E::ResponseReady(text)) => {
            Transition::to(S::Speaking, vec![C::Synthesize(text)])
        }
        (S::Thinking, E::StageFailed(..)) => {
            Transition::to(S::Listening, vec![C::StartRecording])
        }

        (S::Speaking, E::AudioReady(audio)) => Transition::stay(vec![C::Play(audio)]),
        (S::Speaking, E::StageFailed(PipelineStage::Synthesize, _))
        | (S::Speaking, E::PlaybackEnded)
        | (S::Speaking, E::PlaybackFailed(_)) => {
            Transition::to(S::Listening, vec![C::StartRecording])
        }

        _ => Transition::ignore(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> Recording {
        Recording {
            mime_type: "audio/wav".into(),
            data: vec![1, 2, 3],
        }
    }

    fn audio() -> SynthesizedAudio {
        SynthesizedAudio {
            bytes: vec![9],
            format: "mp3".into(),
        }
    }

    fn all_events() -> Vec<TurnEvent> {
        vec![
            TurnEvent::SpeechEnded,
            TurnEvent::RecordingReady(recording()),
            TurnEvent::TranscriptReady("hi".into()),
            TurnEvent::ResponseReady("hello".into()),
            TurnEvent::AudioReady(audio()),
            TurnEvent::StageFailed(PipelineStage::Respond, "boom".into()),
            TurnEvent::PlaybackEnded,
            TurnEvent::PlaybackFailed("device".into()),
            TurnEvent::EndCall,
        ]
    }

    #[test]
    fn full_turn_walks_the_cycle() {
        let t = transition(TurnState::Listening, TurnEvent::SpeechEnded);
        assert_eq!(t.next, Some(TurnState::Thinking));
        assert_eq!(t.commands, vec![TurnCommand::StopRecording]);

        let t = transition(TurnState::Thinking, TurnEvent::RecordingReady(recording()));
        assert_eq!(t.next, None);
        assert_eq!(t.commands, vec![TurnCommand::Transcribe(recording())]);

        let t = transition(TurnState::Thinking, TurnEvent::TranscriptReady("hi".into()));
        assert_eq!(t.commands, vec![TurnCommand::Respond("hi".into())]);

        let t = transition(TurnState::Thinking, TurnEvent::ResponseReady("hello".into()));
        assert_eq!(t.next, Some(TurnState::Speaking));
        assert_eq!(t.commands, vec![TurnCommand::Synthesize("hello".into())]);

        let t = transition(TurnState::Speaking, TurnEvent::AudioReady(audio()));
        assert_eq!(t.commands, vec![TurnCommand::Play(audio())]);

        let t = transition(TurnState::Speaking, TurnEvent::PlaybackEnded);
        assert_eq!(t.next, Some(TurnState::Listening));
        assert_eq!(t.commands, vec![TurnCommand::StartRecording]);
    }

    #[test]
    fn empty_transcript_returns_to_listening_without_dialogue() {
        for text in ["", "   ", "\n"] {
            let t = transition(TurnState::Thinking, TurnEvent::TranscriptReady(text.into()));
            assert_eq!(t.next, Some(TurnState::Listening));
            assert_eq!(t.commands, vec![TurnCommand::StartRecording]);
        }
    }

    #[test]
    fn stage_failures_recover_to_listening() {
        for stage in [
            PipelineStage::Transcribe,
            PipelineStage::Respond,
            PipelineStage::Synthesize,
        ] {
            let t = transition(TurnState::Thinking, TurnEvent::StageFailed(stage, "x".into()));
            assert_eq!(t.next, Some(TurnState::Listening));
            assert_eq!(t.commands, vec![TurnCommand::StartRecording]);
        }

        let t = transition(
            TurnState::Speaking,
            TurnEvent::StageFailed(PipelineStage::Synthesize, "tts down".into()),
        );
        assert_eq!(t.next, Some(TurnState::Listening));

        let t = transition(TurnState::Speaking, TurnEvent::PlaybackFailed("x".into()));
        assert_eq!(t.next, Some(TurnState::Listening));
        assert_eq!(t.commands, vec![TurnCommand::StartRecording]);
    }

    #[test]
    fn end_call_from_every_live_state() {
        for state in [TurnState::Listening, TurnState::Thinking, TurnState::Speaking] {
            let t = transition(state, TurnEvent::EndCall);
            assert_eq!(t.next, Some(TurnState::Ended));
            assert_eq!(t.commands, vec![TurnCommand::ReleaseAll]);
        }
    }

    #[test]
    fn ended_is_absorbing() {
        for event in all_events() {
            assert!(transition(TurnState::Ended, event).is_ignored());
        }
    }

    #[test]
    fn only_listening_entries_start_recording() {
        for state in [TurnState::Listening, TurnState::Thinking, TurnState::Speaking] {
            for event in all_events() {
                let t = transition(state, event);
                if t.commands.contains(&TurnCommand::StartRecording) {
                    assert_eq!(t.next, Some(TurnState::Listening));
                }
            }
        }
    }

    #[test]
    fn stray_events_are_ignored() {
        assert!(transition(TurnState::Listening, TurnEvent::PlaybackEnded).is_ignored());
        let late_reply = TurnEvent::ResponseReady("x".into());
        assert!(transition(TurnState::Listening, late_reply).is_ignored());
        assert!(transition(TurnState::Thinking, TurnEvent::SpeechEnded).is_ignored());
        assert!(transition(TurnState::Speaking, TurnEvent::SpeechEnded).is_ignored());
        assert!(transition(
            TurnState::Speaking,
            TurnEvent::StageFailed(PipelineStage::Respond, "late".into())
        )
        .is_ignored());
    }

    #[test]
    fn only_failures_carry_a_reason() {
        assert_eq!(
            TurnEvent::StageFailed(PipelineStage::Respond, "HTTP 502".into()).failure(),
            Some("respond failed: HTTP 502".to_string())
        );
        assert_eq!(
            TurnEvent::PlaybackFailed("bad mp3".into()).failure(),
            Some("playback failed: bad mp3".to_string())
        );
        assert_eq!(TurnEvent::PlaybackEnded.failure(), None);
        assert_eq!(TurnEvent::TranscriptReady(String::new()).failure(), None);
    }
}
